//! Topic pattern matching for the in-memory broker.
//!
//! `*` matches exactly one dot-separated word, `#` matches zero or more.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSegment {
    Word(String),
    SingleWildcard,
    MultiWildcard,
}

pub fn parse_topic(pattern: &str) -> Vec<TopicSegment> {
    pattern
        .split('.')
        .map(|segment| match segment {
            "*" => TopicSegment::SingleWildcard,
            "#" => TopicSegment::MultiWildcard,
            word => TopicSegment::Word(word.to_owned()),
        })
        .collect()
}

pub fn topic_matches(pattern: &[TopicSegment], routing_key: &str) -> bool {
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_from(pattern, &key)
}

fn matches_from(pattern: &[TopicSegment], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(TopicSegment::MultiWildcard), _) => {
            matches_from(&pattern[1..], key) || (!key.is_empty() && matches_from(pattern, &key[1..]))
        }
        (Some(TopicSegment::SingleWildcard), Some(_)) => matches_from(&pattern[1..], &key[1..]),
        (Some(TopicSegment::Word(word)), Some(segment)) if word == segment => {
            matches_from(&pattern[1..], &key[1..])
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! topic_test {
        ($name:ident: $pattern:expr, $key:expr => $expected:expr) => {
            #[test]
            fn $name() {
                assert_eq!(topic_matches(&parse_topic($pattern), $key), $expected);
            }
        };
    }

    topic_test!(test_exact_word: "ride.request.standard", "ride.request.standard" => true);
    topic_test!(test_star_matches_one: "ride.request.*", "ride.request.premium" => true);
    topic_test!(test_star_rejects_two: "ride.request.*", "ride.request.premium.xl" => false);
    topic_test!(test_star_rejects_zero: "ride.request.*", "ride.request" => false);
    topic_test!(test_hash_matches_zero: "*.stock.#", "usd.stock" => true);
    topic_test!(test_hash_matches_many: "ride.#", "ride.status.in_progress.late" => true);
    topic_test!(test_hash_in_middle: "driver.#.D7", "driver.status.D7" => true);
    topic_test!(test_other_domain: "ride.request.*", "driver.response.R1" => false);
}

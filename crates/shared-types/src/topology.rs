//! Broker topology: exchanges and the durable queues bound to them.
//!
//! ```text
//!  ride_topic (topic) ──ride.request.*────→ ride_requests
//!  driver_topic (topic) ─driver.response.*→ driver_responses
//!                       └driver.status.*──→ driver_status
//!  location_fanout (fanout) ──────────────→ location_updates
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Pattern-routed by dot-delimited routing key (`*` one word, `#` zero or more).
    Topic,
    /// Every bound queue receives every message; routing key is ignored.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named routing domain and its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    pub name: &'static str,
    pub kind: ExchangeKind,
}

impl ExchangeSpec {
    pub const fn topic(name: &'static str) -> Self {
        Self {
            name,
            kind: ExchangeKind::Topic,
        }
    }

    pub const fn fanout(name: &'static str) -> Self {
        Self {
            name,
            kind: ExchangeKind::Fanout,
        }
    }
}

/// Ride lifecycle events (requests, status changes).
pub const RIDE_TOPIC: ExchangeSpec = ExchangeSpec::topic("ride_topic");

/// Driver events (status, match responses).
pub const DRIVER_TOPIC: ExchangeSpec = ExchangeSpec::topic("driver_topic");

/// Location broadcast to every interested consumer.
pub const LOCATION_FANOUT: ExchangeSpec = ExchangeSpec::fanout("location_fanout");

/// All exchanges the dispatch services publish to.
pub const ALL_EXCHANGES: [ExchangeSpec; 3] = [RIDE_TOPIC, DRIVER_TOPIC, LOCATION_FANOUT];

/// A durable queue and the binding that feeds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: ExchangeSpec,
    /// Binding pattern; ignored by fanout exchanges.
    pub pattern: String,
    pub durable: bool,
    /// Exclusive queues are deleted by the broker when their connection goes away.
    pub exclusive: bool,
}

impl QueueBinding {
    pub fn durable(queue: impl Into<String>, exchange: ExchangeSpec, pattern: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange,
            pattern: pattern.into(),
            durable: true,
            exclusive: false,
        }
    }

    /// Short-lived queue owned by one waiter (e.g. a per-ride response queue).
    pub fn exclusive(queue: impl Into<String>, exchange: ExchangeSpec, pattern: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange,
            pattern: pattern.into(),
            durable: false,
            exclusive: true,
        }
    }
}

/// Queue names per consumer role.
pub mod queues {
    pub const RIDE_REQUESTS: &str = "ride_requests";
    pub const DRIVER_RESPONSES: &str = "driver_responses";
    pub const DRIVER_STATUS: &str = "driver_status";
    pub const LOCATION_UPDATES: &str = "location_updates";
}

pub fn ride_requests() -> QueueBinding {
    QueueBinding::durable(queues::RIDE_REQUESTS, RIDE_TOPIC, "ride.request.*")
}

pub fn driver_responses() -> QueueBinding {
    QueueBinding::durable(queues::DRIVER_RESPONSES, DRIVER_TOPIC, "driver.response.*")
}

pub fn driver_status() -> QueueBinding {
    QueueBinding::durable(queues::DRIVER_STATUS, DRIVER_TOPIC, "driver.status.*")
}

pub fn location_updates() -> QueueBinding {
    QueueBinding::durable(queues::LOCATION_UPDATES, LOCATION_FANOUT, "")
}

/// Ride status changes; not part of the four role queues but used by relays.
pub fn ride_status(queue: impl Into<String>) -> QueueBinding {
    QueueBinding::durable(queue, RIDE_TOPIC, "ride.status.*")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kinds() {
        assert_eq!(RIDE_TOPIC.kind, ExchangeKind::Topic);
        assert_eq!(DRIVER_TOPIC.kind, ExchangeKind::Topic);
        assert_eq!(LOCATION_FANOUT.kind, ExchangeKind::Fanout);
        assert_eq!(LOCATION_FANOUT.kind.to_string(), "fanout");
    }

    #[test]
    fn test_role_queues_are_durable() {
        for binding in [ride_requests(), driver_responses(), driver_status(), location_updates()] {
            assert!(binding.durable, "{} must survive broker restarts", binding.queue);
            assert!(!binding.exclusive);
        }
    }

    #[test]
    fn test_exclusive_binding() {
        let binding = QueueBinding::exclusive("wait.R1", DRIVER_TOPIC, "driver.response.R1");
        assert!(binding.exclusive);
        assert!(!binding.durable);
    }
}

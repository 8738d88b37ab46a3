//! Bus error types.
//!
//! [`TransportError`] is what a broker adapter reports for a single
//! operation. [`BrokerError`] is what the connection manager, publisher and
//! response waiter hand back to callers after retries and lifecycle checks.

use thiserror::Error;

/// Failure of a single broker operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Redeclaring an exchange with a different kind.
    #[error("exchange {exchange} already declared as {existing}, requested {requested}")]
    ExchangeMismatch {
        exchange: String,
        existing: String,
        requested: String,
    },

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A mandatory publish matched no queue.
    #[error("message with routing key {routing_key} is unroutable on {exchange}")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// The broker negatively confirmed a publish.
    #[error("publish to {0} was not confirmed by the broker")]
    Nacked(String),

    /// Ack or reject for a tag the channel no longer tracks.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("broker protocol error: {0}")]
    Protocol(String),
}

/// Errors surfaced by the connection manager, publisher and waiter.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Initial dial or channel open failed. Fatal at startup.
    #[error("initial broker connection failed: {0}")]
    Connect(#[source] TransportError),

    #[error("reconnect failed after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: TransportError },

    /// [`close`](crate::BrokerConnectionManager::close) already ran.
    #[error("broker connection manager is closed")]
    ManagerClosed,

    #[error("not connected to broker")]
    NotConnected,

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish to {exchange} with key {routing_key} failed after {attempts} attempts: {last}")]
    PublishFailed {
        exchange: String,
        routing_key: String,
        attempts: u32,
        last: Box<BrokerError>,
    },

    #[error("no match response for ride {0} before the deadline")]
    SearchTimedOut(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BrokerError {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_)
                | BrokerError::NotConnected
                | BrokerError::ReconnectExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::NotConnected.is_transient());
        assert!(BrokerError::Transport(TransportError::ChannelClosed("x".into())).is_transient());
        assert!(!BrokerError::ManagerClosed.is_transient());
        assert!(!BrokerError::Cancelled.is_transient());
    }

    #[test]
    fn test_publish_failure_message_names_target() {
        let err = BrokerError::PublishFailed {
            exchange: "ride_topic".into(),
            routing_key: "ride.request.standard".into(),
            attempts: 5,
            last: Box::new(BrokerError::NotConnected),
        };
        let text = err.to_string();
        assert!(text.contains("ride_topic"));
        assert!(text.contains("5 attempts"));
    }
}

use thiserror::Error;
use uuid::Uuid;

/// Failure of a single push connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("push connection closed")]
    Closed,

    #[error("push transport error: {0}")]
    Io(String),

    #[error("failed to encode payload: {0}")]
    Encode(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The connection carries no entity id.
    #[error("connection has no entity id")]
    EmptyConnection,

    /// No live connection; for sends the payload was buffered.
    #[error("connection not found for entity {0}")]
    NotFound(Uuid),

    /// Live connection rejected the payload; it was buffered for replay.
    #[error("send to entity {entity_id} failed: {source}")]
    Send {
        entity_id: Uuid,
        #[source]
        source: PushError,
    },

    #[error("connection hub is closed")]
    Closed,
}

impl HubError {
    /// The payload is held for replay; callers need not retry.
    pub fn is_buffered(&self) -> bool {
        matches!(self, HubError::NotFound(_) | HubError::Send { .. })
    }
}

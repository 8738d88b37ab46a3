//! Push connection port and an in-process adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::PushError;

/// One live duplex channel to a rider or driver.
#[async_trait]
pub trait PushConnection: Send + Sync {
    fn entity_id(&self) -> Uuid;

    /// Deliver one payload. The hub never inspects it.
    async fn send(&self, payload: &Value) -> Result<(), PushError>;

    async fn close(&self) -> Result<(), PushError>;
}

/// Identity of a registered connection, independent of vtable layout.
pub(crate) fn same_connection(a: &Arc<dyn PushConnection>, b: &Arc<dyn PushConnection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Push connection backed by an mpsc channel.
///
/// Used for in-process clients and tests; `set_failing` makes sends fail
/// as if the socket had died.
pub struct ChannelConnection {
    entity_id: Uuid,
    tx: mpsc::UnboundedSender<Value>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl ChannelConnection {
    pub fn new(entity_id: Uuid) -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            entity_id,
            tx,
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (connection, rx)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushConnection for ChannelConnection {
    fn entity_id(&self) -> Uuid {
        self.entity_id
    }

    async fn send(&self, payload: &Value) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PushError::Io("broken pipe".to_string()));
        }
        self.tx.send(payload.clone()).map_err(|_| PushError::Closed)
    }

    async fn close(&self) -> Result<(), PushError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

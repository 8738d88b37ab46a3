//! Broker transport ports.
//!
//! The connection manager, publisher and consumer loop are written against
//! these traits only. Adapters:
//!
//! - [`crate::memory`]: in-process broker with AMQP routing semantics, used by
//!   tests and local runs
//! - `crate::amqp` (feature `amqp`): RabbitMQ via lapin
//!
//! ```text
//! Dialer ──dial──▶ BrokerConnection ──open_channel──▶ BrokerChannel
//!                        │                                 │
//!                   close_signal                     close_signal
//!                        └────────────┬────────────────────┘
//!                                     ▼
//!                          connection manager monitor
//! ```

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{ExchangeSpec, QueueBinding};
use tokio::sync::{mpsc, watch};
use tokio_stream::Stream;

use crate::error::TransportError;

/// A message as it travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub content_type: String,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub priority: Option<u8>,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Why a connection or channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Graceful,
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Graceful => f.write_str("closed gracefully"),
            CloseReason::Error(reason) => write!(f, "closed with error: {}", reason),
        }
    }
}

/// `None` while open; set once when the connection or channel closes.
pub type CloseSignal = watch::Receiver<Option<CloseReason>>;

/// Terminal disposition of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// One message handed to a consumer.
///
/// Settling consumes the delivery, so a delivery gets exactly one terminal
/// disposition.
pub struct Delivery {
    pub envelope: Envelope,
    pub delivery_tag: u64,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            envelope,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(requeue).await
    }

    pub async fn settle(self, disposition: Disposition) -> Result<(), TransportError> {
        match disposition {
            Disposition::Ack => self.ack().await,
            Disposition::Reject { requeue } => self.reject(requeue).await,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("routing_key", &self.envelope.routing_key)
            .finish()
    }
}

/// Deliveries for one consumer. Ends when the channel or connection closes.
pub struct DeliveryStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Stream for DeliveryStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_closed(&self) -> bool;

    fn close_signal(&self) -> CloseSignal;

    /// Idempotent; fails if the exchange exists with another kind.
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError>;

    /// Idempotent queue declaration honoring `durable` and `exclusive`.
    async fn declare_queue(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Publish and wait for the broker to take responsibility for the message.
    /// A mandatory message that matches no queue fails with
    /// [`TransportError::Unroutable`].
    async fn publish(
        &self,
        exchange: &str,
        envelope: Envelope,
        mandatory: bool,
    ) -> Result<(), TransportError>;

    /// Cap the unacked deliveries pushed to each consumer started on this
    /// channel afterwards.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Start consuming with manual acknowledgment.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_closed(&self) -> bool;

    fn close_signal(&self) -> CloseSignal;

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens connections to a broker identified by a DSN.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, dsn: &str) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    /// Records the last disposition: 1 ack, 2 reject, 3 requeue.
    struct RecordingAcker(Arc<AtomicU8>);

    #[async_trait]
    impl Acker for RecordingAcker {
        async fn ack(&self) -> Result<(), TransportError> {
            self.0.store(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
            self.0.store(if requeue { 3 } else { 2 }, Ordering::SeqCst);
            Ok(())
        }
    }

    fn delivery(recorded: Arc<AtomicU8>) -> Delivery {
        let envelope = Envelope {
            content_type: shared_types::JSON_CONTENT_TYPE.to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
            priority: None,
            routing_key: "ride.request.standard".to_string(),
            body: b"{}".to_vec(),
        };
        Delivery::new(envelope, 1, false, Box::new(RecordingAcker(recorded)))
    }

    #[tokio::test]
    async fn test_settle_routes_to_acker() {
        let recorded = Arc::new(AtomicU8::new(0));
        delivery(recorded.clone()).settle(Disposition::Ack).await.unwrap();
        assert_eq!(recorded.load(Ordering::SeqCst), 1);

        delivery(recorded.clone())
            .settle(Disposition::Reject { requeue: true })
            .await
            .unwrap();
        assert_eq!(recorded.load(Ordering::SeqCst), 3);

        delivery(recorded.clone())
            .settle(Disposition::Reject { requeue: false })
            .await
            .unwrap();
        assert_eq!(recorded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stream_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = DeliveryStream::new(rx);
        let recorded = Arc::new(AtomicU8::new(0));
        tx.send(delivery(recorded)).unwrap();
        drop(tx);

        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }
}

//! # Shared Bus - Resilient Broker Transport
//!
//! Publish and consume ride-dispatch events over a message broker that may
//! drop connections at any time.
//!
//! ```text
//! ┌──────────────┐  publish_message()  ┌───────────────────────────┐
//! │  Publisher   │ ──────────────────▶ │                           │
//! └──────────────┘                     │  BrokerConnectionManager  │ ──▶ Dialer
//! ┌──────────────┐  channel()          │  (one connection+channel, │     (memory / amqp)
//! │ ConsumerLoop │ ──────────────────▶ │   monitor, reconnect)     │
//! └──────┬───────┘                     └───────────────────────────┘
//!        │ submit(task)
//!        ▼
//! ┌──────────────┐
//! │ TaskExecutor │ ──▶ DeliveryHandler::handle ──▶ ack / reject / requeue
//! └──────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! - At-least-once: unacked deliveries on a dropped channel are redelivered
//!   once the consumer resubscribes to its durable queue.
//! - No ordering across deliveries of one queue (see [`consumer`]).
//! - Publishes are retried a bounded number of times, then reported.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod executor;
pub mod memory;
pub mod publisher;
pub mod retry;
pub mod routing;
pub mod transport;
pub mod waiter;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use config::{redact_dsn, BusConfig, ConfigError};
pub use connection::BrokerConnectionManager;
pub use consumer::{
    classify, routed_context, ConsumerLoop, ConsumerState, ConsumerStats, ConsumerStatsSnapshot,
    DeliveryHandler, HandlerError,
};
pub use error::{BrokerError, TransportError};
pub use executor::{InlineExecutor, TaskExecutor, TokioExecutor};
pub use memory::MemoryBroker;
pub use publisher::{PublishOptions, Publisher};
pub use retry::{retry_with_backoff, Backoff, RetryError, RetryPolicy};
pub use transport::{
    BrokerChannel, BrokerConnection, CloseReason, Delivery, DeliveryStream, Dialer, Disposition,
    Envelope,
};
pub use waiter::{await_match_response, await_match_response_on, match_response_binding};

#[cfg(feature = "amqp")]
pub use amqp::AmqpDialer;

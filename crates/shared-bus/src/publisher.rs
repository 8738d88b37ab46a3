//! # Publisher
//!
//! Serializes once, then retries only the broker interaction:
//!
//! ```text
//! attempt n: ensure_connection ─▶ channel ─▶ declare exchange ─▶ publish
//!               (fixed delay between attempts, at most `publish_attempts`)
//! ```
//!
//! A failed exchange declaration aborts the attempt and is retried like a
//! failed publish. Ride requests are published as mandatory, so a request no
//! queue is bound for fails instead of vanishing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use ride_telemetry::RequestContext;
use serde::Serialize;
use shared_types::{CorrelationId, ExchangeSpec, RoutedMessage, JSON_CONTENT_TYPE};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::BusConfig;
use crate::connection::BrokerConnectionManager;
use crate::error::BrokerError;
use crate::retry::{retry_when, RetryError, RetryPolicy};
use crate::transport::Envelope;

/// Per-publish envelope options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Fail when no queue is bound for the routing key.
    pub mandatory: bool,
    pub priority: Option<u8>,
    /// Used when the request context carries none.
    pub correlation_id: Option<String>,
}

impl PublishOptions {
    /// Options derived from a routed message.
    pub fn for_message<M: RoutedMessage>(message: &M) -> Self {
        Self {
            mandatory: M::mandatory(),
            priority: message.priority(),
            correlation_id: message.correlation_id().map(str::to_string),
        }
    }
}

pub struct Publisher {
    manager: Arc<BrokerConnectionManager>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    published: AtomicU64,
    failed: AtomicU64,
}

impl Publisher {
    pub fn new(
        manager: Arc<BrokerConnectionManager>,
        config: &BusConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            policy: config.publish_policy(),
            shutdown,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Publish a routed message on its own exchange with its derived key.
    pub async fn publish_message<M: RoutedMessage>(
        &self,
        ctx: &RequestContext,
        message: &M,
    ) -> Result<(), BrokerError> {
        self.publish(
            ctx,
            M::exchange(),
            &message.routing_key(),
            message,
            PublishOptions::for_message(message),
        )
        .await
    }

    pub async fn publish<M: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        exchange: ExchangeSpec,
        routing_key: &str,
        message: &M,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(message)?;
        let correlation_id = ctx
            .correlation_id()
            .map(|id| id.as_str().to_string())
            .or(options.correlation_id)
            .unwrap_or_else(|| CorrelationId::generate().to_string());

        let envelope = Envelope {
            content_type: JSON_CONTENT_TYPE.to_string(),
            correlation_id: Some(correlation_id.clone()),
            timestamp: Utc::now(),
            priority: options.priority,
            routing_key: routing_key.to_string(),
            body,
        };
        let mandatory = options.mandatory;
        let correlation_id = correlation_id.as_str();

        let result = retry_when(
            &self.policy,
            &self.shutdown,
            |attempt| {
                let envelope = envelope.clone();
                async move {
                    self.manager.ensure_connection(&self.shutdown).await?;
                    let channel = self.manager.channel().await?;
                    channel.declare_exchange(&exchange).await?;
                    channel.publish(exchange.name, envelope, mandatory).await?;
                    debug!(
                        exchange = exchange.name,
                        routing_key,
                        correlation_id = %correlation_id,
                        attempt,
                        "Published"
                    );
                    Ok::<(), BrokerError>(())
                }
            },
            |e| e.is_transient(),
        )
        .await;

        match result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let err = match e {
                    RetryError::Cancelled => BrokerError::Cancelled,
                    RetryError::Aborted(e) => e,
                    RetryError::Exhausted { attempts, last } => BrokerError::PublishFailed {
                        exchange: exchange.name.to_string(),
                        routing_key: routing_key.to_string(),
                        attempts,
                        last: Box::new(last),
                    },
                };
                error!(exchange = exchange.name, routing_key, error = %err, "Publish failed");
                Err(err)
            }
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

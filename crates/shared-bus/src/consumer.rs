//! # Consumer Loop
//!
//! Keeps one subscription alive across broker failures and settles every
//! delivery according to the handler's outcome.
//!
//! ```text
//!  Disconnected ─▶ Connecting ─▶ Subscribing ─▶ Consuming
//!       ▲              │              │             │
//!       └──── sleep ◀──┴──────────────┴── stream closed
//!
//!  any state ── cancel ──▶ Shutdown
//! ```
//!
//! ## Outcome Classification
//!
//! | Outcome | Disposition | Counter |
//! |---------|-------------|---------|
//! | undecodable body | reject, no requeue | `poison` |
//! | filtered by [`DeliveryHandler::accepts`] | reject, requeue | `filtered` |
//! | `Ok(())` | ack | `acked` |
//! | [`HandlerError::NoResult`] | reject, no requeue | `no_result` |
//! | [`HandlerError::Fatal`] | reject, no requeue | `fatal`, `handler_errors` |
//! | [`HandlerError::Other`] | reject, requeue | `requeued`, `handler_errors` |
//!
//! ## Ordering
//!
//! Each delivery is submitted to a [`TaskExecutor`] as its own task. With the
//! default [`TokioExecutor`] deliveries from one queue may complete and be
//! acknowledged in any order. Only [`InlineExecutor`](crate::InlineExecutor)
//! processes them strictly in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ride_telemetry::RequestContext;
use serde::de::DeserializeOwned;
use shared_types::{QueueBinding, RoutedMessage};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::BusConfig;
use crate::connection::BrokerConnectionManager;
use crate::error::BrokerError;
use crate::executor::{TaskExecutor, TokioExecutor};
use crate::retry::sleep_or_cancel;
use crate::transport::{Delivery, DeliveryStream, Disposition};

/// What a handler reports back about one message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Expected empty outcome such as no eligible drivers. Dropped quietly.
    #[error("no result: {0}")]
    NoResult(String),

    /// The message can never be processed. Dropped.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Transient failure; the message is requeued for redelivery.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn no_eligible_drivers() -> Self {
        HandlerError::NoResult("no eligible drivers".to_string())
    }

    pub fn search_timed_out() -> Self {
        HandlerError::NoResult("search timed out".to_string())
    }

    pub fn is_benign(&self) -> bool {
        matches!(self, HandlerError::NoResult(_))
    }
}

impl From<BrokerError> for HandlerError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::SearchTimedOut(_) => HandlerError::search_timed_out(),
            BrokerError::Encode(e) => HandlerError::Fatal(e.to_string()),
            other => HandlerError::Other(other.into()),
        }
    }
}

/// Map a handler result to the delivery's terminal disposition.
pub fn classify(result: &Result<(), HandlerError>) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(HandlerError::NoResult(_)) | Err(HandlerError::Fatal(_)) => {
            Disposition::Reject { requeue: false }
        }
        Err(HandlerError::Other(_)) => Disposition::Reject { requeue: true },
    }
}

/// Business logic for one queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    type Message: DeserializeOwned + Send + Sync + 'static;

    /// Operation name recorded on every delivery span.
    fn name(&self) -> &'static str;

    /// Competing-consumer filter. Messages for which this returns `false` are
    /// requeued for another consumer.
    fn accepts(&self, _message: &Self::Message) -> bool {
        true
    }

    /// Identifiers extracted from the message for logging.
    fn context(&self, _message: &Self::Message) -> RequestContext {
        RequestContext::new()
    }

    async fn handle(&self, ctx: RequestContext, message: Self::Message) -> Result<(), HandlerError>;
}

/// Context carrying the correlation, ride and driver ids a routed message exposes.
pub fn routed_context<M: RoutedMessage>(message: &M) -> RequestContext {
    RequestContext::new()
        .with_correlation_token(message.correlation_id().unwrap_or_default())
        .with_ride_id(message.ride_id().unwrap_or_default())
        .with_driver_id(message.driver_id().unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Subscribing,
    Consuming,
    Shutdown,
}

/// Consumer counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub received: AtomicU64,
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
    pub filtered: AtomicU64,
    pub poison: AtomicU64,
    pub no_result: AtomicU64,
    pub fatal: AtomicU64,
    pub handler_errors: AtomicU64,
    pub ack_failures: AtomicU64,
    pub resubscribes: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub filtered: u64,
    pub poison: u64,
    pub no_result: u64,
    pub fatal: u64,
    pub handler_errors: u64,
    pub ack_failures: u64,
    pub resubscribes: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            no_result: self.no_result.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            resubscribes: self.resubscribes.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct ConsumerLoop<H: DeliveryHandler> {
    manager: Arc<BrokerConnectionManager>,
    binding: QueueBinding,
    consumer_tag: String,
    handler: Arc<H>,
    executor: Arc<dyn TaskExecutor>,
    retry_delay: Duration,
    prefetch: u16,
    stats: Arc<ConsumerStats>,
    state: watch::Sender<ConsumerState>,
}

impl<H: DeliveryHandler> ConsumerLoop<H> {
    pub fn new(
        manager: Arc<BrokerConnectionManager>,
        binding: QueueBinding,
        handler: H,
        config: &BusConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            consumer_tag: format!("{}-{}", binding.queue, uuid::Uuid::new_v4().simple()),
            manager,
            binding,
            handler: Arc::new(handler),
            executor: Arc::new(TokioExecutor::new()),
            retry_delay: config.consumer_retry_delay,
            prefetch: config.prefetch,
            stats: Arc::new(ConsumerStats::default()),
            state,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn queue(&self) -> &str {
        &self.binding.queue
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    async fn subscribe(&self) -> Result<DeliveryStream, BrokerError> {
        let channel = self.manager.channel().await?;
        channel.declare_exchange(&self.binding.exchange).await?;
        channel.declare_queue(&self.binding).await?;
        channel.bind_queue(&self.binding).await?;
        channel.set_prefetch(self.prefetch).await?;
        Ok(channel
            .consume(&self.binding.queue, &self.consumer_tag)
            .await?)
    }

    /// Run until `cancel` fires or the manager is closed.
    pub async fn run(self, cancel: CancellationToken) {
        let queue = self.binding.queue.clone();
        info!(queue = %queue, exchange = self.binding.exchange.name, "Consumer loop starting");

        'outer: loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(ConsumerState::Connecting);
            if let Err(e) = self.manager.ensure_connection(&cancel).await {
                if matches!(e, BrokerError::ManagerClosed | BrokerError::Cancelled) {
                    break;
                }
                warn!(queue = %queue, error = %e, "Broker unavailable, retrying");
                self.set_state(ConsumerState::Disconnected);
                if !sleep_or_cancel(self.retry_delay, &cancel).await {
                    break;
                }
                continue;
            }

            self.set_state(ConsumerState::Subscribing);
            let mut stream = match self.subscribe().await {
                Ok(stream) => stream,
                Err(BrokerError::ManagerClosed) => break,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Subscribe failed, retrying");
                    self.set_state(ConsumerState::Disconnected);
                    if !sleep_or_cancel(self.retry_delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConsumerState::Consuming);
            info!(queue = %queue, consumer_tag = %self.consumer_tag, "Consuming");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'outer,
                    next = stream.recv() => match next {
                        Some(delivery) => self.dispatch(delivery).await,
                        None => break,
                    },
                }
            }

            bump(&self.stats.resubscribes);
            warn!(queue = %queue, "Delivery stream closed, resubscribing");
            self.set_state(ConsumerState::Disconnected);
            if !sleep_or_cancel(self.retry_delay, &cancel).await {
                break;
            }
        }

        self.set_state(ConsumerState::Shutdown);
        info!(queue = %queue, "Consumer loop stopped");
    }

    async fn dispatch(&self, delivery: Delivery) {
        bump(&self.stats.received);
        let task = process_delivery(
            Arc::clone(&self.handler),
            delivery,
            Arc::clone(&self.stats),
            self.binding.queue.clone(),
        );
        self.executor.submit(Box::pin(task)).await;
    }
}

async fn settle(delivery: Delivery, disposition: Disposition, stats: &ConsumerStats) {
    let tag = delivery.delivery_tag;
    match delivery.settle(disposition).await {
        Ok(()) => match disposition {
            Disposition::Ack => bump(&stats.acked),
            Disposition::Reject { .. } => {}
        },
        Err(e) => {
            bump(&stats.ack_failures);
            error!(delivery_tag = tag, ?disposition, error = %e, "Failed to settle delivery");
        }
    }
}

async fn process_delivery<H: DeliveryHandler>(
    handler: Arc<H>,
    delivery: Delivery,
    stats: Arc<ConsumerStats>,
    queue: String,
) {
    let message: H::Message = match serde_json::from_slice(&delivery.envelope.body) {
        Ok(message) => message,
        Err(e) => {
            bump(&stats.poison);
            warn!(
                queue = %queue,
                routing_key = %delivery.envelope.routing_key,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Undecodable message, dropping"
            );
            settle(delivery, Disposition::Reject { requeue: false }, &stats).await;
            return;
        }
    };

    if !handler.accepts(&message) {
        bump(&stats.filtered);
        debug!(queue = %queue, delivery_tag = delivery.delivery_tag, "Not addressed to this consumer, requeueing");
        settle(delivery, Disposition::Reject { requeue: true }, &stats).await;
        return;
    }

    let ctx = RequestContext::new()
        .with_operation(handler.name())
        .with_correlation_token(delivery.envelope.correlation_id.as_deref().unwrap_or_default())
        .merge(&handler.context(&message));
    let span = ctx.span();

    async move {
        let result = handler.handle(ctx, message).await;
        let disposition = classify(&result);

        match &result {
            Ok(()) => debug!(queue = %queue, "Handled"),
            Err(e @ HandlerError::NoResult(_)) => {
                bump(&stats.no_result);
                warn!(queue = %queue, outcome = %e, "Handler finished without result");
            }
            Err(e @ HandlerError::Fatal(_)) => {
                bump(&stats.fatal);
                bump(&stats.handler_errors);
                error!(queue = %queue, error = %e, "Handler failed permanently, dropping");
            }
            Err(e @ HandlerError::Other(_)) => {
                bump(&stats.requeued);
                bump(&stats.handler_errors);
                error!(queue = %queue, error = %e, "Handler failed, requeueing");
            }
        }

        settle(delivery, disposition, &stats).await;
    }
    .instrument(span)
    .await
}

//! Waiting for a driver's answer to a dispatch offer.
//!
//! A temporary consumer listens for `driver.response.<ride_id>` and resolves
//! with the first response for the ride. Responses for other rides that reach
//! the same queue are requeued so the waiter they belong to can take them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ride_telemetry::RequestContext;
use shared_types::topology::{queues, DRIVER_TOPIC};
use shared_types::{DriverMatchResponse, QueueBinding};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::connection::BrokerConnectionManager;
use crate::consumer::{routed_context, ConsumerLoop, DeliveryHandler, HandlerError};
use crate::error::BrokerError;
use crate::executor::InlineExecutor;

struct MatchResponseHandler {
    ride_id: String,
    reply: Mutex<Option<oneshot::Sender<DriverMatchResponse>>>,
}

#[async_trait]
impl DeliveryHandler for MatchResponseHandler {
    type Message = DriverMatchResponse;

    fn name(&self) -> &'static str {
        "await_match_response"
    }

    fn accepts(&self, message: &DriverMatchResponse) -> bool {
        message.ride_id == self.ride_id
    }

    fn context(&self, message: &DriverMatchResponse) -> RequestContext {
        routed_context(message)
    }

    async fn handle(
        &self,
        _ctx: RequestContext,
        message: DriverMatchResponse,
    ) -> Result<(), HandlerError> {
        match self.reply.lock().take() {
            Some(reply) => {
                let _ = reply.send(message);
            }
            None => debug!(driver_id = %message.driver_id, "Late response after resolution"),
        }
        Ok(())
    }
}

/// Queue private to one waiter, bound to the ride's response key.
pub fn match_response_binding(ride_id: &str) -> QueueBinding {
    QueueBinding::exclusive(
        format!("{}.{}", queues::DRIVER_RESPONSES, ride_id),
        DRIVER_TOPIC,
        format!("driver.response.{}", ride_id),
    )
}

/// Wait on an exclusive per-ride queue for the ride's match response.
///
/// Resolves with [`BrokerError::SearchTimedOut`] when nothing arrives within
/// `timeout`.
pub async fn await_match_response(
    manager: Arc<BrokerConnectionManager>,
    config: &BusConfig,
    ride_id: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<DriverMatchResponse, BrokerError> {
    let binding = match_response_binding(ride_id);
    await_match_response_on(manager, binding, config, ride_id, timeout, cancel).await
}

/// Like [`await_match_response`] on a caller-chosen queue, which may be shared
/// with waiters for other rides.
pub async fn await_match_response_on(
    manager: Arc<BrokerConnectionManager>,
    binding: QueueBinding,
    config: &BusConfig,
    ride_id: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<DriverMatchResponse, BrokerError> {
    let (reply, response) = oneshot::channel();
    let handler = MatchResponseHandler {
        ride_id: ride_id.to_string(),
        reply: Mutex::new(Some(reply)),
    };

    let stop = cancel.child_token();
    let consumer = ConsumerLoop::new(Arc::clone(&manager), binding.clone(), handler, config)
        .with_executor(Arc::new(InlineExecutor))
        .with_consumer_tag(format!("match-waiter-{}", ride_id));
    let task = consumer.spawn(stop.clone());

    let result = tokio::select! {
        biased;
        response = response => response.map_err(|_| {
            if cancel.is_cancelled() {
                BrokerError::Cancelled
            } else if manager.is_shut_down() {
                BrokerError::ManagerClosed
            } else {
                BrokerError::NotConnected
            }
        }),
        _ = cancel.cancelled() => Err(BrokerError::Cancelled),
        _ = tokio::time::sleep(timeout) => Err(BrokerError::SearchTimedOut(ride_id.to_string())),
    };

    stop.cancel();
    if let Err(e) = task.await {
        warn!(ride_id, error = %e, "Match waiter consumer panicked");
    }

    if binding.exclusive {
        if let Ok(channel) = manager.channel().await {
            if let Err(e) = channel.delete_queue(&binding.queue).await {
                debug!(queue = %binding.queue, error = %e, "Waiter queue cleanup failed");
            }
        }
    }

    match &result {
        Ok(response) => debug!(ride_id, driver_id = %response.driver_id, accepted = response.accepted, "Match response received"),
        Err(BrokerError::SearchTimedOut(_)) => warn!(ride_id, "No match response before deadline"),
        Err(e) => warn!(ride_id, error = %e, "Match wait aborted"),
    }
    result
}

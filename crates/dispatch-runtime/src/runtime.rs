//! Runtime assembly: broker link, topology, relay consumers, push hub.

use std::sync::Arc;

use push_hub::ConnectionHub;
use shared_bus::{
    BrokerChannel, BrokerConnectionManager, BrokerError, ConsumerLoop, ConsumerStats, Dialer,
    Publisher,
};
use shared_types::topology::{self, QueueBinding, ALL_EXCHANGES};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::relays::{DriverStatusRelay, RideLocationRelay, RideStatusRelay};

/// Queue feeding ride status changes to the push relay.
pub const RIDE_STATUS_PUSH_QUEUE: &str = "ride_status_push";

/// The queues bound at startup.
pub fn bindings() -> Vec<QueueBinding> {
    vec![
        topology::ride_requests(),
        topology::driver_responses(),
        topology::driver_status(),
        topology::location_updates(),
        topology::ride_status(RIDE_STATUS_PUSH_QUEUE),
    ]
}

/// Declare every exchange and durable queue so publishes never race
/// consumer startup.
pub async fn declare_topology(channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
    for exchange in ALL_EXCHANGES.iter() {
        channel.declare_exchange(exchange).await?;
    }
    for binding in bindings() {
        channel.declare_queue(&binding).await?;
        channel.bind_queue(&binding).await?;
    }
    Ok(())
}

struct RelayTask {
    queue: String,
    stats: Arc<ConsumerStats>,
    handle: JoinHandle<()>,
}

pub struct DispatchRuntime {
    config: NodeConfig,
    manager: Arc<BrokerConnectionManager>,
    publisher: Arc<Publisher>,
    hub: ConnectionHub,
    shutdown: CancellationToken,
    relays: Vec<RelayTask>,
    sweeper: JoinHandle<()>,
}

/// Periodically drop pending buffers of entities that never came back.
fn spawn_sweeper(hub: ConnectionHub, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(hub.expiry_interval());
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    hub.expire_pending();
                }
            }
        }
    })
}

impl DispatchRuntime {
    /// Connect, declare the topology and start the relay consumers.
    ///
    /// A failed initial connect is returned as-is; nothing is retried here.
    pub async fn start(config: NodeConfig, dialer: Arc<dyn Dialer>) -> Result<Self, BrokerError> {
        let manager = Arc::new(
            BrokerConnectionManager::connect(dialer, config.amqp_url.clone(), &config.bus).await?,
        );
        declare_topology(manager.channel().await?.as_ref()).await?;
        info!("Broker topology declared");

        let shutdown = CancellationToken::new();
        let hub = ConnectionHub::new(&config.hub);
        let publisher = Arc::new(Publisher::new(
            Arc::clone(&manager),
            &config.bus,
            shutdown.child_token(),
        ));

        let sweeper = spawn_sweeper(hub.clone(), shutdown.child_token());
        let mut runtime = Self {
            config,
            manager,
            publisher,
            hub,
            shutdown,
            relays: Vec::new(),
            sweeper,
        };

        runtime.spawn_relay(
            topology::driver_status(),
            DriverStatusRelay::new(runtime.hub.clone()),
        );
        runtime.spawn_relay(
            topology::ride_status(RIDE_STATUS_PUSH_QUEUE),
            RideStatusRelay::new(runtime.hub.clone()),
        );
        runtime.spawn_relay(
            topology::location_updates(),
            RideLocationRelay::new(runtime.hub.clone()),
        );

        info!(relays = runtime.relays.len(), "Dispatch runtime started");
        Ok(runtime)
    }

    fn spawn_relay<H: shared_bus::DeliveryHandler>(&mut self, binding: QueueBinding, handler: H) {
        let consumer = ConsumerLoop::new(Arc::clone(&self.manager), binding, handler, &self.config.bus);
        let queue = consumer.queue().to_string();
        let stats = consumer.stats();
        let handle = consumer.spawn(self.shutdown.child_token());
        self.relays.push(RelayTask { queue, stats, handle });
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        Arc::clone(&self.publisher)
    }

    pub fn manager(&self) -> Arc<BrokerConnectionManager> {
        Arc::clone(&self.manager)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Token cancelled when the runtime shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Per-queue consumer counters.
    pub fn relay_stats(&self) -> Vec<(String, Arc<ConsumerStats>)> {
        self.relays
            .iter()
            .map(|r| (r.queue.clone(), Arc::clone(&r.stats)))
            .collect()
    }

    /// Stop consumers, close the broker link within the configured bound,
    /// then close every push connection.
    pub async fn shutdown(self) {
        info!("Dispatch runtime shutting down");
        self.shutdown.cancel();

        for relay in self.relays {
            if let Err(e) = relay.handle.await {
                warn!(queue = %relay.queue, error = %e, "Relay task ended abnormally");
            }
        }

        if let Err(e) = self.sweeper.await {
            warn!(error = %e, "Pending buffer sweeper ended abnormally");
        }

        if let Err(e) = self.manager.close_within(self.config.bus.close_timeout).await {
            warn!(error = %e, "Broker close did not complete cleanly");
        }
        self.hub.close().await;
        info!("Dispatch runtime stopped");
    }
}

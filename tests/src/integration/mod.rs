//! Integration flows and shared fixtures.

pub mod flows;
pub mod reconnect;

use std::sync::Arc;
use std::time::Duration;

use dispatch_runtime::{DispatchRuntime, NodeConfig};
use shared_bus::{BrokerConnectionManager, BusConfig, MemoryBroker};

/// A memory broker and a connected manager with millisecond timings.
pub async fn connected() -> (MemoryBroker, Arc<BrokerConnectionManager>) {
    let broker = MemoryBroker::new();
    let manager = BrokerConnectionManager::connect(broker.dialer(), "memory://it", &BusConfig::fast())
        .await
        .expect("memory broker connect");
    (broker, Arc::new(manager))
}

/// A full runtime on a memory broker.
pub async fn runtime() -> (MemoryBroker, DispatchRuntime) {
    let broker = MemoryBroker::new();
    let config = NodeConfig {
        amqp_url: "memory://it".to_string(),
        bus: BusConfig::fast(),
        ..NodeConfig::default()
    };
    let runtime = DispatchRuntime::start(config, broker.dialer())
        .await
        .expect("runtime start");
    (broker, runtime)
}

/// Poll `condition` until it holds, failing after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

//! # Broker Loss and Recovery
//!
//! - Deliveries in flight when the broker drops are redelivered after the
//!   consumer resubscribes.
//! - Publishers and relays resume on a reconnected link without operator
//!   intervention.
//! - The reconnect budget is bounded and honours cancellation.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use push_hub::ChannelConnection;
    use ride_telemetry::RequestContext;
    use shared_bus::{
        routed_context, BrokerError, BusConfig, ConsumerLoop, ConsumerState, DeliveryHandler,
        HandlerError, Publisher,
    };
    use shared_types::topology;
    use shared_types::DriverStatusUpdateMessage;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::integration::{connected, eventually, runtime};

    #[derive(Default)]
    struct Gate {
        calls: AtomicUsize,
        release: Notify,
        seen: Mutex<Vec<String>>,
    }

    /// Holds the first delivery until released; later ones pass straight through.
    struct GatedHandler(Arc<Gate>);

    #[async_trait]
    impl DeliveryHandler for GatedHandler {
        type Message = DriverStatusUpdateMessage;

        fn name(&self) -> &'static str {
            "it.gated"
        }

        fn context(&self, message: &DriverStatusUpdateMessage) -> RequestContext {
            routed_context(message)
        }

        async fn handle(
            &self,
            _ctx: RequestContext,
            message: DriverStatusUpdateMessage,
        ) -> Result<(), HandlerError> {
            let call = self.0.calls.fetch_add(1, Ordering::SeqCst);
            self.0.seen.lock().push(message.driver_id);
            if call == 0 {
                self.0.release.notified().await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unacked_delivery_redelivered_after_broker_drop() {
        let (broker, manager) = connected().await;
        let gate = Arc::new(Gate::default());
        let consumer = ConsumerLoop::new(
            Arc::clone(&manager),
            topology::driver_status(),
            GatedHandler(Arc::clone(&gate)),
            &BusConfig::fast(),
        );
        let stats = consumer.stats();
        let mut state = consumer.state();
        let cancel = CancellationToken::new();
        let task = consumer.spawn(cancel.clone());
        state.wait_for(|s| *s == ConsumerState::Consuming).await.unwrap();

        let publisher = Publisher::new(Arc::clone(&manager), &BusConfig::fast(), cancel.clone());
        let update = DriverStatusUpdateMessage {
            driver_id: "D1".to_string(),
            status: "ONLINE".to_string(),
        };
        publisher
            .publish_message(&RequestContext::new(), &update)
            .await
            .unwrap();
        eventually(|| gate.calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(broker.unacked_count("driver_status"), 1);

        broker.kill_connections("broker restart");

        // Redelivered on the new subscription while the first attempt is stuck.
        eventually(|| gate.calls.load(Ordering::SeqCst) == 2).await;
        eventually(|| stats.acked.load(Ordering::Relaxed) == 1).await;
        gate.release.notify_one();

        eventually(|| {
            broker.ready_count("driver_status") == 0 && broker.unacked_count("driver_status") == 0
        })
        .await;
        assert_eq!(*gate.seen.lock(), vec!["D1".to_string(), "D1".to_string()]);
        assert!(stats.resubscribes.load(Ordering::Relaxed) >= 1);
        assert_eq!(manager.reconnect_count(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_resumes_after_broker_drop() {
        let (broker, runtime) = runtime().await;
        let driver = Uuid::new_v4();
        let (conn, mut pushed) = ChannelConnection::new(driver);
        runtime.hub().add(conn).await.unwrap().await.unwrap();

        broker.kill_connections("broker restart");
        eventually(|| broker.consumer_count("driver_status") == 1).await;

        let update = DriverStatusUpdateMessage {
            driver_id: driver.to_string(),
            status: "ON_TRIP".to_string(),
        };
        runtime
            .publisher()
            .publish_message(&RequestContext::new(), &update)
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), pushed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["status"], "ON_TRIP");
        assert!(runtime.manager().reconnect_count() >= 1);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_five_dials() {
        let (broker, manager) = connected().await;
        broker.set_unreachable(true);
        broker.kill_connections("network partition");
        let dials_before = broker.dial_count();

        let err = manager.reconnect(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, BrokerError::ReconnectExhausted { attempts: 5, .. }));
        assert_eq!(broker.dial_count() - dials_before, 5);

        // Once the broker is back the same manager recovers.
        broker.set_unreachable(false);
        manager
            .ensure_connection(&CancellationToken::new())
            .await
            .unwrap();
        assert!(!manager.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_during_outage_is_bounded() {
        let (broker, runtime) = runtime().await;
        broker.set_unreachable(true);
        broker.kill_connections("broker gone");

        tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("shutdown should not wait for the broker");
    }
}

//! # Dispatch Flows
//!
//! End-to-end paths through publisher, broker, consumer and hub:
//!
//! 1. **Ride request routing**: typed publish lands on `ride_requests` with
//!    the derived key.
//! 2. **Poison delivery**: an undecodable body is dropped without reaching
//!    the handler.
//! 3. **Status relay**: a driver status event reaches the driver's socket,
//!    or waits in the hub until the driver connects.
//! 4. **Match waiting**: waiters sharing one queue each get their own ride's
//!    response.

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use push_hub::{ChannelConnection, HubError};
    use ride_telemetry::RequestContext;
    use serde_json::json;
    use shared_bus::{
        await_match_response, await_match_response_on, BrokerError, ConsumerLoop, ConsumerState,
        Envelope, InlineExecutor, Publisher,
    };
    use shared_types::topology;
    use shared_types::{
        CorrelationId, DriverMatchResponse, DriverStatusUpdateMessage, RideRequestedMessage,
    };
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::integration::{connected, eventually, runtime};

    #[tokio::test]
    async fn test_ride_request_routed_by_ride_type() {
        let (broker, runtime) = runtime().await;
        let publisher = runtime.publisher();

        let correlation = CorrelationId::generate();
        let ctx = RequestContext::new().with_correlation_id(correlation.clone());
        let request = RideRequestedMessage {
            ride_id: "R1".to_string(),
            ride_type: "ECONOMY".to_string(),
            priority: 0,
            correlation_id: String::new(),
        };
        publisher.publish_message(&ctx, &request).await.unwrap();

        let ready = broker.peek_ready("ride_requests");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].routing_key, "ride.request.ECONOMY");
        assert_eq!(ready[0].correlation_id.as_deref(), Some(correlation.as_str()));
        let body: RideRequestedMessage = serde_json::from_slice(&ready[0].body).unwrap();
        assert_eq!(body.ride_id, "R1");

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_undecodable_driver_status_never_reaches_relay() {
        let (broker, runtime) = runtime().await;
        let driver = Uuid::new_v4();
        let driver_stats = runtime
            .relay_stats()
            .into_iter()
            .find(|(queue, _)| queue == "driver_status")
            .map(|(_, stats)| stats)
            .unwrap();

        let channel = runtime.manager().channel().await.unwrap();
        channel
            .publish(
                "driver_topic",
                Envelope {
                    content_type: shared_types::JSON_CONTENT_TYPE.to_string(),
                    correlation_id: None,
                    timestamp: Utc::now(),
                    priority: None,
                    routing_key: format!("driver.status.{driver}"),
                    body: b"{not json".to_vec(),
                },
                false,
            )
            .await
            .unwrap();

        eventually(|| driver_stats.poison.load(Ordering::Relaxed) == 1).await;
        eventually(|| broker.unacked_count("driver_status") == 0).await;
        assert_eq!(broker.ready_count("driver_status"), 0);
        assert_eq!(driver_stats.acked.load(Ordering::Relaxed), 0);
        assert_eq!(runtime.hub().pending_len(driver), 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_driver_status_pushed_to_connected_driver() {
        let (_broker, runtime) = runtime().await;
        let driver = Uuid::new_v4();
        let (conn, mut pushed) = ChannelConnection::new(driver);
        runtime.hub().add(conn).await.unwrap().await.unwrap();

        let update = DriverStatusUpdateMessage {
            driver_id: driver.to_string(),
            status: "AVAILABLE".to_string(),
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
        assert_eq!(payload, serde_json::to_value(&update).unwrap());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_driver_gets_update_on_connect() {
        let (_broker, runtime) = runtime().await;
        let hub = runtime.hub().clone();
        let driver = Uuid::new_v4();

        let update = DriverStatusUpdateMessage {
            driver_id: driver.to_string(),
            status: "ASSIGNED".to_string(),
        };
        runtime
            .publisher()
            .publish_message(&RequestContext::new(), &update)
            .await
            .unwrap();
        eventually(|| hub.pending_len(driver) == 1).await;

        let (conn, mut pushed) = ChannelConnection::new(driver);
        let outcome = hub.add(conn).await.unwrap().await.unwrap();

        assert_eq!(outcome.delivered, 1);
        assert_eq!(pushed.recv().await.unwrap(), serde_json::to_value(&update).unwrap());
        assert!(pushed.try_recv().is_err());
        assert_eq!(hub.pending_len(driver), 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_hub_send_without_connection_is_buffered() {
        let (_broker, runtime) = runtime().await;
        let driver = Uuid::new_v4();

        let err = runtime
            .hub()
            .send_to(driver, json!({"offer": "R7"}))
            .await
            .unwrap_err();

        assert_eq!(err, HubError::NotFound(driver));
        assert_eq!(runtime.hub().pending_payloads(driver), vec![json!({"offer": "R7"})]);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_match_waiter_receives_its_response() {
        let (_broker, manager) = connected().await;
        let config = shared_bus::BusConfig::fast();
        let cancel = CancellationToken::new();

        let waiter = {
            let manager = Arc::clone(&manager);
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                await_match_response(manager, &config, "R9", Duration::from_secs(2), &cancel).await
            })
        };

        let publisher = Publisher::new(Arc::clone(&manager), &config, cancel.clone());
        let response = DriverMatchResponse {
            ride_id: "R9".to_string(),
            driver_id: "D3".to_string(),
            accepted: true,
        };
        // The waiter's exclusive queue may not be bound yet; retry until routed.
        loop {
            match publisher
                .publish(
                    &RequestContext::new(),
                    topology::DRIVER_TOPIC,
                    "driver.response.R9",
                    &response,
                    shared_bus::PublishOptions {
                        mandatory: true,
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(()) => break,
                Err(BrokerError::PublishFailed { .. }) => continue,
                Err(e) => panic!("unexpected publish error: {e}"),
            }
        }

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received, response);
    }

    #[tokio::test]
    async fn test_match_waiter_times_out_benignly() {
        let (broker, manager) = connected().await;

        let err = await_match_response(
            Arc::clone(&manager),
            &shared_bus::BusConfig::fast(),
            "R404",
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BrokerError::SearchTimedOut(ref ride) if ride == "R404"));
        assert!(shared_bus::HandlerError::from(err).is_benign());
        assert!(!broker.has_queue("driver_responses.R404"));
    }

    #[tokio::test]
    async fn test_waiters_sharing_a_queue_filter_by_ride() {
        let (broker, manager) = connected().await;
        let config = shared_bus::BusConfig::fast();
        let cancel = CancellationToken::new();

        let spawn_waiter = |ride: &'static str| {
            let manager = Arc::clone(&manager);
            let config = config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                await_match_response_on(
                    manager,
                    topology::driver_responses(),
                    &config,
                    ride,
                    Duration::from_secs(2),
                    &cancel,
                )
                .await
            })
        };
        let first = spawn_waiter("R1");
        let second = spawn_waiter("R2");
        eventually(|| broker.consumer_count("driver_responses") == 2).await;

        let publisher = Publisher::new(Arc::clone(&manager), &config, cancel.clone());
        for (ride, driver) in [("R2", "D2"), ("R1", "D1")] {
            let response = DriverMatchResponse {
                ride_id: ride.to_string(),
                driver_id: driver.to_string(),
                accepted: true,
            };
            publisher
                .publish_message(&RequestContext::new(), &response)
                .await
                .unwrap();
        }

        assert_eq!(first.await.unwrap().unwrap().driver_id, "D1");
        assert_eq!(second.await.unwrap().unwrap().driver_id, "D2");
        // The shared durable queue survives its waiters.
        assert!(broker.has_queue("driver_responses"));
    }

    #[tokio::test]
    async fn test_consumer_reports_consuming_state() {
        let (_broker, manager) = connected().await;
        let hub = push_hub::ConnectionHub::default();
        let consumer = ConsumerLoop::new(
            Arc::clone(&manager),
            topology::driver_status(),
            dispatch_runtime::DriverStatusRelay::new(hub),
            &shared_bus::BusConfig::fast(),
        )
        .with_executor(Arc::new(InlineExecutor));
        let mut state = consumer.state();
        let cancel = CancellationToken::new();
        let task = consumer.spawn(cancel.clone());

        state.wait_for(|s| *s == ConsumerState::Consuming).await.unwrap();
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(*state.borrow(), ConsumerState::Shutdown);
    }
}

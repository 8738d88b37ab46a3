//! # In-Memory Broker
//!
//! An in-process broker with the AMQP semantics the transport relies on:
//!
//! - topic and fanout exchanges, idempotent declarations, kind mismatch errors
//! - durable and exclusive queues (exclusive queues die with their connection)
//! - round-robin dispatch to competing consumers, manual ack and reject
//! - per-consumer prefetch limits on unacked deliveries
//! - unacked deliveries requeued as redelivered when their channel closes
//! - mandatory publishes that match no queue fail as unroutable
//!
//! Fault injection (`fail_next_dials`, `set_unreachable`, `kill_connections`,
//! `close_channels`) drives the reconnect paths in tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{ExchangeKind, ExchangeSpec, QueueBinding};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::redact_dsn;
use crate::error::TransportError;
use crate::routing::{parse_topic, topic_matches, TopicSegment};
use crate::transport::{
    Acker, BrokerChannel, BrokerConnection, CloseReason, CloseSignal, Delivery, DeliveryStream,
    Dialer, Envelope,
};

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    fail_dials: AtomicU32,
    unreachable: AtomicBool,
    dials: AtomicU32,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, Weak<MemoryConnection>>,
    next_id: u64,
    next_tag: u64,
    published: u64,
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
    segments: Vec<TopicSegment>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    owner: Option<u64>,
    ready: VecDeque<Queued>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Queued {
    envelope: Envelope,
    redelivered: bool,
}

struct Unacked {
    envelope: Envelope,
    channel_id: u64,
    consumer_id: u64,
}

struct Consumer {
    id: u64,
    tag: String,
    channel_id: u64,
    /// Zero means unlimited.
    prefetch: u16,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl QueueState {
    fn in_flight(&self, consumer_id: u64) -> usize {
        self.unacked
            .values()
            .filter(|u| u.consumer_id == consumer_id)
            .count()
    }

    /// Next consumer in round-robin order with room under its prefetch.
    fn next_with_capacity(&self) -> Option<usize> {
        let count = self.consumers.len();
        (0..count)
            .map(|offset| (self.next_consumer + offset) % count)
            .find(|&index| {
                let consumer = &self.consumers[index];
                consumer.prefetch == 0 || self.in_flight(consumer.id) < usize::from(consumer.prefetch)
            })
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Hand ready messages to consumers, round robin.
    fn pump(&mut self, shared: &Arc<Shared>, queue_name: &str) {
        let BrokerState {
            queues, next_tag, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(index) = queue.next_with_capacity() else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            *next_tag += 1;
            let tag = *next_tag;

            let acker = MemoryAcker {
                shared: Arc::clone(shared),
                queue: queue_name.to_string(),
                tag,
            };
            let delivery = Delivery::new(
                message.envelope.clone(),
                tag,
                message.redelivered,
                Box::new(acker),
            );

            match queue.consumers[index].tx.send(delivery) {
                Ok(()) => {
                    queue.unacked.insert(
                        tag,
                        Unacked {
                            envelope: message.envelope,
                            channel_id: queue.consumers[index].channel_id,
                            consumer_id: queue.consumers[index].id,
                        },
                    );
                    queue.next_consumer = index + 1;
                }
                Err(_) => {
                    let gone = queue.consumers.remove(index);
                    debug!(queue = queue_name, consumer = %gone.tag, "Consumer stream dropped");
                    queue.ready.push_front(message);
                }
            }
        }
    }

    fn pump_all(&mut self, shared: &Arc<Shared>) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.pump(shared, &name);
        }
    }

    /// Drop a channel's consumers and requeue its unacked deliveries.
    fn release_channel(&mut self, channel_id: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);

            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    queue.ready.push_front(Queued {
                        envelope: unacked.envelope,
                        redelivered: true,
                    });
                }
            }
        }
    }

    fn remove_queue(&mut self, name: &str) -> bool {
        self.bindings.retain(|b| b.queue != name);
        self.queues.remove(name).is_some()
    }
}

impl Shared {
    fn settle(self: &Arc<Self>, queue: &str, tag: u64, requeue: Option<bool>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let unacked = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.unacked.remove(&tag))
            .ok_or(TransportError::UnknownDeliveryTag(tag))?;

        if requeue == Some(true) {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_front(Queued {
                    envelope: unacked.envelope,
                    redelivered: true,
                });
            }
        }
        // Settling frees prefetch room as well as requeueing.
        state.pump(self, queue);
        Ok(())
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.shared.settle(&self.queue, self.tag, None)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.shared.settle(&self.queue, self.tag, Some(requeue))
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(self.clone())
    }

    /// Refuse the next `n` dials.
    pub fn fail_next_dials(&self, n: u32) {
        self.shared.fail_dials.store(n, Ordering::SeqCst);
    }

    /// Refuse every dial until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Dial attempts seen so far, successful or not.
    pub fn dial_count(&self) -> u32 {
        self.shared.dials.load(Ordering::SeqCst)
    }

    fn live_connections(&self) -> Vec<Arc<MemoryConnection>> {
        let state = self.shared.state.lock();
        state.connections.values().filter_map(Weak::upgrade).collect()
    }

    /// Drop every open connection as if the broker went away.
    pub fn kill_connections(&self, reason: &str) {
        for connection in self.live_connections() {
            connection.shutdown(CloseReason::Error(reason.to_string()));
        }
    }

    /// Close every open channel while leaving connections up.
    pub fn close_channels(&self, reason: &str) {
        for connection in self.live_connections() {
            let channels: Vec<Arc<MemoryChannel>> = connection.channels.lock().clone();
            for channel in channels {
                channel.shutdown(CloseReason::Error(reason.to_string()));
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.live_connections()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.shared.state.lock().exchanges.get(name).copied()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    pub fn is_durable(&self, name: &str) -> bool {
        self.shared
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.durable)
            .unwrap_or(false)
    }

    pub fn binding_patterns(&self, queue: &str) -> Vec<String> {
        self.shared
            .state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.pattern.clone())
            .collect()
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Copies of the messages waiting on a queue, oldest first.
    pub fn peek_ready(&self, queue: &str) -> Vec<Envelope> {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    /// Publishes accepted by an exchange.
    pub fn published_count(&self) -> u64 {
        self.shared.state.lock().published
    }
}

#[async_trait]
impl Dialer for MemoryBroker {
    async fn dial(&self, dsn: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let shared = &self.shared;
        shared.dials.fetch_add(1, Ordering::SeqCst);

        if shared.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Dial(format!("{}: connection refused", redact_dsn(dsn))));
        }
        let injected = shared
            .fail_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Dial(format!("{}: connection reset", redact_dsn(dsn))));
        }

        let (close_tx, _) = watch::channel(None);
        let mut state = shared.state.lock();
        let connection = Arc::new(MemoryConnection {
            id: state.next_id(),
            shared: Arc::clone(shared),
            close_tx,
            channels: Mutex::new(Vec::new()),
        });
        state
            .connections
            .insert(connection.id, Arc::downgrade(&connection));
        Ok(connection)
    }
}

pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    close_tx: watch::Sender<Option<CloseReason>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    fn shutdown(&self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            channel.shutdown(reason.clone());
        }

        {
            let mut state = self.shared.state.lock();
            let owned: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, q)| q.owner == Some(self.id))
                .map(|(name, _)| name.clone())
                .collect();
            for name in owned {
                state.remove_queue(&name);
            }
            state.connections.remove(&self.id);
        }

        self.close_tx.send_replace(Some(reason));
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_closed(&self) -> bool {
        self.close_tx.borrow().is_some()
    }

    fn close_signal(&self) -> CloseSignal {
        self.close_tx.subscribe()
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(format!(
                "connection {}",
                self.id
            )));
        }
        let (close_tx, _) = watch::channel(None);
        let id = self.shared.state.lock().next_id();
        let channel = Arc::new(MemoryChannel {
            id,
            connection_id: self.id,
            shared: Arc::clone(&self.shared),
            prefetch: AtomicU16::new(0),
            close_tx,
        });
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown(CloseReason::Graceful);
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u64,
    connection_id: u64,
    shared: Arc<Shared>,
    prefetch: AtomicU16,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::ChannelClosed(format!("channel {}", self.id)))
        } else {
            Ok(())
        }
    }

    fn shutdown(&self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            state.release_channel(self.id);
            state.pump_all(&self.shared);
        }
        self.close_tx.send_replace(Some(reason));
    }

    fn check_owner(&self, queue: &QueueState, name: &str) -> Result<(), TransportError> {
        match queue.owner {
            Some(owner) if owner != self.connection_id => Err(TransportError::Protocol(format!(
                "queue {} is exclusive to another connection",
                name
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_closed(&self) -> bool {
        self.close_tx.borrow().is_some()
    }

    fn close_signal(&self) -> CloseSignal {
        self.close_tx.subscribe()
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        match state.exchanges.get(exchange.name) {
            Some(existing) if *existing != exchange.kind => Err(TransportError::ExchangeMismatch {
                exchange: exchange.name.to_string(),
                existing: existing.to_string(),
                requested: exchange.kind.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.to_string(), exchange.kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if let Some(queue) = state.queues.get(&binding.queue) {
            return self.check_owner(queue, &binding.queue);
        }
        state.queues.insert(
            binding.queue.clone(),
            QueueState {
                durable: binding.durable,
                owner: binding.exclusive.then_some(self.connection_id),
                ..QueueState::default()
            },
        );
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if !state.exchanges.contains_key(binding.exchange.name) {
            return Err(TransportError::ExchangeNotFound(binding.exchange.name.to_string()));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(TransportError::QueueNotFound(binding.queue.clone()));
        }
        let exists = state.bindings.iter().any(|b| {
            b.exchange == binding.exchange.name
                && b.queue == binding.queue
                && b.pattern == binding.pattern
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: binding.exchange.name.to_string(),
                queue: binding.queue.clone(),
                pattern: binding.pattern.clone(),
                segments: parse_topic(&binding.pattern),
            });
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.shared.state.lock().remove_queue(queue);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        envelope: Envelope,
        mandatory: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let kind = *state
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| {
                kind == ExchangeKind::Fanout || topic_matches(&b.segments, &envelope.routing_key)
            })
            .map(|b| b.queue.clone())
            .filter(|q| state.queues.contains_key(q))
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            if mandatory {
                return Err(TransportError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: envelope.routing_key,
                });
            }
            debug!(exchange, routing_key = %envelope.routing_key, "Dropping unroutable message");
        }

        state.published += 1;
        for queue in &targets {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(Queued {
                    envelope: envelope.clone(),
                    redelivered: false,
                });
            }
            state.pump(&self.shared, queue);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let queue_state = state
            .queues
            .get(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        self.check_owner(queue_state, queue)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id();
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(Consumer {
                id,
                tag: consumer_tag.to_string(),
                channel_id: self.id,
                prefetch: self.prefetch.load(Ordering::SeqCst),
                tx,
            });
        }
        state.pump(&self.shared, queue);
        Ok(DeliveryStream::new(rx))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown(CloseReason::Graceful);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared_types::topology::{self, DRIVER_TOPIC, LOCATION_FANOUT, RIDE_TOPIC};

    fn envelope(key: &str, body: &str) -> Envelope {
        Envelope {
            content_type: shared_types::JSON_CONTENT_TYPE.to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
            priority: None,
            routing_key: key.to_string(),
            body: body.as_bytes().to_vec(),
        }
    }

    async fn channel(broker: &MemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let connection = broker.dial("memory://").await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        (connection, channel)
    }

    async fn declare(channel: &Arc<dyn BrokerChannel>, binding: &QueueBinding) {
        channel.declare_exchange(&binding.exchange).await.unwrap();
        channel.declare_queue(binding).await.unwrap();
        channel.bind_queue(binding).await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_routing_and_delivery() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        declare(&ch, &topology::ride_requests()).await;

        let mut stream = ch.consume("ride_requests", "c1").await.unwrap();
        ch.publish("ride_topic", envelope("ride.request.standard", "a"), true)
            .await
            .unwrap();
        ch.publish("ride_topic", envelope("ride.status.done", "b"), false)
            .await
            .unwrap();

        let delivery = stream.recv().await.unwrap();
        assert_eq!(delivery.envelope.body, b"a");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count("ride_requests"), 1);
        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count("ride_requests"), 0);
        assert_eq!(broker.ready_count("ride_requests"), 0);
    }

    #[tokio::test]
    async fn test_mandatory_without_queue_is_unroutable() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_exchange(&RIDE_TOPIC).await.unwrap();

        let err = ch
            .publish("ride_topic", envelope("ride.request.standard", "{}"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unroutable { .. }));

        ch.publish("ride_topic", envelope("ride.request.standard", "{}"), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fanout_ignores_routing_key() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        declare(&ch, &topology::location_updates()).await;
        let second = QueueBinding::durable("location_audit", LOCATION_FANOUT, "");
        declare(&ch, &second).await;

        ch.publish("location_fanout", envelope("anything", "{}"), false)
            .await
            .unwrap();
        assert_eq!(broker.ready_count("location_updates"), 1);
        assert_eq!(broker.ready_count("location_audit"), 1);
    }

    #[tokio::test]
    async fn test_exchange_kind_mismatch() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_exchange(&RIDE_TOPIC).await.unwrap();
        ch.declare_exchange(&RIDE_TOPIC).await.unwrap();

        let err = ch
            .declare_exchange(&ExchangeSpec::fanout("ride_topic"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ExchangeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_channel_close_requeues_unacked_as_redelivered() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        declare(&ch, &topology::driver_status()).await;

        let mut stream = ch.consume("driver_status", "c1").await.unwrap();
        ch.publish("driver_topic", envelope("driver.status.D1", "x"), false)
            .await
            .unwrap();
        let delivery = stream.recv().await.unwrap();

        broker.close_channels("boom");
        assert!(stream.recv().await.is_none());
        assert!(matches!(
            delivery.ack().await,
            Err(TransportError::UnknownDeliveryTag(_))
        ));

        let ready = broker.peek_ready("driver_status");
        assert_eq!(ready.len(), 1);

        let (_conn2, ch2) = channel(&broker).await;
        let mut stream = ch2.consume("driver_status", "c2").await.unwrap();
        assert!(stream.recv().await.unwrap().redelivered);
    }

    #[tokio::test]
    async fn test_reject_with_requeue_goes_to_next_consumer() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        declare(&ch, &topology::driver_responses()).await;

        let mut first = ch.consume("driver_responses", "a").await.unwrap();
        let mut second = ch.consume("driver_responses", "b").await.unwrap();
        ch.publish("driver_topic", envelope("driver.response.R1", "r"), false)
            .await
            .unwrap();

        first.recv().await.unwrap().reject(true).await.unwrap();
        let again = second.recv().await.unwrap();
        assert!(again.redelivered);
        again.reject(false).await.unwrap();
        assert_eq!(broker.ready_count("driver_responses"), 0);
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_with_connection() {
        let broker = MemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        let binding = QueueBinding::exclusive("waiter.R1", DRIVER_TOPIC, "driver.response.R1");
        declare(&ch, &binding).await;
        assert!(broker.has_queue("waiter.R1"));

        let (_other, other_ch) = channel(&broker).await;
        assert!(other_ch.consume("waiter.R1", "x").await.is_err());

        conn.close().await.unwrap();
        assert!(!broker.has_queue("waiter.R1"));
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn test_prefetch_caps_unacked_per_consumer() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        declare(&ch, &topology::driver_status()).await;
        ch.set_prefetch(2).await.unwrap();

        let mut stream = ch.consume("driver_status", "c1").await.unwrap();
        for i in 0..5 {
            ch.publish("driver_topic", envelope("driver.status.D1", &i.to_string()), false)
                .await
                .unwrap();
        }
        assert_eq!(broker.unacked_count("driver_status"), 2);
        assert_eq!(broker.ready_count("driver_status"), 3);

        let first = stream.recv().await.unwrap();
        assert_eq!(first.envelope.body, b"0");
        first.ack().await.unwrap();
        assert_eq!(broker.unacked_count("driver_status"), 2);
        assert_eq!(broker.ready_count("driver_status"), 2);

        let second = stream.recv().await.unwrap();
        assert_eq!(second.envelope.body, b"1");
        let third = stream.recv().await.unwrap();
        assert_eq!(third.envelope.body, b"2");
        assert_eq!(broker.unacked_count("driver_status"), 2);
    }

    #[tokio::test]
    async fn test_full_consumer_is_skipped_in_round_robin() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        declare(&ch, &topology::driver_responses()).await;
        ch.set_prefetch(1).await.unwrap();

        let mut first = ch.consume("driver_responses", "a").await.unwrap();
        let mut second = ch.consume("driver_responses", "b").await.unwrap();
        for key in ["R1", "R2", "R3"] {
            ch.publish("driver_topic", envelope(&format!("driver.response.{key}"), key), false)
                .await
                .unwrap();
        }

        assert_eq!(first.recv().await.unwrap().envelope.body, b"R1");
        let held = second.recv().await.unwrap();
        assert_eq!(held.envelope.body, b"R2");
        assert_eq!(broker.ready_count("driver_responses"), 1);

        held.ack().await.unwrap();
        assert_eq!(second.recv().await.unwrap().envelope.body, b"R3");
    }

    #[tokio::test]
    async fn test_injected_dial_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(2);
        assert!(broker.dial("memory://").await.is_err());
        assert!(broker.dial("memory://").await.is_err());
        assert!(broker.dial("memory://").await.is_ok());
        assert_eq!(broker.dial_count(), 3);
    }

    #[tokio::test]
    async fn test_kill_signals_close_reason() {
        let broker = MemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        let mut signal = conn.close_signal();

        broker.kill_connections("network partition");
        signal.changed().await.unwrap();
        assert_eq!(
            *signal.borrow(),
            Some(CloseReason::Error("network partition".to_string()))
        );
        assert!(ch.is_closed());
        assert_eq!(broker.connection_count(), 0);
    }
}

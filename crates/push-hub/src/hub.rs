//! Connection hub.
//!
//! Registry of live push connections keyed by entity id, at most one per
//! entity. Payloads for entities without a working connection are held in a
//! bounded [`PendingBuffer`] and replayed, in enqueue order, when the entity
//! registers again.
//!
//! The registry and buffers live behind one `parking_lot` mutex that is never
//! held across an await; every send and close runs outside it so a slow
//! socket cannot stall lookups for other entities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::connection::{same_connection, PushConnection};
use crate::error::{HubError, PushError};
use crate::pending::{PendingBuffer, PendingEntry};

/// Result of one replay-on-reconnect pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Payloads the connection accepted.
    pub delivered: usize,
    /// Payloads still buffered once the pass finished.
    pub remaining: usize,
    /// The pass stopped early on a send failure.
    pub failed: bool,
}

#[derive(Debug, Default)]
struct HubStats {
    sent: AtomicU64,
    buffered: AtomicU64,
    evicted: AtomicU64,
    replayed: AtomicU64,
    send_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStatsSnapshot {
    pub sent: u64,
    pub buffered: u64,
    pub evicted: u64,
    pub replayed: u64,
    pub send_failures: u64,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<Uuid, Arc<dyn PushConnection>>,
    pending: HashMap<Uuid, PendingBuffer>,
    /// Entities with a replay in flight, and whether another pass was asked for.
    replaying: HashMap<Uuid, bool>,
    closed: bool,
}

struct Inner {
    state: Mutex<HubState>,
    capacity: usize,
    pending_ttl: Duration,
    stats: HubStats,
}

/// Shared handle to the hub. Clones refer to the same registry.
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<Inner>,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(&HubConfig::default())
    }
}

impl ConnectionHub {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HubState::default()),
                capacity: config.pending_capacity.max(1),
                pending_ttl: config.pending_ttl,
                stats: HubStats::default(),
            }),
        }
    }

    /// Register `conn` as the entity's live connection.
    ///
    /// A previously registered connection is replaced and closed. A replay of
    /// the entity's buffered payloads is spawned; the handle resolves to its
    /// outcome.
    pub async fn add(
        &self,
        conn: Arc<dyn PushConnection>,
    ) -> Result<JoinHandle<ReplayOutcome>, HubError> {
        let entity_id = conn.entity_id();
        if entity_id.is_nil() {
            return Err(HubError::EmptyConnection);
        }

        let previous = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(HubError::Closed);
            }
            state.connections.insert(entity_id, Arc::clone(&conn))
        };

        match previous {
            Some(old) if !same_connection(&old, &conn) => {
                info!(entity_id = %entity_id, "Replacing existing push connection");
                if let Err(e) = old.close().await {
                    warn!(entity_id = %entity_id, error = %e, "Failed to close replaced connection");
                }
            }
            Some(_) => {}
            None => info!(entity_id = %entity_id, "Push connection registered"),
        }

        let hub = self.clone();
        Ok(tokio::spawn(async move { hub.replay(entity_id).await }))
    }

    /// Deliver buffered payloads to the entity's current connection.
    ///
    /// Stops at the first failed send. Entries up to the last delivered one
    /// are removed; anything enqueued meanwhile stays buffered.
    ///
    /// At most one replay runs per entity. A call that finds one in flight
    /// returns at once and the running replay makes another pass against the
    /// then-current connection, so each entry is delivered once and in order.
    pub async fn replay(&self, entity_id: Uuid) -> ReplayOutcome {
        {
            let mut state = self.inner.state.lock();
            if let Some(rerun) = state.replaying.get_mut(&entity_id) {
                *rerun = true;
                debug!(entity_id = %entity_id, "Replay already running, rerun requested");
                return ReplayOutcome {
                    remaining: state.pending.get(&entity_id).map_or(0, PendingBuffer::len),
                    ..ReplayOutcome::default()
                };
            }
            state.replaying.insert(entity_id, false);
        }

        let mut outcome = ReplayOutcome::default();
        loop {
            let pass = self.replay_pass(entity_id).await;
            outcome.delivered += pass.delivered;
            outcome.failed = pass.failed;

            let rerun = {
                let mut state = self.inner.state.lock();
                let rerun = state.replaying.get(&entity_id).copied().unwrap_or(false);
                if rerun {
                    state.replaying.insert(entity_id, false);
                } else {
                    state.replaying.remove(&entity_id);
                    outcome.remaining =
                        state.pending.get(&entity_id).map_or(0, PendingBuffer::len);
                }
                rerun
            };
            if !rerun {
                break;
            }
        }

        self.inner
            .stats
            .replayed
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        debug!(
            entity_id = %entity_id,
            delivered = outcome.delivered,
            remaining = outcome.remaining,
            "Replay finished"
        );
        outcome
    }

    async fn replay_pass(&self, entity_id: Uuid) -> ReplayOutcome {
        let (conn, entries) = {
            let state = self.inner.state.lock();
            let entries = state
                .pending
                .get(&entity_id)
                .map(PendingBuffer::snapshot)
                .unwrap_or_default();
            (state.connections.get(&entity_id).cloned(), entries)
        };

        let Some(conn) = conn else {
            return ReplayOutcome::default();
        };

        let mut outcome = ReplayOutcome::default();
        let mut last_delivered: Option<u64> = None;
        for PendingEntry { seq, payload } in &entries {
            match conn.send(payload).await {
                Ok(()) => {
                    outcome.delivered += 1;
                    last_delivered = Some(*seq);
                }
                Err(e) => {
                    warn!(
                        entity_id = %entity_id,
                        delivered = outcome.delivered,
                        error = %e,
                        "Replay interrupted"
                    );
                    outcome.failed = true;
                    break;
                }
            }
        }

        if let Some(seq) = last_delivered {
            let mut state = self.inner.state.lock();
            if let Some(buffer) = state.pending.get_mut(&entity_id) {
                buffer.remove_through(seq);
                if buffer.is_empty() {
                    state.pending.remove(&entity_id);
                }
            }
        }
        outcome
    }

    /// Push `payload` to the entity.
    ///
    /// Without a live connection the payload is buffered and `NotFound` is
    /// returned. A failed send is buffered too and returned as `Send`. Both
    /// are non-fatal; replay takes care of delivery.
    pub async fn send_to(&self, entity_id: Uuid, payload: Value) -> Result<(), HubError> {
        let conn = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(HubError::Closed);
            }
            match state.connections.get(&entity_id).cloned() {
                Some(conn) => conn,
                None => {
                    self.buffer(&mut state, entity_id, payload);
                    debug!(entity_id = %entity_id, "No live connection, payload buffered");
                    return Err(HubError::NotFound(entity_id));
                }
            }
        };

        match conn.send(&payload).await {
            Ok(()) => {
                self.inner.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(source) => {
                self.inner.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(entity_id = %entity_id, error = %source, "Push failed, payload buffered");
                let mut state = self.inner.state.lock();
                self.buffer(&mut state, entity_id, payload);
                Err(HubError::Send { entity_id, source })
            }
        }
    }

    /// Serialize `message` and push it.
    pub async fn send_json<T: Serialize>(&self, entity_id: Uuid, message: &T) -> Result<(), HubError> {
        let payload = serde_json::to_value(message).map_err(|e| HubError::Send {
            entity_id,
            source: PushError::Encode(e.to_string()),
        })?;
        self.send_to(entity_id, payload).await
    }

    fn buffer(&self, state: &mut HubState, entity_id: Uuid, payload: Value) {
        let capacity = self.inner.capacity;
        let buffer = state
            .pending
            .entry(entity_id)
            .or_insert_with(|| PendingBuffer::new(capacity));
        if let Some(evicted) = buffer.push(payload) {
            self.inner.stats.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(entity_id = %entity_id, seq = evicted.seq, "Pending buffer full, dropped oldest");
        }
        self.inner.stats.buffered.fetch_add(1, Ordering::Relaxed);
    }

    /// Close and unregister the entity's connection and drop its buffered
    /// payloads.
    ///
    /// The buffer is dropped even when no connection is registered; the
    /// result is still `NotFound` in that case.
    pub async fn delete(&self, entity_id: Uuid) -> Result<(), HubError> {
        let (removed, dropped) = {
            let mut state = self.inner.state.lock();
            let dropped = state.pending.remove(&entity_id).map_or(0, |b| b.len());
            (state.connections.remove(&entity_id), dropped)
        };
        if dropped > 0 {
            debug!(entity_id = %entity_id, dropped, "Dropped buffered payloads");
        }
        let Some(conn) = removed else {
            warn!(entity_id = %entity_id, "Delete for unknown connection");
            return Err(HubError::NotFound(entity_id));
        };

        if let Err(e) = conn.close().await {
            warn!(entity_id = %entity_id, error = %e, "Failed to close connection");
        }
        info!(entity_id = %entity_id, "Push connection removed");
        Ok(())
    }

    /// Unregister `conn` if it is still the entity's registered connection.
    ///
    /// Does not close it. Returns whether anything was removed. Buffered
    /// payloads are kept for the next registration; they go away on replay,
    /// [`delete`](Self::delete) or [`close`](Self::close).
    pub fn detach(&self, entity_id: Uuid, conn: &Arc<dyn PushConnection>) -> bool {
        let mut state = self.inner.state.lock();
        let current = state
            .connections
            .get(&entity_id)
            .is_some_and(|registered| same_connection(registered, conn));
        if current {
            state.connections.remove(&entity_id);
            debug!(entity_id = %entity_id, "Push connection detached");
        }
        current
    }

    /// Drop buffers of entities that are not connected, not replaying, and
    /// have had nothing buffered for the configured TTL. Returns how many
    /// buffers were dropped.
    pub fn expire_pending(&self) -> usize {
        let ttl = self.inner.pending_ttl;
        let mut state = self.inner.state.lock();
        let HubState {
            connections,
            pending,
            replaying,
            ..
        } = &mut *state;
        let before = pending.len();
        pending.retain(|entity_id, buffer| {
            connections.contains_key(entity_id)
                || replaying.contains_key(entity_id)
                || buffer.last_push().elapsed() < ttl
        });
        let expired = before - pending.len();
        drop(state);

        if expired > 0 {
            info!(expired, "Expired idle pending buffers");
        }
        expired
    }

    /// How often [`expire_pending`](Self::expire_pending) should run.
    pub fn expiry_interval(&self) -> Duration {
        (self.inner.pending_ttl / 2).max(Duration::from_secs(1))
    }

    /// Close every registered connection and refuse new ones.
    ///
    /// Returns once all closes have completed. Buffered payloads are dropped.
    pub async fn close(&self) {
        let drained: Vec<(Uuid, Arc<dyn PushConnection>)> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.pending.clear();
            state.connections.drain().collect()
        };

        let count = drained.len();
        let results = join_all(drained.into_iter().map(|(entity_id, conn)| async move {
            (entity_id, conn.close().await)
        }))
        .await;

        for (entity_id, result) in results {
            if let Err(e) = result {
                warn!(entity_id = %entity_id, error = %e, "Failed to close connection");
            }
        }
        info!(connections = count, "Connection hub closed");
    }

    /// Point-in-time copy of the registry.
    pub fn clients(&self) -> HashMap<Uuid, Arc<dyn PushConnection>> {
        self.inner.state.lock().connections.clone()
    }

    pub fn is_connected(&self, entity_id: Uuid) -> bool {
        self.inner.state.lock().connections.contains_key(&entity_id)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn pending_len(&self, entity_id: Uuid) -> usize {
        self.inner
            .state
            .lock()
            .pending
            .get(&entity_id)
            .map_or(0, PendingBuffer::len)
    }

    pub fn pending_payloads(&self, entity_id: Uuid) -> Vec<Value> {
        self.inner
            .state
            .lock()
            .pending
            .get(&entity_id)
            .map(PendingBuffer::payloads)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        let stats = &self.inner.stats;
        HubStatsSnapshot {
            sent: stats.sent.load(Ordering::Relaxed),
            buffered: stats.buffered.load(Ordering::Relaxed),
            evicted: stats.evicted.load(Ordering::Relaxed),
            replayed: stats.replayed.load(Ordering::Relaxed),
            send_failures: stats.send_failures.load(Ordering::Relaxed),
        }
    }
}

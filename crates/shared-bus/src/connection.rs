//! # Broker Connection Manager
//!
//! Owns the single connection and channel shared by every publisher and
//! consumer in the process.
//!
//! ```text
//!           connect()                      ┌──────────────┐
//!  Dialer ───────────▶ connection+channel ─┤   monitor    │── sets closed flag
//!                              ▲           └──────────────┘
//!                              │ reconnect() (linear backoff, cancellable)
//!  ensure_connection() ────────┘
//! ```
//!
//! ## Guarantees
//!
//! - At most one reconnect runs at a time; a caller that finds the link healthy
//!   after acquiring the lock returns without dialing.
//! - Each successful reconnect bumps a generation counter and replaces the
//!   monitor, so a close signal from an old connection never marks the new
//!   one closed.
//! - [`close`](BrokerConnectionManager::close) is terminal. Later calls to
//!   `ensure_connection`, `reconnect` and `channel` fail with
//!   [`BrokerError::ManagerClosed`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::error::{BrokerError, TransportError};
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};
use crate::transport::{BrokerChannel, BrokerConnection, CloseReason, CloseSignal, Dialer};

struct Link {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    monitor: JoinHandle<()>,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.connection.is_closed() && !self.channel.is_closed()
    }
}

pub struct BrokerConnectionManager {
    dialer: Arc<dyn Dialer>,
    dsn: String,
    reconnect_policy: RetryPolicy,
    link: Mutex<Link>,
    /// Set by the monitor when the current link reports closure.
    closed: Arc<AtomicBool>,
    shut_down: AtomicBool,
    generation: Arc<AtomicU64>,
    reconnects: AtomicU64,
}

async fn open_link(
    dialer: &dyn Dialer,
    dsn: &str,
) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), TransportError> {
    let connection = dialer.dial(dsn).await?;
    match connection.open_channel().await {
        Ok(channel) => Ok((connection, channel)),
        Err(e) => {
            if let Err(close_err) = connection.close().await {
                debug!(error = %close_err, "Closing half-open connection failed");
            }
            Err(e)
        }
    }
}

/// Resolve once the signal carries a close reason. A dropped sender counts as
/// an abnormal close.
async fn wait_closed(mut signal: CloseSignal) -> CloseReason {
    loop {
        if let Some(reason) = signal.borrow_and_update().clone() {
            return reason;
        }
        if signal.changed().await.is_err() {
            return CloseReason::Error("close notifier dropped".to_string());
        }
    }
}

fn spawn_monitor(
    connection: CloseSignal,
    channel: CloseSignal,
    closed: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    own_generation: u64,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<(&'static str, CloseReason)>(2);
    for (source, signal) in [("connection", connection), ("channel", channel)] {
        let tx = tx.clone();
        tokio::spawn(async move {
            let reason = wait_closed(signal).await;
            let _ = tx.send((source, reason)).await;
        });
    }
    drop(tx);

    tokio::spawn(async move {
        let Some((source, reason)) = rx.recv().await else {
            return;
        };
        if generation.load(Ordering::SeqCst) != own_generation {
            return;
        }
        closed.store(true, Ordering::SeqCst);
        match reason {
            CloseReason::Graceful => info!(source, "Broker link closed gracefully"),
            CloseReason::Error(error) => warn!(source, %error, "Broker link lost"),
        }
    })
}

/// Close the channel, then the connection. A channel failure is logged and
/// the connection is closed regardless.
async fn close_link(
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
) -> Result<(), TransportError> {
    if let Err(e) = channel.close().await {
        warn!(error = %e, "Channel close failed");
    }
    connection.close().await
}

/// Run `fut` on its own task and wait for it unless `cancel` fires first.
/// On cancel the close keeps running in the background.
async fn race_close<F>(what: &'static str, fut: F, cancel: &CancellationToken) -> Result<(), BrokerError>
where
    F: Future<Output = Result<(), TransportError>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tx.send(fut.await);
    });

    tokio::select! {
        biased;
        result = rx => match result {
            Ok(result) => result.map_err(BrokerError::from),
            Err(_) => Err(BrokerError::Transport(TransportError::Protocol(format!(
                "{} close task ended without a result",
                what
            )))),
        },
        _ = cancel.cancelled() => {
            warn!(what, "Close abandoned before completion");
            Err(BrokerError::Cancelled)
        }
    }
}

impl BrokerConnectionManager {
    /// Dial the broker and open the shared channel.
    ///
    /// Failure here is fatal: the caller is expected to abort startup.
    pub async fn connect(
        dialer: Arc<dyn Dialer>,
        dsn: impl Into<String>,
        config: &BusConfig,
    ) -> Result<Self, BrokerError> {
        let dsn = dsn.into();
        let (connection, channel) = open_link(dialer.as_ref(), &dsn)
            .await
            .map_err(BrokerError::Connect)?;

        let closed = Arc::new(AtomicBool::new(false));
        let generation = Arc::new(AtomicU64::new(0));
        let monitor = spawn_monitor(
            connection.close_signal(),
            channel.close_signal(),
            Arc::clone(&closed),
            Arc::clone(&generation),
            0,
        );

        info!("Connected to broker");
        Ok(Self {
            dialer,
            dsn,
            reconnect_policy: config.reconnect_policy(),
            link: Mutex::new(Link {
                connection,
                channel,
                monitor,
            }),
            closed,
            shut_down: AtomicBool::new(false),
            generation,
            reconnects: AtomicU64::new(0),
        })
    }

    fn healthy(&self, link: &Link) -> bool {
        !self.closed.load(Ordering::SeqCst) && link.is_open()
    }

    fn check_open(&self) -> Result<(), BrokerError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(BrokerError::ManagerClosed)
        } else {
            Ok(())
        }
    }

    /// Reconnect if the link is known or reported to be closed; otherwise no-op.
    pub async fn ensure_connection(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.check_open()?;
        let healthy = {
            let link = self.link.lock().await;
            self.healthy(&link)
        };
        if healthy {
            return Ok(());
        }
        self.reconnect(cancel).await
    }

    /// Replace the connection and channel.
    ///
    /// Serialized with other reconnects; returns immediately when another
    /// caller already restored the link.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut link = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            link = self.link.lock() => link,
        };
        self.check_open()?;
        if self.healthy(&link) {
            debug!("Link already healthy, skipping reconnect");
            return Ok(());
        }
        self.closed.store(true, Ordering::SeqCst);

        let dialer = self.dialer.as_ref();
        let dsn = self.dsn.as_str();
        let result = retry_with_backoff(&self.reconnect_policy, cancel, |attempt| async move {
            info!(attempt, "Reconnecting to broker");
            open_link(dialer, dsn).await
        })
        .await;

        let (connection, channel) = match result {
            Ok(pair) => pair,
            Err(RetryError::Cancelled) => return Err(BrokerError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(attempts, error = %last, "Reconnect attempts exhausted");
                return Err(BrokerError::ReconnectExhausted { attempts, last });
            }
            Err(RetryError::Aborted(last)) => {
                return Err(BrokerError::ReconnectExhausted { attempts: 1, last });
            }
        };

        if self.shut_down.load(Ordering::SeqCst) {
            info!("Manager closed during reconnect, dropping new link");
            tokio::spawn(async move {
                if let Err(e) = close_link(connection, channel).await {
                    debug!(error = %e, "Closing abandoned link failed");
                }
            });
            return Err(BrokerError::ManagerClosed);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        link.monitor.abort();
        link.monitor = spawn_monitor(
            connection.close_signal(),
            channel.close_signal(),
            Arc::clone(&self.closed),
            Arc::clone(&self.generation),
            generation,
        );
        link.connection = connection;
        link.channel = channel;
        self.closed.store(false, Ordering::SeqCst);
        self.reconnects.fetch_add(1, Ordering::SeqCst);

        info!(generation, "Reconnected to broker");
        Ok(())
    }

    /// The current channel, if the link is up.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.check_open()?;
        let link = self.link.lock().await;
        if !self.healthy(&link) {
            return Err(BrokerError::NotConnected);
        }
        Ok(Arc::clone(&link.channel))
    }

    /// Close the channel, then the connection.
    ///
    /// The manager is shut down as soon as this is called, whatever the
    /// outcome. The close is raced against `cancel`; on cancel this returns
    /// promptly while the close finishes in the background. Idempotent.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.store(true, Ordering::SeqCst);

        let (connection, channel) = {
            let link = tokio::select! {
                biased;
                link = self.link.lock() => link,
                _ = cancel.cancelled() => {
                    // The reconnect holding the lock sees the flag and closes its link.
                    warn!("Close cancelled while a reconnect held the link");
                    return Err(BrokerError::Cancelled);
                }
            };
            (Arc::clone(&link.connection), Arc::clone(&link.channel))
        };

        race_close("link", close_link(connection, channel), cancel).await?;
        info!("Broker connection closed");
        Ok(())
    }

    /// [`close`](Self::close) bounded by a timeout instead of a token.
    pub async fn close_within(&self, timeout: Duration) -> Result<(), BrokerError> {
        let deadline = CancellationToken::new();
        let timer = {
            let deadline = deadline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline.cancel();
            })
        };
        let result = self.close(&deadline).await;
        timer.abort();
        result
    }

    /// Closed flag as last observed by the monitor, or after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.shut_down.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Successful reconnects since startup.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }
}

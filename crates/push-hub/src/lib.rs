//! # Push Hub - Real-time Delivery to Riders and Drivers
//!
//! Keeps one live push connection per entity (rider or driver UUID) and
//! buffers what cannot be delivered until the entity reconnects.
//!
//! ```text
//!   send_to(id, payload)
//!          │
//!          ▼
//!   ┌───────────────┐  live   ┌────────────────┐
//!   │ ConnectionHub │ ──────▶ │ PushConnection │ ──▶ socket
//!   └──────┬────────┘         └────────────────┘
//!          │ missing / failed           ▲
//!          ▼                            │ add(conn) ──▶ replay
//!   ┌───────────────┐                   │
//!   │ PendingBuffer │ ──────────────────┘
//!   │ (64, oldest   │
//!   │  dropped)     │
//!   └───────────────┘
//! ```
//!
//! The hub never inspects payloads.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod pending;

#[cfg(feature = "ws")]
pub mod ws;

pub use config::{ConfigError, HubConfig};
pub use connection::{ChannelConnection, PushConnection};
pub use error::{HubError, PushError};
pub use hub::{ConnectionHub, HubStatsSnapshot, ReplayOutcome};
pub use pending::{PendingBuffer, PendingEntry, DEFAULT_PENDING_CAPACITY};

#[cfg(feature = "ws")]
pub use ws::{router, WsConnection};

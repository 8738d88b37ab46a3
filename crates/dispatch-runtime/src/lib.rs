//! # Ride Dispatch Runtime
//!
//! Wires the broker transport to the push hub.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration from the environment
//! 2. Initialize logging
//! 3. Connect to the broker (fatal on failure)
//! 4. Declare exchanges and durable queues
//! 5. Start relay consumers (driver status, ride status, ride location)
//! 6. Serve `/ws/:entity_id` when built with `ws`
//!
//! ## Relays
//!
//! ```text
//! driver_topic ── driver.status.* ──▶ driver_status ────▶ hub.send_to(driver)
//! ride_topic ──── ride.status.* ────▶ ride_status_push ─▶ hub.send_to(ride)
//! location_fanout ──────────────────▶ location_updates ─▶ hub.send_to(ride)
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod relays;
pub mod runtime;

pub use config::{ConfigError, NodeConfig};
pub use relays::{DriverStatusRelay, RideLocationRelay, RideStatusRelay};
pub use runtime::{bindings, declare_topology, DispatchRuntime, RIDE_STATUS_PUSH_QUEUE};

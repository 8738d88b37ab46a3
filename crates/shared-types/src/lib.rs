//! # Shared Types Crate
//!
//! Wire schemas, routing-key derivation and broker topology for the ride
//! dispatch bus.
//!
//! ## Design Principles
//!
//! - **Field names are the contract**: every schema here serializes to the JSON
//!   that other services already read. Renaming a field is a breaking change.
//! - **Routing keys are derived, never stored**: a message computes its own
//!   `<domain>.<event>.<discriminator>` key from its fields.
//! - **Topology is declared, not discovered**: exchanges and queue bindings are
//!   constants so every publisher and consumer declares them identically.

pub mod correlation;
pub mod geocoding;
pub mod messages;
pub mod topology;

pub use correlation::CorrelationId;
pub use geocoding::{Coordinates, Geocoder, GeocodingError};
pub use messages::{
    DriverMatchResponse, DriverStatusUpdateMessage, RideLocationUpdate, RideRequestedMessage,
    RideStatusUpdateMessage, RoutedMessage,
};
pub use topology::{ExchangeKind, ExchangeSpec, QueueBinding};

/// Content type stamped on every envelope published to the bus.
pub const JSON_CONTENT_TYPE: &str = "application/json";

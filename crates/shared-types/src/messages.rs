//! Message schemas published on the dispatch bus.
//!
//! Each schema implements [`RoutedMessage`], which ties it to its exchange and
//! derives the routing key from the message's own fields:
//!
//! | Message | Exchange | Routing key | Mandatory |
//! |---------|----------|-------------|-----------|
//! | `RideRequestedMessage` | `ride_topic` | `ride.request.<ride_type>` | yes |
//! | `RideStatusUpdateMessage` | `ride_topic` | `ride.status.<status>` | no |
//! | `DriverStatusUpdateMessage` | `driver_topic` | `driver.status.<driver_id>` | no |
//! | `DriverMatchResponse` | `driver_topic` | `driver.response.<ride_id>` | no |
//! | `RideLocationUpdate` | `location_fanout` | `location.update.<ride_id>` | no |

use crate::geocoding::Coordinates;
use crate::topology::{ExchangeSpec, DRIVER_TOPIC, LOCATION_FANOUT, RIDE_TOPIC};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A schema that knows where it is published.
pub trait RoutedMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Exchange this message type is published to.
    fn exchange() -> ExchangeSpec;

    /// Routing key derived from the message fields.
    fn routing_key(&self) -> String;

    /// Whether the broker must be able to route the message to at least one queue.
    fn mandatory() -> bool {
        false
    }

    fn priority(&self) -> Option<u8> {
        None
    }

    /// Correlation token carried in the body, if the schema has one.
    fn correlation_id(&self) -> Option<&str> {
        None
    }

    fn ride_id(&self) -> Option<&str> {
        None
    }

    fn driver_id(&self) -> Option<&str> {
        None
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// A rider asked for a ride; matching must pick it up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideRequestedMessage {
    pub ride_id: String,
    pub ride_type: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub correlation_id: String,
}

impl RoutedMessage for RideRequestedMessage {
    fn exchange() -> ExchangeSpec {
        RIDE_TOPIC
    }

    fn routing_key(&self) -> String {
        format!("ride.request.{}", self.ride_type)
    }

    /// An unroutable ride request is a hard failure: nobody would ever match it.
    fn mandatory() -> bool {
        true
    }

    fn priority(&self) -> Option<u8> {
        Some(self.priority)
    }

    fn correlation_id(&self) -> Option<&str> {
        non_empty(&self.correlation_id)
    }

    fn ride_id(&self) -> Option<&str> {
        non_empty(&self.ride_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideStatusUpdateMessage {
    pub ride_id: String,
    pub status: String,
    #[serde(default)]
    pub correlation_id: String,
}

impl RoutedMessage for RideStatusUpdateMessage {
    fn exchange() -> ExchangeSpec {
        RIDE_TOPIC
    }

    fn routing_key(&self) -> String {
        format!("ride.status.{}", self.status)
    }

    fn correlation_id(&self) -> Option<&str> {
        non_empty(&self.correlation_id)
    }

    fn ride_id(&self) -> Option<&str> {
        non_empty(&self.ride_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatusUpdateMessage {
    pub driver_id: String,
    pub status: String,
}

impl RoutedMessage for DriverStatusUpdateMessage {
    fn exchange() -> ExchangeSpec {
        DRIVER_TOPIC
    }

    fn routing_key(&self) -> String {
        format!("driver.status.{}", self.driver_id)
    }

    fn driver_id(&self) -> Option<&str> {
        non_empty(&self.driver_id)
    }
}

/// A driver's answer to a match offer for one ride.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverMatchResponse {
    pub ride_id: String,
    pub driver_id: String,
    pub accepted: bool,
}

impl RoutedMessage for DriverMatchResponse {
    fn exchange() -> ExchangeSpec {
        DRIVER_TOPIC
    }

    fn routing_key(&self) -> String {
        format!("driver.response.{}", self.ride_id)
    }

    fn ride_id(&self) -> Option<&str> {
        non_empty(&self.ride_id)
    }

    fn driver_id(&self) -> Option<&str> {
        non_empty(&self.driver_id)
    }
}

/// Driver position, optionally tied to the ride being served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideLocationUpdate {
    pub ride_id: Option<String>,
    #[serde(flatten)]
    pub coordinates: Coordinates,
}

impl RoutedMessage for RideLocationUpdate {
    fn exchange() -> ExchangeSpec {
        LOCATION_FANOUT
    }

    /// Fanout ignores the key; it is still set so broker traces stay readable.
    fn routing_key(&self) -> String {
        match self.ride_id.as_deref().and_then(non_empty) {
            Some(ride_id) => format!("location.update.{}", ride_id),
            None => "location.update.unassigned".to_string(),
        }
    }

    fn ride_id(&self) -> Option<&str> {
        self.ride_id.as_deref().and_then(non_empty)
    }
}

//! Bus-to-socket relays.
//!
//! Each relay consumes one queue and pushes the message, unchanged, to the
//! rider or driver it concerns. A missing connection is not an error: the hub
//! has already buffered the payload for replay.

use async_trait::async_trait;
use push_hub::{ConnectionHub, HubError};
use ride_telemetry::RequestContext;
use serde::Serialize;
use shared_bus::{routed_context, DeliveryHandler, HandlerError};
use shared_types::messages::{DriverStatusUpdateMessage, RideLocationUpdate, RideStatusUpdateMessage};
use tracing::debug;
use uuid::Uuid;

async fn relay<T: Serialize + Sync>(
    hub: &ConnectionHub,
    entity: &str,
    message: &T,
) -> Result<(), HandlerError> {
    let entity_id = Uuid::parse_str(entity)
        .map_err(|_| HandlerError::Fatal(format!("entity id is not a UUID: {entity}")))?;

    match hub.send_json(entity_id, message).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_buffered() => {
            debug!(entity_id = %entity_id, reason = %e, "Relay buffered for replay");
            Ok(())
        }
        Err(HubError::Closed) => Err(HandlerError::Other(anyhow::anyhow!("push hub is closed"))),
        Err(e) => Err(HandlerError::Fatal(e.to_string())),
    }
}

/// Driver status changes to the driver's socket.
pub struct DriverStatusRelay {
    hub: ConnectionHub,
}

impl DriverStatusRelay {
    pub fn new(hub: ConnectionHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl DeliveryHandler for DriverStatusRelay {
    type Message = DriverStatusUpdateMessage;

    fn name(&self) -> &'static str {
        "relay_driver_status"
    }

    fn context(&self, message: &DriverStatusUpdateMessage) -> RequestContext {
        routed_context(message).with_entity_id(&message.driver_id)
    }

    async fn handle(
        &self,
        _ctx: RequestContext,
        message: DriverStatusUpdateMessage,
    ) -> Result<(), HandlerError> {
        relay(&self.hub, &message.driver_id, &message).await
    }
}

/// Ride status changes to the rider's socket, keyed by ride id.
pub struct RideStatusRelay {
    hub: ConnectionHub,
}

impl RideStatusRelay {
    pub fn new(hub: ConnectionHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl DeliveryHandler for RideStatusRelay {
    type Message = RideStatusUpdateMessage;

    fn name(&self) -> &'static str {
        "relay_ride_status"
    }

    fn context(&self, message: &RideStatusUpdateMessage) -> RequestContext {
        routed_context(message).with_entity_id(&message.ride_id)
    }

    async fn handle(
        &self,
        _ctx: RequestContext,
        message: RideStatusUpdateMessage,
    ) -> Result<(), HandlerError> {
        relay(&self.hub, &message.ride_id, &message).await
    }
}

/// Driver positions to the socket of the ride being served.
pub struct RideLocationRelay {
    hub: ConnectionHub,
}

impl RideLocationRelay {
    pub fn new(hub: ConnectionHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl DeliveryHandler for RideLocationRelay {
    type Message = RideLocationUpdate;

    fn name(&self) -> &'static str {
        "relay_ride_location"
    }

    fn context(&self, message: &RideLocationUpdate) -> RequestContext {
        routed_context(message)
    }

    async fn handle(&self, _ctx: RequestContext, message: RideLocationUpdate) -> Result<(), HandlerError> {
        match message.ride_id.as_deref() {
            Some(ride_id) if !ride_id.is_empty() => relay(&self.hub, ride_id, &message).await,
            // Idle drivers have nobody to notify.
            _ => Ok(()),
        }
    }
}

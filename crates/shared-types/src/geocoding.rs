//! Geocoding port.
//!
//! The HTTP adapter lives outside this workspace; dispatch code depends only
//! on this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A point on the map, WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Error)]
pub enum GeocodingError {
    /// The provider answered with zero results.
    #[error("no geocoding results for {0}")]
    NotFound(String),

    #[error("geocoding provider error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Reverse geocode a coordinate pair into a display address.
    async fn address(&self, lon: f64, lat: f64) -> Result<String, GeocodingError>;

    /// Forward geocode an address into coordinates.
    async fn location(&self, address: &str) -> Result<Coordinates, GeocodingError>;
}

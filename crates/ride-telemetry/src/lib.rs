//! # Ride Telemetry
//!
//! Structured logging and request-context propagation for the dispatch
//! services.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ride_telemetry::{init_logging, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RIDE_SERVICE_NAME` | `ride-dispatch` | Service name stamped on every log line |
//! | `RIDE_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `RIDE_JSON_LOGS` | `false` (true in containers) | JSON formatted output |

mod config;
mod context;
mod logging;

pub use config::TelemetryConfig;
pub use context::RequestContext;
pub use logging::init_logging;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber is already installed (tests, embedding binaries).
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

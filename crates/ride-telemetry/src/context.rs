//! Request context propagation.
//!
//! Correlation and entity identifiers travel as an explicit, immutable value
//! passed down through function parameters instead of ambient task-locals.
//! Each enrichment point derives a new context with [`RequestContext::merge`];
//! the parent is never mutated.
//!
//! ```rust,ignore
//! let base = RequestContext::new().with_operation("consume.driver_status");
//! let per_message = RequestContext::new()
//!     .with_correlation_id(envelope_correlation)
//!     .with_driver_id(&msg.driver_id);
//! let ctx = base.merge(&per_message);
//! let span = ctx.span();
//! ```

use serde::{Deserialize, Serialize};
use shared_types::CorrelationId;
use tracing::field;

/// Immutable set of identifiers describing the work in progress.
///
/// Empty strings are normalized away, so "set to empty" and "unset" mean
/// the same thing everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    correlation_id: Option<CorrelationId>,
    ride_id: Option<String>,
    driver_id: Option<String>,
    entity_id: Option<String>,
    operation: Option<String>,
}

fn normalized(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set the correlation id from a wire token; blank tokens leave it unset.
    pub fn with_correlation_token(mut self, token: &str) -> Self {
        if let Some(id) = CorrelationId::parse(token) {
            self.correlation_id = Some(id);
        }
        self
    }

    pub fn with_ride_id(mut self, ride_id: &str) -> Self {
        self.ride_id = normalized(ride_id).or(self.ride_id);
        self
    }

    pub fn with_driver_id(mut self, driver_id: &str) -> Self {
        self.driver_id = normalized(driver_id).or(self.driver_id);
        self
    }

    pub fn with_entity_id(mut self, entity_id: &str) -> Self {
        self.entity_id = normalized(entity_id).or(self.entity_id);
        self
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = normalized(operation).or(self.operation);
        self
    }

    /// Derive a child context: fields set on `child` win, everything else is inherited.
    #[must_use]
    pub fn merge(&self, child: &RequestContext) -> RequestContext {
        RequestContext {
            correlation_id: child
                .correlation_id
                .clone()
                .or_else(|| self.correlation_id.clone()),
            ride_id: child.ride_id.clone().or_else(|| self.ride_id.clone()),
            driver_id: child.driver_id.clone().or_else(|| self.driver_id.clone()),
            entity_id: child.entity_id.clone().or_else(|| self.entity_id.clone()),
            operation: child.operation.clone().or_else(|| self.operation.clone()),
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn ride_id(&self) -> Option<&str> {
        self.ride_id.as_deref()
    }

    pub fn driver_id(&self) -> Option<&str> {
        self.driver_id.as_deref()
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// Span carrying every set field; unset fields stay empty in the output.
    pub fn span(&self) -> tracing::Span {
        let span = tracing::info_span!(
            "request",
            operation = field::Empty,
            correlation_id = field::Empty,
            ride_id = field::Empty,
            driver_id = field::Empty,
            entity_id = field::Empty,
        );
        if let Some(op) = &self.operation {
            span.record("operation", op.as_str());
        }
        if let Some(id) = &self.correlation_id {
            span.record("correlation_id", id.as_str());
        }
        if let Some(id) = &self.ride_id {
            span.record("ride_id", id.as_str());
        }
        if let Some(id) = &self.driver_id {
            span.record("driver_id", id.as_str());
        }
        if let Some(id) = &self.entity_id {
            span.record("entity_id", id.as_str());
        }
        span
    }
}

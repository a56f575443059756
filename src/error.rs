//! Error types for cachemesh.
//!
//! This module provides a unified error type [`CacheMeshError`] for all cache
//! coordination operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Admission**: the rate limiter or a circuit breaker refused the call
//! - **Provider**: a single edge provider call failed or timed out
//! - **Graph**: the dependency index was found inconsistent
//! - **Configuration**: invalid settings, rejected at construction time
//! - **Transport/Serialization**: invalidation bus plumbing
//!
//! Provider and admission errors never escape the edge manager: they are folded
//! into failure [`PurgeResult`](crate::edge::PurgeResult)s so every fan-out call
//! site sees one result shape.
//!
//! # Example
//!
//! ```rust
//! use cachemesh::error::{CacheMeshError, Result};
//!
//! fn capacity(value: f64) -> Result<f64> {
//!     if value < 0.0 {
//!         return Err(CacheMeshError::InvalidConfig {
//!             field: "capacity".into(),
//!             reason: "must be non-negative".into(),
//!         });
//!     }
//!     Ok(value)
//! }
//!
//! assert!(capacity(-1.0).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for cachemesh operations.
#[derive(Error, Debug)]
pub enum CacheMeshError {
    // Admission control
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    // Provider errors
    #[error("Provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    // Dependency graph
    #[error("Dependency graph inconsistency: {0}")]
    GraphInconsistency(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Plumbing
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheMeshError {
    /// Build a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        CacheMeshError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Check if the error was produced by admission control rather than by
    /// the guarded operation itself.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CacheMeshError::RateLimitExceeded(_) | CacheMeshError::CircuitOpen(_)
        )
    }

    /// Check if the failure should count against a circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            CacheMeshError::Provider { .. }
                | CacheMeshError::Timeout(_)
                | CacheMeshError::Transport(_)
                | CacheMeshError::Io(_)
        )
    }
}

impl From<serde_json::Error> for CacheMeshError {
    fn from(e: serde_json::Error) -> Self {
        CacheMeshError::Serialization(e.to_string())
    }
}

/// Result type alias for cachemesh operations.
pub type Result<T> = std::result::Result<T, CacheMeshError>;

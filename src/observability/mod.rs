//! Observability for CacheMesh.
//!
//! Sets up structured logging and names the metrics the engine emits through
//! the `metrics` facade. Installing an exporter is left to the embedding
//! application; without one every recording call is a no-op.

use crate::config::ObservabilityConfig;
use crate::error::{CacheMeshError, Result};
use crate::resilience::CircuitState;
use tracing::info;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize observability (logging and metric descriptions).
///
/// `RUST_LOG` takes precedence over the configured log level.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| CacheMeshError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| CacheMeshError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    if config.metrics_enabled {
        register_metrics();
    }

    info!(
        level = %config.log_level,
        json = config.json_logs,
        metrics = config.metrics_enabled,
        "Observability initialized"
    );
    Ok(())
}

/// Describe every metric the engine emits.
pub fn register_metrics() {
    // Edge
    describe_counter!("cachemesh_edge_purges_total", "Edge purge calls by provider and outcome");
    describe_counter!("cachemesh_edge_purged_objects_total", "Objects purged from edge caches");
    describe_gauge!("cachemesh_edge_purge_cost_total", "Accumulated provider-reported purge cost");
    describe_histogram!("cachemesh_edge_purge_latency_seconds", "Edge purge latency");

    // Admission control
    describe_counter!("cachemesh_rate_limit_decisions_total", "Token bucket decisions by outcome");
    describe_gauge!(
        "cachemesh_circuit_state",
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );

    // Invalidation
    describe_counter!("cachemesh_invalidation_published_total", "Invalidation messages published");
    describe_counter!(
        "cachemesh_invalidation_received_total",
        "Invalidation messages received by outcome"
    );
}

/// Record a circuit breaker state transition.
pub fn record_circuit_state(circuit: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("cachemesh_circuit_state", "circuit" => circuit.to_string()).set(value);
}

/// Record a token bucket admission decision.
pub fn record_rate_limit(limiter: &str, admitted: bool) {
    let outcome = if admitted { "admitted" } else { "rejected" };
    counter!(
        "cachemesh_rate_limit_decisions_total",
        "limiter" => limiter.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

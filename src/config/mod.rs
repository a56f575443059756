//! Configuration module for cachemesh.

use crate::edge::EdgeConfig;
use crate::error::{CacheMeshError, Result};
use crate::ratelimit::RateLimitConfig;
use crate::resilience::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a cachemesh node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheMeshConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Edge purge admission.
    pub rate_limit: RateLimitConfig,
    /// Per-provider circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Edge manager configuration.
    pub edge: EdgeConfig,
    /// Cross-instance invalidation configuration.
    pub invalidation: InvalidationConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl CacheMeshConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheMeshError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            CacheMeshError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            return Err(CacheMeshError::InvalidConfig {
                field: "node.name".to_string(),
                reason: "Node name must not be empty".to_string(),
            });
        }

        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        self.edge.validate()?;
        self.invalidation.validate()?;
        Ok(())
    }

    /// Create a development configuration: relaxed limits, short timeouts,
    /// verbose logs.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                name: "dev-node".to_string(),
                instance_id: None,
            },
            rate_limit: RateLimitConfig::relaxed(),
            circuit_breaker: CircuitBreakerConfig::aggressive(),
            edge: EdgeConfig {
                batch_size: 10,
                batch_timeout: Duration::from_millis(50),
                max_concurrency: 4,
                provider_timeout: Duration::from_secs(2),
                health_check_timeout: Duration::from_millis(500),
            },
            invalidation: InvalidationConfig {
                enabled: true,
                channel: "cachemesh-dev-invalidation".to_string(),
                buffer_size: 256,
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
                metrics_enabled: true,
            },
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name.
    pub name: String,
    /// Fixed instance identifier; a random UUID is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "cachemesh-node".to_string(),
            instance_id: None,
        }
    }
}

impl NodeConfig {
    /// Resolve the instance id used to stamp outgoing invalidations.
    pub fn resolve_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Cross-instance invalidation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Publish and consume invalidation messages.
    pub enabled: bool,
    /// Channel or topic shared by every instance.
    pub channel: String,
    /// Per-subscriber buffer of the in-process transport.
    pub buffer_size: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "cachemesh-invalidation".to_string(),
            buffer_size: 1024,
        }
    }
}

impl InvalidationConfig {
    /// Validate the section.
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.channel.trim().is_empty() {
            return Err(CacheMeshError::InvalidConfig {
                field: "invalidation.channel".to_string(),
                reason: "Channel must not be empty".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(CacheMeshError::InvalidConfig {
                field: "invalidation.buffer_size".to_string(),
                reason: "Buffer size must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Record purge metrics through the `metrics` facade.
    pub metrics_enabled: bool,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn scaled_secs(value: u64, unit_secs: u64, raw: &str) -> Result<Duration, String> {
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {}", raw))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.trim()
                .parse::<u64>()
                .map_err(|e| e.to_string())
                .and_then(|v| scaled_secs(v, 60, s))
        } else if let Some(h) = s.strip_suffix('h') {
            h.trim()
                .parse::<u64>()
                .map_err(|e| e.to_string())
                .and_then(|v| scaled_secs(v, 3600, s))
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CacheMeshConfig::default();
        assert_eq!(config.node.name, "cachemesh-node");
        assert_eq!(config.edge.batch_size, 30);
        assert!(config.invalidation.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = CacheMeshConfig::development();
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.edge.batch_timeout, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_channel() {
        let mut config = CacheMeshConfig::default();
        config.invalidation.channel = " ".to_string();
        match config.validate() {
            Err(CacheMeshError::InvalidConfig { field, .. }) => {
                assert_eq!(field, "invalidation.channel")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "node": {{ "name": "edge-eu-1", "instance_id": "eu-1" }},
                "edge": {{
                    "batch_size": 5,
                    "batch_timeout": "250ms",
                    "max_concurrency": 2,
                    "provider_timeout": "3s",
                    "health_check_timeout": "1s"
                }}
            }}"#
        )
        .unwrap();

        let config = CacheMeshConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.resolve_instance_id(), "eu-1");
        assert_eq!(config.edge.batch_size, 5);
        assert_eq!(config.edge.batch_timeout, Duration::from_millis(250));
        assert_eq!(config.edge.provider_timeout, Duration::from_secs(3));
        // Missing sections fall back to defaults
        assert_eq!(config.invalidation.channel, "cachemesh-invalidation");
    }

    #[test]
    fn test_from_file_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            CacheMeshConfig::from_file(file.path()),
            Err(CacheMeshError::Config(_))
        ));
    }

    #[test]
    fn test_generated_instance_ids_are_unique() {
        let node = NodeConfig::default();
        assert_ne!(node.resolve_instance_id(), node.resolve_instance_id());
    }

    #[test]
    fn test_parse_duration_units() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("75"), Ok(Duration::from_millis(75)));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("18446744073709551615m").is_err());
        assert!(parse_duration("18446744073709551615h").is_err());
    }
}

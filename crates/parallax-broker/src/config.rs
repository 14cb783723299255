//! Configuration types for the broker.

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

use parallax_core::{CacheConfig, RetryPolicy};
use parallax_registry::RegistryConfig;
use parallax_router::RouterConfig;

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker identifier; a UUID is generated when absent.
    pub broker_id: Option<String>,
    /// Default cluster membership for this broker.
    pub clustername: String,
    /// Per-ask deadline.
    #[serde(with = "serde_duration_ms")]
    pub rpc_timeout: Duration,
    /// Maximum age a worker may have and still be recovered; zero means
    /// unlimited.
    #[serde(with = "serde_duration_ms")]
    pub ttl: Duration,
    /// Maximum workers fetched per recovery iteration.
    pub batch_read_size: u32,
    /// Broker-address cache sizing.
    pub broker_cache: BrokerCacheConfig,
    /// Backoff policy for find/ask/tell.
    pub retries: RetryConfig,
    /// Router idle timeout; the server side uses twice this value.
    #[serde(with = "serde_duration_ms")]
    pub soc_timeout: Duration,
    /// Health-check period in seconds; zero disables the ring check.
    #[serde(with = "serde_duration_secs")]
    pub health_check_interval: Duration,
    /// Explicit listener bind address; defaults to the local interface of
    /// the registry connection.
    pub bind_host: Option<IpAddr>,
    /// Registry connection.
    pub registry: RegistryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: None,
            clustername: "main".to_owned(),
            rpc_timeout: Duration::from_millis(3000),
            ttl: Duration::ZERO,
            batch_read_size: 1,
            broker_cache: BrokerCacheConfig::default(),
            retries: RetryConfig::default(),
            soc_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
            bind_host: None,
            registry: RegistryConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Router configuration derived from this broker's settings.
    #[must_use]
    pub const fn router(&self) -> RouterConfig {
        RouterConfig {
            soc_timeout: self.soc_timeout,
        }
    }

    /// Address-cache configuration.
    #[must_use]
    pub const fn cache(&self) -> CacheConfig {
        CacheConfig {
            max: self.broker_cache.max,
            max_age: self.broker_cache.max_age,
        }
    }

    /// Retry policy for the backoff drivers.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: self.retries.initial_interval,
            max_interval: self.retries.max_interval,
            duration: self.retries.duration,
        }
    }

    /// Recovery TTL in milliseconds (zero means unlimited).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    pub const fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }
}

/// Broker-address cache sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerCacheConfig {
    /// Maximum number of cached addresses.
    pub max: usize,
    /// Maximum entry age.
    #[serde(with = "serde_duration_ms")]
    pub max_age: Duration,
}

impl Default for BrokerCacheConfig {
    fn default() -> Self {
        Self {
            max: 2048,
            max_age: Duration::from_secs(60),
        }
    }
}

/// Backoff policy for find/ask/tell drivers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    #[serde(with = "serde_duration_ms")]
    pub initial_interval: Duration,
    /// Ceiling for the doubled delay.
    #[serde(with = "serde_duration_ms")]
    pub max_interval: Duration,
    /// Total retry budget.
    #[serde(with = "serde_duration_ms")]
    pub duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(1000),
            duration: Duration::from_millis(10_000),
        }
    }
}

/// Serde helper for Duration as milliseconds.
mod serde_duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.clustername, "main");
        assert_eq!(config.rpc_timeout, Duration::from_millis(3000));
        assert_eq!(config.ttl, Duration::ZERO);
        assert_eq!(config.batch_read_size, 1);
        assert_eq!(config.health_check_interval, Duration::from_secs(10));
        assert!(config.broker_id.is_none());
        assert!(config.bind_host.is_none());
    }

    #[test]
    fn deserialises_durations_from_numbers() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{
                "clustername": "pvp",
                "rpc_timeout": 5000,
                "ttl": 60000,
                "health_check_interval": 30,
                "retries": {"initial_interval": 10, "max_interval": 100, "duration": 2000}
            }"#,
        )
        .unwrap();
        assert_eq!(config.clustername, "pvp");
        assert_eq!(config.rpc_timeout, Duration::from_secs(5));
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.retries.duration, Duration::from_secs(2));
    }

    #[test]
    fn derived_views() {
        let config = BrokerConfig::default();
        assert_eq!(config.router().soc_timeout, config.soc_timeout);
        assert_eq!(config.cache().max, config.broker_cache.max);
        assert_eq!(
            config.retry_policy().initial_interval,
            config.retries.initial_interval
        );
        assert_eq!(config.ttl_ms(), 0);
    }
}

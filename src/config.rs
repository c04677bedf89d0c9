//! Configuration of the connection manager and of the outbound throttle.
//!
//! Durations are expressed in seconds (floating point) when deserialized, so that
//! adapters can ship their settings as plain JSON.

use std::time::Duration;
use serde::{Deserialize, Deserializer};

use crate::core::{Result, StreamError};


const DEFAULT_KEEP_ALIVE_SECS: f64 = 30.0;
const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_THROTTLE_DELAY_SECS: f64 = 0.001;
const DEFAULT_MAX_BACKLOG: usize = 1000;


fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

/// Settings of a [Client](crate::client::Client).
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Interval between liveness probes. A connection with no inbound frame
    /// for twice this interval is torn down.
    #[serde(deserialize_with = "seconds")]
    pub keep_alive_interval: Duration,
    /// Upper bound on the transport handshake.
    #[serde(deserialize_with = "seconds")]
    pub connect_timeout: Duration,
    /// Throttle cost of each outbound data frame.
    pub send_cost: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs_f64(DEFAULT_KEEP_ALIVE_SECS),
            connect_timeout: Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT_SECS),
            send_cost: 1.0,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|error| StreamError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(StreamError::Config("keepAliveInterval must be positive".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(StreamError::Config("connectTimeout must be positive".to_string()));
        }
        if !(self.send_cost >= 0.0) {
            return Err(StreamError::Config("sendCost must not be negative".to_string()));
        }
        Ok(())
    }
}

/// Token-bucket parameters of a [Throttle](crate::throttle::Throttle).
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ThrottleConfig {
    /// Maximum number of tokens the bucket holds.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Pause of the pump between two refills while requests are waiting.
    #[serde(deserialize_with = "seconds")]
    pub delay: Duration,
    /// Cost used by [acquire_default](crate::throttle::Throttle::acquire_default).
    pub default_cost: f64,
    /// Maximum number of queued requests; beyond it acquisitions fail.
    pub max_capacity: usize,
    /// Tokens available when the throttle is created.
    pub tokens: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity: 1.0,
            refill_rate: 1.0,
            delay: Duration::from_secs_f64(DEFAULT_THROTTLE_DELAY_SECS),
            default_cost: 1.0,
            max_capacity: DEFAULT_MAX_BACKLOG,
            tokens: 0.0,
        }
    }
}

impl ThrottleConfig {
    /// Configuration matching a "one call every `rate_limit`" exchange policy.
    pub fn from_rate_limit(rate_limit: Duration) -> Self {
        Self {
            refill_rate: 1.0 / rate_limit.as_secs_f64(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|error| StreamError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.capacity > 0.0) {
            return Err(StreamError::Config("capacity must be positive".to_string()));
        }
        if !(self.refill_rate > 0.0) || !self.refill_rate.is_finite() {
            return Err(StreamError::Config("refillRate must be positive".to_string()));
        }
        if self.delay.is_zero() {
            return Err(StreamError::Config("delay must be positive".to_string()));
        }
        if !(self.default_cost >= 0.0) {
            return Err(StreamError::Config("defaultCost must not be negative".to_string()));
        }
        if !(self.tokens >= 0.0) {
            return Err(StreamError::Config("tokens must not be negative".to_string()));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_client_config_from_json() {
        let config = ClientConfig::from_json(r#"{"keepAliveInterval": 2.5, "connectTimeout": 1}"#).unwrap();
        assert_eq!(config.keep_alive_interval, Duration::from_millis(2500));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_client_config_rejects_zero_interval() {
        let result = ClientConfig::from_json(r#"{"keepAliveInterval": 0}"#);
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[test]
    fn test_throttle_config_from_json() {
        let config = ThrottleConfig::from_json(
            r#"{"capacity": 5, "refillRate": 0.5, "delay": 0.01, "maxCapacity": 10}"#
        ).unwrap();
        assert_eq!(config.capacity, 5.0);
        assert_eq!(config.refill_rate, 0.5);
        assert_eq!(config.delay, Duration::from_millis(10));
        assert_eq!(config.max_capacity, 10);
        assert_eq!(config.default_cost, 1.0);
    }

    #[test]
    fn test_throttle_config_from_rate_limit() {
        let config = ThrottleConfig::from_rate_limit(Duration::from_millis(50));
        assert!((config.refill_rate - 20.0).abs() < 1e-9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_throttle_config_rejects_negative_tokens() {
        let config = ThrottleConfig { tokens: -1.0, ..ThrottleConfig::default() };
        assert!(config.validate().is_err());
    }
}

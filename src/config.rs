//! Engine configuration from `KOKEILU_*` environment variables
//!
//! - `KOKEILU_PORT`: HTTP listen port (default: 8080)
//! - `KOKEILU_METRICS_READER_ADDRESS`: metrics service base URL (default: unset, no-op reader)
//! - `KOKEILU_METRICS_TIMEOUT_SECONDS`: per-iteration fetch timeout (default: 5)
//! - `KOKEILU_DEFAULT_PAGE_SIZE`: page size used when a request asks for 0 (default: 10)
//! - `KOKEILU_MAX_PAGE_SIZE`: larger page sizes are clamped to this (default: 100)
//! - `KOKEILU_MAX_BATCH_SIZE`: most pairs accepted in one result batch (default: 100)

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_METRICS_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const DEFAULT_MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Inconsistent(String),
}

/// Listing limits applied by the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingLimits {
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub max_batch_size: usize,
}

impl Default for PagingLimits {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub port: u16,
    /// None means results always come back as `NoData`
    pub metrics_reader_address: Option<String>,
    pub metrics_timeout: Duration,
    pub limits: PagingLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            metrics_reader_address: None,
            metrics_timeout: Duration::from_secs(DEFAULT_METRICS_TIMEOUT_SECONDS),
            limits: PagingLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let config = Self {
            port: parse_or(get("KOKEILU_PORT"), "KOKEILU_PORT", DEFAULT_PORT)?,
            metrics_reader_address: get("KOKEILU_METRICS_READER_ADDRESS"),
            metrics_timeout: Duration::from_secs(parse_or(
                get("KOKEILU_METRICS_TIMEOUT_SECONDS"),
                "KOKEILU_METRICS_TIMEOUT_SECONDS",
                DEFAULT_METRICS_TIMEOUT_SECONDS,
            )?),
            limits: PagingLimits {
                default_page_size: parse_or(
                    get("KOKEILU_DEFAULT_PAGE_SIZE"),
                    "KOKEILU_DEFAULT_PAGE_SIZE",
                    DEFAULT_PAGE_SIZE,
                )?,
                max_page_size: parse_or(
                    get("KOKEILU_MAX_PAGE_SIZE"),
                    "KOKEILU_MAX_PAGE_SIZE",
                    DEFAULT_MAX_PAGE_SIZE,
                )?,
                max_batch_size: parse_or(
                    get("KOKEILU_MAX_BATCH_SIZE"),
                    "KOKEILU_MAX_BATCH_SIZE",
                    DEFAULT_MAX_BATCH_SIZE,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics_timeout.is_zero() {
            return Err(ConfigError::Inconsistent(
                "KOKEILU_METRICS_TIMEOUT_SECONDS must be at least 1".to_string(),
            ));
        }
        if self.limits.max_page_size == 0 {
            return Err(ConfigError::Inconsistent(
                "KOKEILU_MAX_PAGE_SIZE must be at least 1".to_string(),
            ));
        }
        if self.limits.default_page_size == 0
            || self.limits.default_page_size > self.limits.max_page_size
        {
            return Err(ConfigError::Inconsistent(format!(
                "KOKEILU_DEFAULT_PAGE_SIZE must be between 1 and {}",
                self.limits.max_page_size
            )));
        }
        if self.limits.max_batch_size == 0 {
            return Err(ConfigError::Inconsistent(
                "KOKEILU_MAX_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T>(value: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            reason: e.to_string(),
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.port, 8080);
        assert!(config.metrics_reader_address.is_none());
        assert_eq!(config.metrics_timeout, Duration::from_secs(5));
        assert_eq!(config.limits.default_page_size, 10);
        assert_eq!(config.limits.max_page_size, 100);
        assert_eq!(config.limits.max_batch_size, 100);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("KOKEILU_PORT", "9090"),
            ("KOKEILU_METRICS_READER_ADDRESS", "http://metrics:9000"),
            ("KOKEILU_METRICS_TIMEOUT_SECONDS", "2"),
            ("KOKEILU_DEFAULT_PAGE_SIZE", "25"),
            ("KOKEILU_MAX_PAGE_SIZE", "50"),
            ("KOKEILU_MAX_BATCH_SIZE", "20"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(
            config.metrics_reader_address.as_deref(),
            Some("http://metrics:9000")
        );
        assert_eq!(config.metrics_timeout, Duration::from_secs(2));
        assert_eq!(config.limits.default_page_size, 25);
        assert_eq!(config.limits.max_page_size, 50);
        assert_eq!(config.limits.max_batch_size, 20);
    }

    #[test]
    fn test_blank_address_is_unset() {
        let config =
            EngineConfig::from_lookup(lookup(&[("KOKEILU_METRICS_READER_ADDRESS", "  ")])).unwrap();
        assert!(config.metrics_reader_address.is_none());
    }

    #[test]
    fn test_non_numeric_port_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("KOKEILU_PORT", "eighty")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "KOKEILU_PORT",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_max_page_size_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("KOKEILU_MAX_PAGE_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn test_default_above_max_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[
            ("KOKEILU_DEFAULT_PAGE_SIZE", "200"),
            ("KOKEILU_MAX_PAGE_SIZE", "100"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("KOKEILU_DEFAULT_PAGE_SIZE"));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err =
            EngineConfig::from_lookup(lookup(&[("KOKEILU_METRICS_TIMEOUT_SECONDS", "0")]))
                .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration.
//!
//! The host hands the engine a flat `key=value;key=value` string at
//! initialization; this module parses it into a typed [`EngineConfig`].
//! Unknown keys are rejected so typos fail loudly at boot instead of
//! silently running with defaults.

use std::fmt;

/// Default slab pool budget (64 MiB).
pub const DEFAULT_CACHE_SIZE: usize = 64 * 1024 * 1024;
/// Default slab class growth factor.
pub const DEFAULT_FACTOR: f64 = 1.25;
/// Default smallest chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 48;
/// Default per-value size cap (1 MiB).
pub const DEFAULT_ITEM_SIZE_MAX: usize = 1024 * 1024;
/// Default connection-level replication buffer (10 MiB).
pub const DEFAULT_DCP_CONN_BUFFER_SIZE: u32 = 10 * 1024 * 1024;
/// Seconds without any replication message before the peer is declared dead.
pub const DEFAULT_DCP_IDLE_TIMEOUT: u32 = 360;
/// How often the consumer emits a NOOP when nothing else is due (seconds).
pub const DEFAULT_DCP_NOOP_TX_INTERVAL: u32 = 1;
/// Messages applied per stream buffer batch.
pub const DEFAULT_DCP_BATCH_SIZE: usize = 10;
/// Batches drained before the processor yields back to the worker pool.
pub const DEFAULT_DCP_YIELD_LIMIT: usize = 10;

/// Error produced while parsing a configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The key is not recognized.
    UnknownKey(String),
    /// The value could not be parsed for the key's type.
    InvalidValue { key: String, value: String },
    /// A fragment was not of the form `key=value`.
    Malformed(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownKey(key) => write!(f, "unknown config key: {}", key),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value for {}: {}", key, value)
            }
            ConfigError::Malformed(frag) => write!(f, "malformed config fragment: {}", frag),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Typed engine configuration with memcached-bucket defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total slab pool budget in bytes.
    pub cache_size: usize,
    /// Slab class growth factor, clamped to [1.05, 2.0].
    pub factor: f64,
    /// Smallest slab chunk size, at least 48 bytes.
    pub chunk_size: usize,
    /// Per-value size cap.
    pub item_size_max: usize,
    /// Eagerly distribute the pool across classes at boot.
    pub preallocate: bool,
    /// Evict from the LRU tail when the pool is exhausted.
    pub evict_to_free: bool,
    /// Retain tombstones after a delete-as-store.
    pub keep_deleted: bool,
    /// Admit every vbucket regardless of state.
    pub ignore_vbucket: bool,
    /// Mark vbucket 0 active at init.
    pub vb0: bool,
    /// Advertise XATTR capability.
    pub xattr_enabled: bool,
    /// Bucket identifier surfaced under `stats uuid`.
    pub uuid: Option<String>,
    /// Log verbosity knob (the host maps it onto its logger).
    pub verbose: u32,

    /// Replication connection buffer size negotiated at session start.
    pub dcp_conn_buffer_size: u32,
    /// Idle timeout before a replication peer is disconnected (seconds).
    pub dcp_idle_timeout: u32,
    /// NOOP transmit interval (seconds).
    pub dcp_noop_tx_interval: u32,
    /// Messages applied per stream buffer batch.
    pub dcp_batch_size: usize,
    /// Batches before the processor yields.
    pub dcp_yield_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            factor: DEFAULT_FACTOR,
            chunk_size: DEFAULT_CHUNK_SIZE,
            item_size_max: DEFAULT_ITEM_SIZE_MAX,
            preallocate: false,
            evict_to_free: true,
            keep_deleted: false,
            ignore_vbucket: false,
            vb0: true,
            xattr_enabled: true,
            uuid: None,
            verbose: 0,
            dcp_conn_buffer_size: DEFAULT_DCP_CONN_BUFFER_SIZE,
            dcp_idle_timeout: DEFAULT_DCP_IDLE_TIMEOUT,
            dcp_noop_tx_interval: DEFAULT_DCP_NOOP_TX_INTERVAL,
            dcp_batch_size: DEFAULT_DCP_BATCH_SIZE,
            dcp_yield_limit: DEFAULT_DCP_YIELD_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Parse a `key=value;key=value` configuration string.
    ///
    /// Empty fragments are skipped, so trailing semicolons are fine.
    pub fn parse(cfg: &str) -> std::result::Result<Self, ConfigError> {
        let mut config = Self::default();
        for fragment in cfg.split(';') {
            let fragment = fragment.trim();
            if fragment.is_empty() {
                continue;
            }
            let (key, value) = fragment
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(fragment.to_string()))?;
            let key = key.trim();
            let value = value.trim();
            config.apply(key, value)?;
        }
        config.clamp();
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> std::result::Result<(), ConfigError> {
        match key {
            "cache_size" => self.cache_size = parse_size(key, value)?,
            "factor" => self.factor = parse_float(key, value)?,
            "chunk_size" => self.chunk_size = parse_size(key, value)?,
            "item_size_max" => self.item_size_max = parse_size(key, value)?,
            "preallocate" => self.preallocate = parse_bool(key, value)?,
            "eviction" => self.evict_to_free = parse_bool(key, value)?,
            "keep_deleted" => self.keep_deleted = parse_bool(key, value)?,
            "ignore_vbucket" => self.ignore_vbucket = parse_bool(key, value)?,
            "vb0" => self.vb0 = parse_bool(key, value)?,
            "xattr_enabled" => self.xattr_enabled = parse_bool(key, value)?,
            "uuid" => self.uuid = Some(value.to_string()),
            "verbose" => self.verbose = parse_u32(key, value)?,
            "dcp_conn_buffer_size" => self.dcp_conn_buffer_size = parse_u32(key, value)?,
            "dcp_idle_timeout" => self.dcp_idle_timeout = parse_u32(key, value)?,
            "dcp_noop_tx_interval" => self.dcp_noop_tx_interval = parse_u32(key, value)?,
            "dcp_consumer_process_buffered_messages_batch_size" => {
                self.dcp_batch_size = parse_size(key, value)?
            }
            "dcp_consumer_process_buffered_messages_yield_limit" => {
                self.dcp_yield_limit = parse_size(key, value)?
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Pull out-of-range numeric knobs back into their supported ranges.
    fn clamp(&mut self) {
        if self.factor < 1.05 {
            log::warn!("[EngineConfig] factor {} below 1.05, clamping", self.factor);
            self.factor = 1.05;
        } else if self.factor > 2.0 {
            log::warn!("[EngineConfig] factor {} above 2.0, clamping", self.factor);
            self.factor = 2.0;
        }
        if self.chunk_size < 48 {
            log::warn!(
                "[EngineConfig] chunk_size {} below minimum, raising to 48",
                self.chunk_size
            );
            self.chunk_size = 48;
        }
        if self.dcp_batch_size == 0 {
            self.dcp_batch_size = 1;
        }
        if self.dcp_yield_limit == 0 {
            self.dcp_yield_limit = 1;
        }
    }
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, ConfigError> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_size(key: &str, value: &str) -> std::result::Result<usize, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> std::result::Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_float(key: &str, value: &str) -> std::result::Result<f64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_size, 64 * 1024 * 1024);
        assert_eq!(config.chunk_size, 48);
        assert!((config.factor - 1.25).abs() < f64::EPSILON);
        assert_eq!(config.item_size_max, 1024 * 1024);
        assert!(config.evict_to_free);
        assert!(config.vb0);
        assert!(!config.keep_deleted);
    }

    #[test]
    fn test_parse_full_string() {
        let config = EngineConfig::parse(
            "cache_size=1048576;chunk_size=64;factor=2.0;eviction=false;uuid=bucket-1;vb0=off",
        )
        .expect("config should parse");
        assert_eq!(config.cache_size, 1_048_576);
        assert_eq!(config.chunk_size, 64);
        assert!((config.factor - 2.0).abs() < f64::EPSILON);
        assert!(!config.evict_to_free);
        assert_eq!(config.uuid.as_deref(), Some("bucket-1"));
        assert!(!config.vb0);
    }

    #[test]
    fn test_parse_bool_spellings() {
        for (spelling, expected) in [
            ("true", true),
            ("on", true),
            ("1", true),
            ("false", false),
            ("off", false),
            ("0", false),
        ] {
            let config = EngineConfig::parse(&format!("preallocate={}", spelling))
                .expect("bool spelling should parse");
            assert_eq!(config.preallocate, expected, "spelling {}", spelling);
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = EngineConfig::parse("no_such_option=1").unwrap_err();
        assert_eq!(err, ConfigError::UnknownKey("no_such_option".to_string()));
    }

    #[test]
    fn test_malformed_fragment_rejected() {
        let err = EngineConfig::parse("cache_size").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn test_factor_clamped() {
        let config = EngineConfig::parse("factor=9.0").expect("parse");
        assert!((config.factor - 2.0).abs() < f64::EPSILON);
        let config = EngineConfig::parse("factor=1.0").expect("parse");
        assert!((config.factor - 1.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_chunk_size_floor() {
        let config = EngineConfig::parse("chunk_size=8").expect("parse");
        assert_eq!(config.chunk_size, 48);
    }

    #[test]
    fn test_trailing_semicolon_ok() {
        let config = EngineConfig::parse("verbose=2;").expect("parse");
        assert_eq!(config.verbose, 2);
    }
}

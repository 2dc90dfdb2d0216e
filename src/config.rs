use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::limits::{DEFAULT_HOLD_TTL_MS, MAX_HOLD_TTL_MS};
use crate::model::Ms;

/// Settings the engine itself reads.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Zone that defines which calendar day "today" is.
    pub timezone: Tz,
    /// TTL used when a hold request doesn't carry one.
    pub default_hold_ttl_ms: Ms,
    /// How long RELEASED/EXPIRED holds survive WAL compaction.
    pub hold_retention_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Australia::Brisbane,
            default_hold_ttl_ms: DEFAULT_HOLD_TTL_MS,
            hold_retention_ms: 7 * 24 * 3_600_000,
        }
    }
}

/// Daemon configuration, read from `DAYHOLD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub engine: EngineConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DAYHOLD_TIMEZONE: unknown time zone {0:?}")]
    UnknownTimezone(String),
    #[error("DAYHOLD_HOLD_TTL_SECS must be between 1 and {max}, got {got}", max = MAX_HOLD_TTL_MS / 1000)]
    HoldTtlOutOfRange { got: u64 },
    #[error("DAYHOLD_SWEEP_INTERVAL_SECS must be at least 1")]
    ZeroSweepInterval,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Malformed numbers fall back to
    /// their default with a warning; an unknown zone is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();

        let timezone = match lookup("DAYHOLD_TIMEZONE") {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| ConfigError::UnknownTimezone(name))?,
            None => defaults.timezone,
        };

        let ttl_secs: u64 = parsed(&lookup, "DAYHOLD_HOLD_TTL_SECS", (DEFAULT_HOLD_TTL_MS / 1000) as u64);
        if ttl_secs == 0 || ttl_secs > (MAX_HOLD_TTL_MS / 1000) as u64 {
            return Err(ConfigError::HoldTtlOutOfRange { got: ttl_secs });
        }

        let sweep_secs: u64 = parsed(&lookup, "DAYHOLD_SWEEP_INTERVAL_SECS", 60);
        if sweep_secs == 0 {
            return Err(ConfigError::ZeroSweepInterval);
        }

        let retention_secs: u64 = parsed(
            &lookup,
            "DAYHOLD_HOLD_RETENTION_SECS",
            (defaults.hold_retention_ms / 1000) as u64,
        );

        Ok(Self {
            bind: lookup("DAYHOLD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "DAYHOLD_PORT", 7878),
            data_dir: PathBuf::from(lookup("DAYHOLD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parsed(&lookup, "DAYHOLD_MAX_CONNECTIONS", 256),
            compact_threshold: parsed(&lookup, "DAYHOLD_COMPACT_THRESHOLD", 1000),
            metrics_port: lookup("DAYHOLD_METRICS_PORT").and_then(|s| s.parse().ok()),
            sweep_interval: Duration::from_secs(sweep_secs),
            engine: EngineConfig {
                timezone,
                default_hold_ttl_ms: ttl_secs as Ms * 1000,
                hold_retention_ms: Ms::try_from(retention_secs)
                    .unwrap_or(Ms::MAX)
                    .saturating_mul(1000),
            },
        })
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("{key}={raw:?} is not valid, using default");
            default
        }),
    }
}

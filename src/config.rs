use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{var}: must be greater than zero")]
    Zero { var: &'static str },
}

/// Server configuration, read from `STAYBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    /// Side store backend; in-memory when unset.
    pub redis_url: Option<String>,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let max_connections: usize = parsed(&get, "STAYBOOK_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError::Zero { var: "STAYBOOK_MAX_CONNECTIONS" });
        }

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            hold_window: secs(&get, "STAYBOOK_HOLD_WINDOW_SECS")?.unwrap_or(defaults.hold_window),
            pre_booking_ttl: secs(&get, "STAYBOOK_PRE_BOOKING_TTL_SECS")?
                .unwrap_or(defaults.pre_booking_ttl),
            cache_ttl: secs(&get, "STAYBOOK_CACHE_TTL_SECS")?.unwrap_or(defaults.cache_ttl),
        };

        Ok(Self {
            port: parsed(&get, "STAYBOOK_PORT")?.unwrap_or(5433),
            bind: get("STAYBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("STAYBOOK_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            password: get("STAYBOOK_PASSWORD").unwrap_or_else(|| "staybook".into()),
            max_connections,
            compact_threshold: parsed(&get, "STAYBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert: get("STAYBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: get("STAYBOOK_TLS_KEY").map(PathBuf::from),
            metrics_port: parsed(&get, "STAYBOOK_METRICS_PORT")?,
            redis_url: get("STAYBOOK_REDIS_URL"),
            engine,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| value.trim().parse().map_err(|_| ConfigError::Invalid { var, value }))
        .transpose()
}

fn secs(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match parsed::<u64>(get, var)? {
        Some(0) => Err(ConfigError::Zero { var }),
        other => Ok(other.map(Duration::from_secs)),
    }
}

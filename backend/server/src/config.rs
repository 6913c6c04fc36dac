use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::error::AppError;

pub struct Config {
    pub port: u16,
    pub backend: Backend,
    pub store: StoreConfig,
    pub writer: WriterConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Redis,
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(Backend::Redis),
            "memory" => Ok(Backend::Memory),
            other => Err(format!("unknown store backend {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub redis_url: String,
    pub hearts_table: String,
    pub change_log: String,
    pub partitions: usize,
}

#[derive(Clone, Debug)]
pub struct WriterConfig {
    /// Items per batch call, the store rejects anything larger.
    pub chunk_limit: usize,
    pub chunk_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://redis:6379".to_string(),
            hearts_table: "hearts".to_string(),
            change_log: "hearts:changes".to_string(),
            partitions: 4,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            chunk_limit: 25,
            chunk_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub discovery_interval: Duration,
    pub empty_poll_backoff: Duration,
    pub fetch_batch: usize,
    pub poller_buffer: usize,
    pub unified_buffer: usize,
    pub subscriber_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(5 * 60),
            empty_poll_backoff: Duration::from_secs(1),
            fetch_batch: 100,
            poller_buffer: 64,
            unified_buffer: 256,
            subscriber_buffer: 64,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1111,
            backend: Backend::Memory,
            store: StoreConfig::default(),
            writer: WriterConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        let redis_url: String = try_load("REDIS_URL", "redis://redis:6379")?;
        let redis_url = match read_secret("REDIS_PASSWORD") {
            Some(password) => with_password(&redis_url, &password),
            None => redis_url,
        };

        Ok(Self {
            port: try_load("RUST_PORT", "1111")?,
            backend: try_load("STORE_BACKEND", "redis")?,
            store: StoreConfig {
                redis_url,
                hearts_table: try_load("HEARTS_TABLE", "hearts")?,
                change_log: try_load("CHANGE_LOG", "hearts:changes")?,
                partitions: try_load("CHANGE_LOG_PARTITIONS", "4")?,
            },
            writer: WriterConfig {
                chunk_limit: try_load("CHUNK_LIMIT", "25")?,
                chunk_backoff: Duration::from_millis(try_load("CHUNK_BACKOFF_MS", "1000")?),
            },
            pipeline: PipelineConfig {
                discovery_interval: Duration::from_secs(try_load(
                    "DISCOVERY_INTERVAL_SECS",
                    "300",
                )?),
                empty_poll_backoff: Duration::from_millis(try_load(
                    "EMPTY_POLL_BACKOFF_MS",
                    "1000",
                )?),
                fetch_batch: try_load("FETCH_BATCH", "100")?,
                poller_buffer: try_load("POLLER_BUFFER", "64")?,
                unified_buffer: try_load("UNIFIED_BUFFER", "256")?,
                subscriber_buffer: try_load("SUBSCRIBER_BUFFER", "64")?,
            },
        })
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, AppError>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
            AppError::Config(format!("invalid {key}: {e}"))
        })
}

fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            info!("No {secret_name} secret, skipping: {e}");
        })
        .ok()
}

fn with_password(url: &str, password: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) if !rest.contains('@') => format!("{scheme}://:{password}@{rest}"),
        _ => url.to_string(),
    }
}

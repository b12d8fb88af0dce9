//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `RUNWAY_HTTP_ADDR`: HTTP server bind address (default: 0.0.0.0:24200)
//! - `RUNWAY_INVENTORY_PATH`: Path to the JSON inventory file (default: inventory.json)
//! - `RUNWAY_CONCURRENT_LIMIT`: Max concurrently running executions (default: num_cpus * 2)
//! - `RUNWAY_MAX_QUEUE_SIZE`: Max queued+running executions before admission rejects (default: 100)
//! - `RUNWAY_MAX_HISTORY`: Max terminal execution records retained for status lookups (default: 1000)
//! - `RUNWAY_BUFFER_MS`: Output debounce flush window in milliseconds (default: 100)
//! - `RUNWAY_MAX_OUTPUT_SIZE`: Cumulative output byte cap per execution (default: 1 MiB)
//! - `RUNWAY_MAX_LINE_LENGTH`: Per-chunk length cap before truncation (default: 8192)
//! - `RUNWAY_HEARTBEAT_INTERVAL_MS`: Liveness frame interval (default: 30000)
//! - `RUNWAY_CLOSE_GRACE_MS`: Delay between terminal frame and channel closure (default: 1000)

use std::{
    env,
    net::SocketAddr,
    str::FromStr,
    sync::{OnceLock, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};

/// Default address for the HTTP server
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:24200";

/// Global configuration cache
static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address
    pub http_addr: SocketAddr,

    /// Path to the JSON inventory file mapping group ids to node ids
    pub inventory_path: String,

    /// Admission limits for the execution queue
    pub queue: QueueConfig,

    /// Output bounding and delivery tuning for the streaming hub
    pub stream: StreamConfig,
}

/// Execution queue admission limits
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum concurrently running executions
    pub concurrent_limit: usize,

    /// Maximum queued+running executions before submissions are rejected
    pub max_queue_size: usize,

    /// Maximum terminal execution records kept for status lookups; the
    /// oldest are evicted first once the bound is exceeded
    pub max_history: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: num_cpus::get().max(1) * 2,
            max_queue_size: 100,
            max_history: 1000,
        }
    }
}

/// Streaming hub tuning
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Debounce window before buffered output is flushed to subscribers
    pub buffer_ms: u64,

    /// Cumulative output byte cap per execution; further output is dropped
    pub max_output_size: usize,

    /// Per-chunk length cap; longer chunks are truncated with an annotation
    pub max_line_length: usize,

    /// Interval between liveness frames pushed to every subscriber
    pub heartbeat_interval_ms: u64,

    /// Delay between the terminal frame and subscriber channel closure
    pub close_grace_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_ms: 100,
            max_output_size: 1024 * 1024,
            max_line_length: 8192,
            heartbeat_interval_ms: 30_000,
            close_grace_ms: 1000,
        }
    }
}

impl StreamConfig {
    pub fn buffer_window(&self) -> Duration {
        Duration::from_millis(self.buffer_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let http_addr =
            env::var("RUNWAY_HTTP_ADDR").unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
        let http_addr =
            SocketAddr::from_str(&http_addr).context("invalid RUNWAY_HTTP_ADDR format")?;

        let inventory_path =
            env::var("RUNWAY_INVENTORY_PATH").unwrap_or_else(|_| "inventory.json".to_string());

        let defaults = QueueConfig::default();
        let queue = QueueConfig {
            concurrent_limit: env_parsed("RUNWAY_CONCURRENT_LIMIT")
                .unwrap_or(defaults.concurrent_limit),
            max_queue_size: env_parsed("RUNWAY_MAX_QUEUE_SIZE").unwrap_or(defaults.max_queue_size),
            max_history: env_parsed("RUNWAY_MAX_HISTORY").unwrap_or(defaults.max_history),
        };

        let defaults = StreamConfig::default();
        let stream = StreamConfig {
            buffer_ms: env_parsed("RUNWAY_BUFFER_MS").unwrap_or(defaults.buffer_ms),
            max_output_size: env_parsed("RUNWAY_MAX_OUTPUT_SIZE")
                .unwrap_or(defaults.max_output_size),
            max_line_length: env_parsed("RUNWAY_MAX_LINE_LENGTH")
                .unwrap_or(defaults.max_line_length),
            heartbeat_interval_ms: env_parsed("RUNWAY_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(defaults.heartbeat_interval_ms),
            close_grace_ms: env_parsed("RUNWAY_CLOSE_GRACE_MS").unwrap_or(defaults.close_grace_ms),
        };

        Ok(Self {
            http_addr,
            inventory_path,
            queue,
            stream,
        })
    }

    /// Create a test configuration with small, fast limits
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            http_addr: "127.0.0.1:0".parse().unwrap(),
            inventory_path: "inventory.json".to_string(),
            queue: QueueConfig {
                concurrent_limit: 2,
                max_queue_size: 5,
                max_history: 100,
            },
            stream: StreamConfig {
                buffer_ms: 10,
                max_output_size: 4096,
                max_line_length: 100,
                heartbeat_interval_ms: 1000,
                close_grace_ms: 50,
            },
        }
    }
}

/// Get the global configuration, loading from the environment on the
/// first call and serving the cached instance afterwards.
pub fn try_get_config() -> Result<Config> {
    match CONFIG.get() {
        Some(lock) => Ok(lock.read().expect("config lock poisoned").clone()),
        None => {
            let config = Config::from_env()?;
            let lock = CONFIG.get_or_init(|| RwLock::new(config.clone()));
            Ok(lock.read().expect("config lock poisoned").clone())
        }
    }
}

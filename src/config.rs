use clap::ValueEnum;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache: CacheBackend,
    pub redis_url: String,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache = env::var("DRIFTBOARD_CACHE")
            .ok()
            .and_then(|value| match value.to_ascii_lowercase().as_str() {
                "memory" => Some(CacheBackend::Memory),
                "redis" => Some(CacheBackend::Redis),
                _ => None,
            })
            .unwrap_or(defaults.cache);

        Self {
            port: env::var("DRIFTBOARD_PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.port),
            cache,
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            ping_interval: env::var("DRIFTBOARD_PING_INTERVAL")
                .ok()
                .and_then(|value| value.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.ping_interval),
            liveness_timeout: env::var("DRIFTBOARD_LIVENESS_TIMEOUT")
                .ok()
                .and_then(|value| value.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.liveness_timeout),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 18128,
            cache: CacheBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            ping_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE").unwrap_or_else(|_| "inmemory".to_string()).to_lowercase().as_str() {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Process-wide configuration, validated once at startup. Loading itself
/// (a real secrets/validation pipeline) is out of scope for the core; only
/// the shape — required vars fail fast, optional vars fall back to the
/// documented default — is carried, matching `subscriptions-rs::config::Config`.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub nats_url: Option<String>,

    /// Size of the orchestrator's counting semaphore (§4.4 default 10).
    pub max_concurrent_executions: u32,
    /// Default redelivery budget before a message is dead-lettered (§4.2 default 5).
    pub max_redeliveries: u32,
    /// Visibility timeout in milliseconds for durable queue polling (§4.2 default 2s).
    pub visibility_timeout_ms: u64,

    /// Token-bucket rate limiter for webhook ingress (§4.3 defaults 100 req/s, burst 200).
    pub webhook_rate_per_sec: u32,
    pub webhook_burst: u32,
    /// Replay protection window in seconds (§4.3 default 5 minutes).
    pub webhook_replay_window_secs: i64,

    /// Outbound HTTP timeout for provider calls (§5 default 30s).
    pub provider_http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();
        let nats_url = match bus_type {
            BusType::Nats => Some(env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())),
            BusType::InMemory => None,
        };

        Ok(Self {
            bus_type,
            nats_url,
            max_concurrent_executions: env_u32("MAX_CONCURRENT_EXECUTIONS", 10),
            max_redeliveries: env_u32("MAX_REDELIVERIES", 5),
            visibility_timeout_ms: env_u64("VISIBILITY_TIMEOUT_MS", 2_000),
            webhook_rate_per_sec: env_u32("WEBHOOK_RATE_PER_SEC", 100),
            webhook_burst: env_u32("WEBHOOK_BURST", 200),
            webhook_replay_window_secs: env_u64("WEBHOOK_REPLAY_WINDOW_SECS", 300) as i64,
            provider_http_timeout: Duration::from_secs(env_u64("PROVIDER_HTTP_TIMEOUT_SECS", 30)),
        })
    }
}

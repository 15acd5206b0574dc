use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Database settings; when unset the broker runs on the in-memory store.
    pub database_url: Option<String>,

    // CORS settings
    pub cors_allowed_origins: Vec<String>,

    /// Maximum age (seconds) of a callback timestamp before it is rejected
    /// as stale.
    pub callback_skew_secs: i64,

    /// Lifetime of a ready session before the reaper expires it.
    pub session_ttl_secs: i64,

    /// How often the reaper sweeps for expired and stuck sessions.
    pub reaper_interval_secs: u64,

    /// How long a session may sit in pending/provisioning before the reaper
    /// fails it.
    pub provisioning_deadline_secs: i64,

    // Outbound worker HTTP client settings
    pub worker_request_timeout_secs: u64,
    pub worker_connect_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Ok(Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),

            database_url: env::var("DATABASE_URL").ok(),

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),

            callback_skew_secs: parse_env("CALLBACK_SKEW_SECS", 60),
            session_ttl_secs: parse_env("SESSION_TTL_SECS", 24 * 60 * 60),
            reaper_interval_secs: parse_env("REAPER_INTERVAL_SECS", 30),
            provisioning_deadline_secs: parse_env("PROVISIONING_DEADLINE_SECS", 15 * 60),

            worker_request_timeout_secs: parse_env("WORKER_REQUEST_TIMEOUT_SECS", 10),
            worker_connect_timeout_secs: parse_env("WORKER_CONNECT_TIMEOUT_SECS", 5),
        })
    }

    pub fn callback_skew(&self) -> Duration {
        Duration::seconds(self.callback_skew_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_secs)
    }

    pub fn reaper_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.reaper_interval_secs)
    }

    pub fn provisioning_deadline(&self) -> Duration {
        Duration::seconds(self.provisioning_deadline_secs)
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

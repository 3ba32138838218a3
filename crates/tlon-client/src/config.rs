//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a client can start against a local
//! development ship with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use tlon_api::{Backoff, GatewayConfig};
use tlon_shared::constants::{DEFAULT_POKE_TIMEOUT_MS, DEFAULT_POST_WINDOW};
use tlon_shared::Ship;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the ship's HTTP interface.
    /// Env: `TLON_SHIP_URL`
    /// Default: `http://localhost:8080`
    pub ship_url: String,

    /// The ship we are logged in as.
    /// Env: `TLON_SHIP`
    /// Default: `~zod`
    pub ship: Ship,

    /// `+code` used to obtain a session cookie.
    /// Env: `TLON_ACCESS_CODE`
    pub access_code: Option<String>,

    /// Database file. `None` uses the platform data directory.
    /// Env: `TLON_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// How long a poke may wait for its ack before it counts as a nack.
    /// Env: `TLON_POKE_TIMEOUT_MS`
    pub poke_timeout: Duration,

    /// Reconnect and sync-retry schedule.
    /// Env: `TLON_BACKOFF_BASE_MS`, `TLON_BACKOFF_MAX_MS`
    pub backoff: Backoff,

    /// Backfill attempts before a scope reports `SyncFailed`.
    /// Env: `TLON_SYNC_RETRIES`
    pub max_sync_retries: u32,

    /// Posts fetched per channel backfill.
    /// Env: `TLON_POST_WINDOW`
    pub post_window: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ship_url: "http://localhost:8080".to_string(),
            ship: default_ship(),
            access_code: None,
            db_path: None,
            poke_timeout: Duration::from_millis(DEFAULT_POKE_TIMEOUT_MS),
            backoff: Backoff::default(),
            max_sync_retries: 5,
            post_window: DEFAULT_POST_WINDOW,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an explicit variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = var("TLON_SHIP_URL") {
            config.ship_url = url.trim_end_matches('/').to_string();
        }

        if let Some(ship) = var("TLON_SHIP") {
            match ship.parse::<Ship>() {
                Ok(parsed) => config.ship = parsed,
                Err(e) => tracing::warn!(value = %ship, error = %e, "Invalid TLON_SHIP, using default"),
            }
        }

        if let Some(code) = var("TLON_ACCESS_CODE") {
            if !code.is_empty() {
                config.access_code = Some(code);
            }
        }

        if let Some(path) = var("TLON_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Some(ms) = parse_var::<u64>(&var, "TLON_POKE_TIMEOUT_MS") {
            config.poke_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&var, "TLON_BACKOFF_BASE_MS") {
            config.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&var, "TLON_BACKOFF_MAX_MS") {
            config.backoff.max = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&var, "TLON_SYNC_RETRIES") {
            config.max_sync_retries = n.max(1);
            config.backoff.max_attempts = config.max_sync_retries;
        }
        if let Some(n) = parse_var::<usize>(&var, "TLON_POST_WINDOW") {
            if n > 0 {
                config.post_window = n;
            } else {
                tracing::warn!("TLON_POST_WINDOW must be positive, using default");
            }
        }

        config
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            poke_timeout: self.poke_timeout,
            reconnect: self.backoff.clone(),
        }
    }

    /// Retry schedule for backfills: the reconnect curve capped at
    /// `max_sync_retries` attempts.
    pub fn sync_backoff(&self) -> Backoff {
        Backoff {
            max_attempts: self.max_sync_retries.max(1),
            ..self.backoff.clone()
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

fn default_ship() -> Ship {
    Ship::zod()
}

//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use tlon_api::{Backoff, MemoryShip};
use tlon_store::LocalStore;

use crate::config::ClientConfig;
use crate::state::ClientState;

pub fn fast_config() -> ClientConfig {
    ClientConfig {
        poke_timeout: Duration::from_millis(100),
        backoff: Backoff {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2.0,
            max_attempts: 8,
        },
        max_sync_retries: 8,
        ..ClientConfig::default()
    }
}

pub struct Harness {
    pub ship: Arc<MemoryShip>,
    pub state: ClientState,
}

impl Harness {
    pub fn new(config: ClientConfig) -> Self {
        let ship = Arc::new(MemoryShip::new());
        let store = LocalStore::open_in_memory().unwrap();
        let state = ClientState::new(config, store, ship.clone());
        Self { ship, state }
    }
}

/// Poll `pred` until it holds, failing the test after two seconds.
pub async fn wait_until(mut pred: impl FnMut() -> bool) {
    for _ in 0..400 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

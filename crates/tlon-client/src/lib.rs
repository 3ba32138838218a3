//! Local-first sync core of a Tlon client.
//!
//! The UI reads from a local store through live queries and writes through
//! commands. The sync engine keeps the store in step with the ship; the
//! mutation coordinator applies the user's changes optimistically and rolls
//! them back when the ship refuses them.

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod mutation;
pub mod queries;
pub mod state;
pub mod sync;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing::info;

use tlon_api::{EyreConfig, EyreTransport, ShipTransport};
use tlon_store::{Database, LocalStore};

pub use crate::config::ClientConfig;
pub use crate::error::{ClientError, Result};
pub use crate::events::{ClientEvent, EventBus};
pub use crate::queries::Queries;
pub use crate::state::ClientState;
pub use crate::sync::{Scope, ScopeState};

/// A logged-in client: the state every command takes, plus lifecycle.
#[derive(Clone)]
pub struct Client {
    state: ClientState,
}

impl Client {
    /// Open the local store and log in to the ship over HTTP.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let store = match &config.db_path {
            Some(path) => LocalStore::open_at(path)?,
            None => LocalStore::new(Database::new()?),
        };
        let transport = EyreTransport::connect(EyreConfig {
            url: config.ship_url.clone(),
            ship: config.ship.clone(),
            access_code: config.access_code.clone(),
        })
        .await?;
        info!(ship = %config.ship, url = %config.ship_url, "connected");
        Ok(Self::from_parts(config, store, Arc::new(transport)))
    }

    /// Assemble a client from an already opened store and transport.
    pub fn from_parts(config: ClientConfig, store: LocalStore, transport: Arc<dyn ShipTransport>) -> Self {
        Self {
            state: ClientState::new(config, store, transport),
        }
    }

    /// Start the always-on scopes: the group list and unreads.
    pub fn start(&self) {
        self.state.sync.start();
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn queries(&self) -> Queries {
        Queries::new(self.state.reader(), self.state.sync.clone(), self.state.config.post_window)
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<ClientEvent> {
        self.state.events.subscribe()
    }

    /// Stop syncing and wipe everything stored locally.
    pub fn logout(&self) -> Result<()> {
        self.state.sync.shutdown();
        self.state.pending.lock().clear();
        self.state.store.reset()?;
        info!(ship = %self.state.own(), "logged out");
        Ok(())
    }
}

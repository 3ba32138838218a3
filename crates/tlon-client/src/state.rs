//! Client state shared by every command.
//!
//! [`ClientState`] bundles the store, the gateway and the two components
//! allowed to write: the sync engine and the mutation coordinator. It is
//! cheap to clone; every field is a shared handle.

use std::sync::Arc;

use tlon_api::{ApiGateway, ShipTransport};
use tlon_shared::Ship;
use tlon_store::{LocalStore, StoreReader};

use crate::config::ClientConfig;
use crate::events::EventBus;
use crate::mutation::{MutationCoordinator, SharedPending};
use crate::sync::SyncEngine;

#[derive(Clone)]
pub struct ClientState {
    /// Settings the client was started with.
    pub config: Arc<ClientConfig>,

    /// Writable store. Only the sync engine and the coordinator write.
    pub store: LocalStore,

    /// Pokes and scries for commands that do not go through the coordinator.
    pub gateway: ApiGateway,

    /// Optimistic writes waiting for the ship.
    pub pending: SharedPending,

    /// Lifecycle and failure notifications for the UI.
    pub events: EventBus,

    pub sync: SyncEngine,

    pub coordinator: MutationCoordinator,
}

impl ClientState {
    pub fn new(config: ClientConfig, store: LocalStore, transport: Arc<dyn ShipTransport>) -> Self {
        let gateway = ApiGateway::new(transport, config.gateway());
        let pending = SharedPending::default();
        let events = EventBus::new();
        let sync = SyncEngine::new(
            store.clone(),
            gateway.clone(),
            pending.clone(),
            events.clone(),
            &config,
        );
        let coordinator = MutationCoordinator::new(
            store.clone(),
            gateway.clone(),
            pending.clone(),
            events.clone(),
            config.ship.clone(),
        );
        Self {
            config: Arc::new(config),
            store,
            gateway,
            pending,
            events,
            sync,
            coordinator,
        }
    }

    /// The ship we are logged in as.
    pub fn own(&self) -> &Ship {
        &self.config.ship
    }

    pub fn reader(&self) -> StoreReader {
        self.store.reader()
    }
}

//! Client-level notifications for the UI layer.
//!
//! Data changes reach the UI through live queries; these events carry what
//! queries cannot: sync lifecycle and failures nobody awaited.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::sync::{Scope, ScopeState};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// A sync scope changed state.
    ScopeState { scope: Scope, state: ScopeState },
    /// A scope gave up backfilling after exhausting its retries.
    SyncFailed { scope: Scope, error: String },
    /// An optimistic change was rolled back.
    MutationRolledBack { label: String, error: String },
}

/// Fan-out of [`ClientEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ClientEvent) {
        tracing::trace!(?event, "client event");
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}

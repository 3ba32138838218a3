//! Optimistic local writes and their settlement.

mod coordinator;
mod pending;

use std::sync::Arc;

use tlon_shared::protocol::Poke;
use tlon_store::{EntityKey, FieldRef, WriteTxn};

pub use coordinator::MutationCoordinator;
pub use pending::{MutationStatus, Patch, PendingMutation, PendingRegistry, SharedPending};

/// One user-initiated change: what it touches, how it looks locally and
/// what to tell the ship.
pub struct Mutation {
    pub(crate) label: String,
    pub(crate) targets: Vec<EntityKey>,
    pub(crate) fields: Vec<FieldRef>,
    pub(crate) patch: Patch,
    pub(crate) on_ack: Option<Patch>,
    pub(crate) poke: Poke,
}

impl Mutation {
    pub fn new(label: impl Into<String>, poke: Poke) -> Self {
        Self {
            label: label.into(),
            targets: Vec::new(),
            fields: Vec::new(),
            patch: Arc::new(|_| Ok(())),
            on_ack: None,
            poke,
        }
    }

    /// Snapshot `key` so a rollback can restore it.
    pub fn target(mut self, key: EntityKey) -> Self {
        if !self.targets.contains(&key) {
            self.targets.push(key);
        }
        self
    }

    /// Claim a clocked field of `key`; remote diffs to it wait until this
    /// mutation settles.
    pub fn field(mut self, key: EntityKey, field: impl Into<String>) -> Self {
        let field = FieldRef::new(key.clone(), field);
        if !self.fields.contains(&field) {
            self.fields.push(field);
        }
        self.target(key)
    }

    /// The optimistic change. May run more than once: after an earlier
    /// mutation on the same entities rolls back, it is re-applied on top of
    /// the restored state.
    pub fn patch<F>(mut self, patch: F) -> Self
    where
        F: Fn(&mut WriteTxn<'_>) -> tlon_store::Result<()> + Send + Sync + 'static,
    {
        self.patch = Arc::new(patch);
        self
    }

    pub fn on_ack<F>(mut self, on_ack: F) -> Self
    where
        F: Fn(&mut WriteTxn<'_>) -> tlon_store::Result<()> + Send + Sync + 'static,
    {
        self.on_ack = Some(Arc::new(on_ack));
        self
    }
}

//! In-flight optimistic writes.
//!
//! The registry is shared by the coordinator (which records and settles
//! mutations) and the sync applier (which parks remote diffs that touch a
//! field a mutation still owns). Both only lock it while already holding
//! the store lock, so the two locks are always taken in that order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use uuid::Uuid;

use tlon_store::{EntityKey, FieldClock, FieldRef, Snapshot, WriteTxn};

use crate::sync::SyncDiff;

/// An optimistic change to the store. Re-runnable: a rollback of an earlier
/// mutation re-applies later ones on top of the restored state.
pub type Patch = Arc<dyn Fn(&mut WriteTxn<'_>) -> tlon_store::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Rejected,
}

pub struct PendingMutation {
    pub local_id: Uuid,
    pub label: String,
    pub targets: Vec<EntityKey>,
    pub fields: Vec<FieldRef>,
    /// Pre-images of `targets`.
    pub snapshot: Snapshot,
    /// Clocks of `fields` before this mutation stamped them.
    pub prior_clocks: BTreeMap<FieldRef, Option<FieldClock>>,
    pub status: MutationStatus,
    pub(crate) patch: Patch,
    /// Runs in the confirming transaction once the ship acked.
    pub(crate) on_ack: Option<Patch>,
    /// Remote diffs held back because they touch one of our fields.
    pub(crate) deferred: Vec<SyncDiff>,
}

impl PendingMutation {
    pub fn touches(&self, key: &EntityKey) -> bool {
        self.targets.contains(key)
    }
}

#[derive(Default)]
pub struct PendingRegistry {
    /// Issue order.
    order: Vec<Uuid>,
    entries: HashMap<Uuid, PendingMutation>,
}

impl PendingRegistry {
    pub fn insert(&mut self, mutation: PendingMutation) {
        self.order.push(mutation.local_id);
        self.entries.insert(mutation.local_id, mutation);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&PendingMutation> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut PendingMutation> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: Uuid) -> Option<PendingMutation> {
        self.order.retain(|o| *o != id);
        self.entries.remove(&id)
    }

    /// Park `diff` on mutation `id`. Returns false if `id` is not pending.
    pub fn defer(&mut self, id: Uuid, diff: SyncDiff) -> bool {
        match self.entries.get_mut(&id) {
            Some(m) => {
                if !m.deferred.contains(&diff) {
                    m.deferred.push(diff);
                }
                true
            }
            None => false,
        }
    }

    /// Pending mutations issued after `id`, oldest first.
    pub fn issued_after(&self, id: Uuid) -> Vec<Uuid> {
        match self.order.iter().position(|o| *o == id) {
            Some(pos) => self.order[pos + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every pending mutation. Their pokes may still settle; the
    /// coordinator then finds nothing to confirm or roll back.
    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    pub fn labels(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|m| m.label.clone())
            .collect()
    }
}

/// Registry handle shared across the client.
#[derive(Clone, Default)]
pub struct SharedPending(Arc<Mutex<PendingRegistry>>);

impl SharedPending {
    pub fn lock(&self) -> MutexGuard<'_, PendingRegistry> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlon_shared::{GroupId, GroupMeta, LogicalTime};

    fn pending(label: &str) -> PendingMutation {
        PendingMutation {
            local_id: Uuid::new_v4(),
            label: label.to_string(),
            targets: Vec::new(),
            fields: Vec::new(),
            snapshot: Snapshot::default(),
            prior_clocks: BTreeMap::new(),
            status: MutationStatus::Pending,
            patch: Arc::new(|_| Ok(())),
            on_ack: None,
            deferred: Vec::new(),
        }
    }

    #[test]
    fn keeps_issue_order() {
        let mut registry = PendingRegistry::default();
        let a = pending("a");
        let b = pending("b");
        let c = pending("c");
        let (ida, idb, idc) = (a.local_id, b.local_id, c.local_id);
        registry.insert(a);
        registry.insert(b);
        registry.insert(c);

        assert_eq!(registry.issued_after(ida), vec![idb, idc]);
        registry.remove(idb);
        assert_eq!(registry.issued_after(ida), vec![idc]);
        assert_eq!(registry.labels(), vec!["a", "c"]);
    }

    #[test]
    fn defers_once_per_diff() {
        let mut registry = PendingRegistry::default();
        let m = pending("edit");
        let id = m.local_id;
        registry.insert(m);

        let diff = SyncDiff::GroupMeta {
            id: "~zod/test".parse::<GroupId>().unwrap(),
            time: LogicalTime(1),
            meta: GroupMeta::titled("Old"),
        };
        assert!(registry.defer(id, diff.clone()));
        assert!(registry.defer(id, diff));
        assert_eq!(registry.get(id).unwrap().deferred.len(), 1);
        assert!(!registry.defer(Uuid::new_v4(), SyncDiff::GroupRemoved {
            id: "~zod/test".parse().unwrap(),
            time: LogicalTime(2),
        }));
    }
}

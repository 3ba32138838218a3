//! The mutation coordinator: apply locally, poke, then confirm or roll back.
//!
//! All registry access happens inside a store write, so a remote diff can
//! never observe a mutation half recorded or half undone.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info};
use uuid::Uuid;

use tlon_api::ApiGateway;
use tlon_shared::{LogicalTime, Ship};
use tlon_store::{EntityKey, FieldClock, LocalStore, Snapshot, WriteTxn};

use super::pending::{MutationStatus, PendingMutation, PendingRegistry, SharedPending};
use super::Mutation;
use crate::error::Result;
use crate::events::{ClientEvent, EventBus};
use crate::sync::{Applier, ApplyMode};

#[derive(Clone)]
pub struct MutationCoordinator {
    store: LocalStore,
    gateway: ApiGateway,
    pending: SharedPending,
    events: EventBus,
    own: Ship,
}

impl MutationCoordinator {
    pub fn new(store: LocalStore, gateway: ApiGateway, pending: SharedPending, events: EventBus, own: Ship) -> Self {
        Self {
            store,
            gateway,
            pending,
            events,
            own,
        }
    }

    /// Apply `mutation` optimistically and settle it with the ship.
    ///
    /// Returns once the ship acked, or with the error after the local change
    /// was rolled back.
    pub async fn mutate(&self, mutation: Mutation) -> Result<()> {
        let label = mutation.label.clone();
        let poke = mutation.poke.clone();
        let id = self.begin(mutation)?;
        debug!(mutation = %id, %label, "optimistic write applied");

        match self.gateway.request(&poke).await {
            Ok(_) => {
                self.confirm(id)?;
                debug!(mutation = %id, %label, "confirmed");
                Ok(())
            }
            Err(e) => {
                error!(mutation = %id, %label, error = %e, "mutation failed, rolling back");
                self.rollback(id)?;
                self.events.emit(ClientEvent::MutationRolledBack {
                    label,
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Labels of mutations still waiting for the ship.
    pub fn in_flight(&self) -> Vec<String> {
        self.pending.lock().labels()
    }

    fn begin(&self, mutation: Mutation) -> Result<Uuid> {
        let local_id = Uuid::new_v4();
        let Mutation {
            label,
            targets,
            fields,
            patch,
            on_ack,
            ..
        } = mutation;

        self.store.write(|txn| {
            let mut pending = self.pending.lock();
            let snapshot = capture(txn, &targets)?;

            let mut prior_clocks = BTreeMap::new();
            for field in &fields {
                prior_clocks.insert(field.clone(), txn.db().clock(&field.key, &field.field)?);
            }

            patch(txn)?;

            for field in &fields {
                let prior = prior_clocks.get(field).cloned().flatten();
                let clock = FieldClock {
                    time: LogicalTime::after(prior.map(|c| c.time)),
                    pending: Some(local_id),
                };
                txn.db().set_clock(&field.key, &field.field, &clock)?;
            }

            pending.insert(PendingMutation {
                local_id,
                label,
                targets,
                fields,
                snapshot,
                prior_clocks,
                status: MutationStatus::Pending,
                patch,
                on_ack,
                deferred: Vec::new(),
            });
            Ok(())
        })?;
        Ok(local_id)
    }

    fn confirm(&self, id: Uuid) -> Result<()> {
        self.store.write(|txn| {
            let mut pending = self.pending.lock();
            let Some(mut mutation) = pending.remove(id) else {
                return Ok(());
            };
            txn.db().confirm_clocks(id)?;
            if let Some(on_ack) = &mutation.on_ack {
                on_ack(txn)?;
            }
            mutation.status = MutationStatus::Confirmed;
            if !mutation.deferred.is_empty() {
                debug!(mutation = %id, dropped = mutation.deferred.len(), "superseded remote diffs dropped");
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Undo mutation `id`. Later mutations on the same entities are
    /// re-applied on top of the restored state, then held remote diffs are
    /// replayed.
    fn rollback(&self, id: Uuid) -> Result<()> {
        let own = &self.own;
        self.store.write(|txn| {
            let mut pending = self.pending.lock();
            let later = pending.issued_after(id);
            let Some(mut mutation) = pending.remove(id) else {
                return Ok(());
            };

            txn.restore(&mutation.snapshot)?;
            rebase(txn, &mut pending, &mutation.snapshot, &later)?;

            for (field, prior) in &mutation.prior_clocks {
                let current = txn.db().clock(&field.key, &field.field)?;
                match current.and_then(|c| c.pending) {
                    Some(owner) if owner == id => {
                        txn.db().restore_clock(&field.key, &field.field, prior.as_ref())?;
                    }
                    // A later mutation took the field over from us; it
                    // must not fall back to our clock when it settles.
                    Some(owner) => {
                        if let Some(successor) = pending.get_mut(owner) {
                            if let Some(slot) = successor.prior_clocks.get_mut(field) {
                                if slot.as_ref().and_then(|c| c.pending) == Some(id) {
                                    *slot = prior.clone();
                                }
                            }
                        }
                    }
                    None => {}
                }
            }

            mutation.status = MutationStatus::Rejected;
            let deferred = std::mem::take(&mut mutation.deferred);
            if !deferred.is_empty() {
                info!(mutation = %id, count = deferred.len(), "replaying held remote diffs");
            }
            let mut applier = Applier::new(txn, &mut pending, own, ApplyMode::Live);
            for diff in &deferred {
                applier.apply(diff)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

fn capture(txn: &WriteTxn<'_>, keys: &[EntityKey]) -> tlon_store::Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    for key in keys {
        snapshot.entries.insert(key.clone(), txn.get(key)?);
    }
    Ok(snapshot)
}

/// Re-apply the pending mutations in `later` whose entities were rewound,
/// oldest first. Each one is first reset to its own pre-image, with the
/// rewound entities' pre-images taken from the restored state.
fn rebase(
    txn: &mut WriteTxn<'_>,
    pending: &mut PendingRegistry,
    restored: &Snapshot,
    later: &[Uuid],
) -> tlon_store::Result<()> {
    let mut rewound: BTreeSet<EntityKey> = restored.keys().cloned().collect();
    for id in later {
        let Some(mutation) = pending.get_mut(*id) else {
            continue;
        };
        if !mutation.snapshot.keys().any(|k| rewound.contains(k)) {
            continue;
        }
        for (key, pre) in mutation.snapshot.entries.iter_mut() {
            if rewound.contains(key) {
                *pre = txn.get(key)?;
            } else {
                match pre {
                    Some(entity) => txn.upsert(entity)?,
                    None => {
                        txn.remove(key)?;
                    }
                }
            }
        }
        let patch = mutation.patch.clone();
        patch(txn)?;
        debug!(mutation = %id, "re-applied over rolled back state");
        rewound.extend(mutation.snapshot.keys().cloned());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;
    use crate::sync::{fields, SyncDiff};
    use crate::testing::{fast_config, Harness};
    use tlon_api::PokeReply;
    use tlon_shared::protocol::{GroupDiff, GroupUpdate};
    use tlon_shared::{GroupId, GroupMeta};
    use tlon_store::{Entity, Group};

    fn flag() -> GroupId {
        "~zod/test".parse().unwrap()
    }

    fn seed(h: &Harness, title: &str) {
        h.state
            .store
            .upsert([Entity::Group(Group::new(flag(), GroupMeta::titled(title)))])
            .unwrap();
    }

    fn retitle(title: &str) -> Mutation {
        let meta = GroupMeta::titled(title);
        let poke = GroupUpdate::new(flag(), LogicalTime::now(), GroupDiff::Meta(meta.clone())).to_poke();
        Mutation::new("retitle", poke)
            .field(EntityKey::Group(flag()), fields::META)
            .patch(move |txn| {
                let mut group = txn.db().get_group(&flag())?;
                group.meta = meta.clone();
                txn.upsert(&Entity::Group(group))
            })
    }

    fn title(h: &Harness) -> String {
        h.state.store.read(|db| db.get_group(&flag())).unwrap().meta.title
    }

    #[tokio::test]
    async fn ack_confirms_and_clears_pending() {
        let h = Harness::new(fast_config());
        seed(&h, "Old");
        h.state.coordinator.mutate(retitle("New")).await.unwrap();

        assert_eq!(title(&h), "New");
        assert!(h.state.coordinator.in_flight().is_empty());
        let clock = h
            .state
            .store
            .read(|db| db.clock(&EntityKey::Group(flag()), fields::META))
            .unwrap()
            .unwrap();
        assert!(!clock.is_pending());
    }

    #[tokio::test]
    async fn nack_restores_the_snapshot() {
        let h = Harness::new(fast_config());
        seed(&h, "Old");
        h.ship.script_poke("group-action-4", PokeReply::Nack("no".into()));

        let err = h.state.coordinator.mutate(retitle("New")).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(title(&h), "Old");
        assert!(h
            .state
            .store
            .read(|db| db.clock(&EntityKey::Group(flag()), fields::META))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn held_remote_diff_replays_after_rollback() {
        let h = Harness::new(fast_config());
        seed(&h, "Old");
        h.ship.script_poke("group-action-4", PokeReply::Hang);

        let coordinator = h.state.coordinator.clone();
        let task = tokio::spawn(async move { coordinator.mutate(retitle("Mine")).await });
        crate::testing::wait_until(|| title(&h) == "Mine").await;

        // A remote change lands while ours is in flight.
        let remote = SyncDiff::GroupMeta {
            id: flag(),
            time: LogicalTime::now(),
            meta: GroupMeta::titled("Theirs"),
        };
        let own = h.state.config.ship.clone();
        h.state
            .store
            .write(|txn| {
                let mut pending = h.state.pending.lock();
                Applier::new(txn, &mut pending, &own, ApplyMode::Live).apply(&remote)
            })
            .unwrap();
        assert_eq!(title(&h), "Mine");

        // The poke times out; the remote title is what remains.
        assert!(task.await.unwrap().is_err());
        assert_eq!(title(&h), "Theirs");
    }

    #[tokio::test]
    async fn later_mutation_survives_earlier_rollback() {
        let h = Harness::new(fast_config());
        seed(&h, "Old");

        // Both patches land before either poke settles.
        let first = h.state.coordinator.begin(retitle("First")).unwrap();
        let second = h.state.coordinator.begin(retitle("Second")).unwrap();
        assert_eq!(title(&h), "Second");

        h.state.coordinator.rollback(first).unwrap();
        assert_eq!(title(&h), "Second");

        h.state.coordinator.confirm(second).unwrap();
        let clock = h
            .state
            .store
            .read(|db| db.clock(&EntityKey::Group(flag()), fields::META))
            .unwrap()
            .unwrap();
        assert!(!clock.is_pending());
        assert!(h.state.coordinator.in_flight().is_empty());
    }

    #[tokio::test]
    async fn rollback_of_later_mutation_returns_to_earlier_one() {
        let h = Harness::new(fast_config());
        seed(&h, "Old");

        let first = h.state.coordinator.begin(retitle("First")).unwrap();
        let second = h.state.coordinator.begin(retitle("Second")).unwrap();
        h.state.coordinator.rollback(second).unwrap();
        assert_eq!(title(&h), "First");

        let clock = h
            .state
            .store
            .read(|db| db.clock(&EntityKey::Group(flag()), fields::META))
            .unwrap()
            .unwrap();
        assert_eq!(clock.pending, Some(first));
    }
}

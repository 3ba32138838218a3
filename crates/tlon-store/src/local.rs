//! The shared, reactive handle over the [`Database`].
//!
//! [`LocalStore`] serializes every access through one mutex and runs writes
//! inside a SQLite transaction, so a batch is either fully visible or not at
//! all. Each committed write publishes a [`ChangeSet`] on a broadcast
//! channel; live queries re-run when a change set overlaps their filter.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use tlon_shared::{ChannelId, GroupId, PostId, Ship};

use crate::database::Database;
use crate::entity::{ChangeSet, Entity, EntityKey, Filter};
use crate::error::{Result, StoreError};

const CHANGE_BUFFER: usize = 256;

struct Shared {
    db: Mutex<Database>,
    changes: broadcast::Sender<ChangeSet>,
}

/// Writable store handle. Cheap to clone.
#[derive(Clone)]
pub struct LocalStore {
    shared: Arc<Shared>,
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            shared: Arc::new(Shared {
                db: Mutex::new(db),
                changes,
            }),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.shared.db.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run a read-only closure against the database.
    pub fn read<R>(&self, f: impl FnOnce(&Database) -> Result<R>) -> Result<R> {
        let db = self.lock()?;
        f(&db)
    }

    /// Run `f` inside one transaction and publish the keys it touched.
    ///
    /// If `f` fails nothing is committed and nothing is published.
    pub fn write<R>(&self, f: impl FnOnce(&mut WriteTxn<'_>) -> Result<R>) -> Result<R> {
        let (result, changes) = {
            let db = self.lock()?;
            let tx = db.conn().unchecked_transaction()?;
            let mut txn = WriteTxn {
                db: &*db,
                changes: ChangeSet::default(),
            };
            let result = f(&mut txn)?;
            let changes = txn.changes;
            tx.commit()?;
            (result, changes)
        };

        if !changes.is_empty() {
            tracing::trace!(keys = changes.keys.len(), "publishing change set");
            // No receivers is fine.
            let _ = self.shared.changes.send(changes);
        }
        Ok(result)
    }

    pub fn get(&self, key: &EntityKey) -> Result<Option<Entity>> {
        self.read(|db| db.get_entity(key))
    }

    pub fn query(&self, filter: &Filter) -> Result<Vec<Entity>> {
        self.read(|db| db.query_entities(filter))
    }

    /// Upsert a batch atomically.
    pub fn upsert(&self, entities: impl IntoIterator<Item = Entity>) -> Result<()> {
        self.write(|txn| {
            for entity in entities {
                txn.upsert(&entity)?;
            }
            Ok(())
        })
    }

    pub fn remove(&self, key: &EntityKey) -> Result<bool> {
        self.write(|txn| txn.remove(key))
    }

    /// Capture the current value (or absence) of each key.
    pub fn snapshot(&self, keys: impl IntoIterator<Item = EntityKey>) -> Result<Snapshot> {
        self.read(|db| {
            let mut snapshot = Snapshot::default();
            for key in keys {
                let value = db.get_entity(&key)?;
                snapshot.entries.insert(key, value);
            }
            Ok(snapshot)
        })
    }

    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        self.write(|txn| txn.restore(snapshot))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.shared.changes.subscribe()
    }

    pub fn orphans(&self) -> Result<Vec<EntityKey>> {
        self.read(|db| db.orphans())
    }

    /// Wipe every table (logout) and invalidate every live query.
    pub fn reset(&self) -> Result<()> {
        self.lock()?.wipe()?;
        tracing::info!("local store reset");
        let _ = self.shared.changes.send(ChangeSet::reset());
        Ok(())
    }

    /// A read-only view for UI code.
    pub fn reader(&self) -> StoreReader {
        StoreReader {
            store: self.clone(),
        }
    }
}

/// Read-only store handle.
#[derive(Clone)]
pub struct StoreReader {
    store: LocalStore,
}

impl StoreReader {
    pub fn read<R>(&self, f: impl FnOnce(&Database) -> Result<R>) -> Result<R> {
        self.store.read(f)
    }

    pub fn get(&self, key: &EntityKey) -> Result<Option<Entity>> {
        self.store.get(key)
    }

    pub fn query(&self, filter: &Filter) -> Result<Vec<Entity>> {
        self.store.query(filter)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.store.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// A write in progress. Every mutation records the keys it touched.
pub struct WriteTxn<'a> {
    db: &'a Database,
    changes: ChangeSet,
}

impl<'a> WriteTxn<'a> {
    /// Reads see the transaction's own uncommitted writes.
    pub fn db(&self) -> &'a Database {
        self.db
    }

    pub fn get(&self, key: &EntityKey) -> Result<Option<Entity>> {
        self.db.get_entity(key)
    }

    /// Mark a key as changed after writing through [`WriteTxn::db`].
    pub fn touch(&mut self, key: EntityKey) {
        self.changes.keys.insert(key);
    }

    pub fn upsert(&mut self, entity: &Entity) -> Result<()> {
        match entity {
            Entity::Group(group) => {
                for channel in self.db.upsert_group(group)? {
                    self.touch(EntityKey::Channel(channel));
                }
            }
            Entity::Channel(channel) => {
                for post in self.db.upsert_channel(channel)? {
                    self.touch(EntityKey::post(&channel.id, post));
                }
            }
            Entity::Post(post) => self.db.upsert_post(post)?,
            Entity::Contact(contact) => self.db.upsert_contact(contact)?,
            Entity::Cohort(cohort) => self.db.upsert_cohort(cohort)?,
            Entity::Activity(event) => {
                self.db.insert_activity(event)?;
            }
        }
        self.touch(entity.key());
        Ok(())
    }

    /// Remove one entity. Removing a channel keeps its posts; use
    /// [`WriteTxn::purge_channel`] to drop them too.
    pub fn remove(&mut self, key: &EntityKey) -> Result<bool> {
        let removed = match key {
            EntityKey::Group(id) => self.db.delete_group(id)?,
            EntityKey::Channel(id) => self.db.delete_channel(id)?,
            EntityKey::Post { channel, id } => {
                self.db.delete_activity_for_post(channel, *id)?;
                self.db.delete_post_row(channel, *id)?
            }
            EntityKey::Contact(id) => self.db.delete_contact(id)?,
            EntityKey::Cohort(id) => self.db.delete_cohort(id)?,
            EntityKey::Activity { source, post } => self.db.delete_activity(source, *post)?,
        };
        if removed {
            self.touch(key.clone());
        }
        Ok(removed)
    }

    pub fn purge_channel(&mut self, id: &ChannelId) -> Result<bool> {
        let removed = self.db.purge_channel(id)?;
        self.db.clear_clocks(&EntityKey::Channel(id.clone()))?;
        self.touch(EntityKey::Channel(id.clone()));
        Ok(removed)
    }

    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        for (key, value) in &snapshot.entries {
            match value {
                Some(entity) => self.upsert(entity)?,
                None => {
                    self.remove(key)?;
                }
            }
        }
        Ok(())
    }

    // -- replace-scope primitives -------------------------------------

    pub fn retain_groups(&mut self, keep: &BTreeSet<GroupId>) -> Result<Vec<GroupId>> {
        let removed = self.db.retain_groups(keep)?;
        for id in &removed {
            self.touch(EntityKey::Group(id.clone()));
        }
        Ok(removed)
    }

    pub fn retain_channels_for_group(
        &mut self,
        group: &GroupId,
        keep: &BTreeSet<ChannelId>,
    ) -> Result<Vec<ChannelId>> {
        let removed = self.db.retain_channels_for_group(group, keep)?;
        for id in &removed {
            self.touch(EntityKey::Channel(id.clone()));
        }
        Ok(removed)
    }

    pub fn retain_posts(
        &mut self,
        channel: &ChannelId,
        keep: &BTreeSet<PostId>,
        from: Option<PostId>,
    ) -> Result<Vec<PostId>> {
        let removed = self.db.retain_posts(channel, keep, from)?;
        for id in &removed {
            self.db.delete_activity_for_post(channel, *id)?;
            self.touch(EntityKey::post(channel, *id));
        }
        Ok(removed)
    }

    pub fn retain_contacts(&mut self, keep: &BTreeSet<Ship>, own: &Ship) -> Result<Vec<Ship>> {
        let removed = self.db.retain_contacts(keep, own)?;
        for id in &removed {
            self.touch(EntityKey::Contact(id.clone()));
        }
        Ok(removed)
    }

    pub fn retain_cohorts(&mut self, keep: &BTreeSet<String>) -> Result<Vec<String>> {
        let removed = self.db.retain_cohorts(keep)?;
        for id in &removed {
            self.touch(EntityKey::Cohort(id.clone()));
        }
        Ok(removed)
    }
}

/// Pre-images of a set of entities, used to roll back an optimistic write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// `None` means the entity did not exist.
    pub entries: BTreeMap<EntityKey, Option<Entity>>,
}

impl Snapshot {
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Option<Entity>> {
        self.entries.get(key)
    }

    /// Keep only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&EntityKey) -> bool) {
        self.entries.retain(|k, _| keep(k));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Kind-erased access
// ---------------------------------------------------------------------------

impl Database {
    pub fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(match key {
            EntityKey::Group(id) => self.find_group(id)?.map(Entity::Group),
            EntityKey::Channel(id) => self.find_channel(id)?.map(Entity::Channel),
            EntityKey::Post { channel, id } => self.find_post(channel, *id)?.map(Entity::Post),
            EntityKey::Contact(id) => self.find_contact(id)?.map(Entity::Contact),
            EntityKey::Cohort(id) => self.find_cohort(id)?.map(Entity::Cohort),
            EntityKey::Activity { source, post } => {
                self.find_activity(source, *post)?.map(Entity::Activity)
            }
        })
    }

    pub fn query_entities(&self, filter: &Filter) -> Result<Vec<Entity>> {
        Ok(match filter {
            Filter::Groups => self.list_groups()?.into_iter().map(Entity::Group).collect(),
            Filter::GroupsHostedBy(host) => self
                .groups_by_host(host)?
                .into_iter()
                .map(Entity::Group)
                .collect(),
            Filter::ChannelsOfGroup(group) => self
                .channels_for_group(group)?
                .into_iter()
                .map(Entity::Channel)
                .collect(),
            Filter::DirectChannels => self
                .direct_channels()?
                .into_iter()
                .map(Entity::Channel)
                .collect(),
            Filter::Posts { channel, limit } => self
                .posts_for_channel(channel, *limit)?
                .into_iter()
                .map(Entity::Post)
                .collect(),
            Filter::Thread { channel, parent } => self
                .thread_replies(channel, *parent)?
                .into_iter()
                .map(Entity::Post)
                .collect(),
            Filter::Contacts => self
                .list_contacts()?
                .into_iter()
                .map(Entity::Contact)
                .collect(),
            Filter::Cohorts => self
                .list_cohorts()?
                .into_iter()
                .map(Entity::Cohort)
                .collect(),
            Filter::Activity { since } => self
                .activity_since(*since)?
                .into_iter()
                .map(Entity::Activity)
                .collect(),
            Filter::Orphans => {
                let mut entities = Vec::new();
                for key in self.orphans()? {
                    if let Some(entity) = self.get_entity(&key)? {
                        entities.push(entity);
                    }
                }
                entities
            }
        })
    }
}

//! Applying remote state to the local store.
//!
//! Every clocked field follows last-writer-wins by logical time with local
//! precedence: a remote value lands only if no pending mutation owns the
//! field and its time is not older than the field's clock. A diff blocked by
//! a pending mutation is parked on that mutation and replayed if it rolls
//! back. Snapshots pass the pending-write gate only, then the scope is pruned
//! to what the snapshot contains.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use tlon_shared::protocol::{
    CabalDiff, ChannelSnapshot, CohortsSnapshot, ContactsSnapshot, FleetDiff, GroupSnapshot,
    GroupsSnapshot, PostSnapshot, PostsSnapshot, UnreadsSnapshot,
};
use tlon_shared::{ChannelId, ChannelMeta, GroupId, LogicalTime, PostId, Ship, Story};
use tlon_store::{
    ActivityEvent, ActivityKind, ActivitySource, Channel, Cohort, Contact, Database,
    DeliveryStatus, Entity, EntityKey, FieldClock, FieldRef, Group, Member, Post, Result, Unread,
    WriteTxn,
};

use super::diff::{fields, SyncDiff};
use crate::mutation::PendingRegistry;

const PREVIEW_CHARS: usize = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Already in the store.
    Unchanged,
    /// Older than the field's clock.
    Stale,
    /// Parked behind a pending local write.
    Deferred,
    /// Nothing to apply it to.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Subscription events: advance clocks and keep counters in step.
    Live,
    /// Snapshot contents: values only, clocks stay where they are. Only a
    /// pending local write holds a snapshot value back.
    Backfill,
}

enum Gate {
    Open,
    Stale,
    Held(Uuid),
}

pub struct Applier<'t, 'a> {
    txn: &'t mut WriteTxn<'a>,
    pending: &'t mut PendingRegistry,
    own: &'t Ship,
    mode: ApplyMode,
}

impl<'t, 'a> Applier<'t, 'a> {
    pub fn new(
        txn: &'t mut WriteTxn<'a>,
        pending: &'t mut PendingRegistry,
        own: &'t Ship,
        mode: ApplyMode,
    ) -> Self {
        Self {
            txn,
            pending,
            own,
            mode,
        }
    }

    fn db(&self) -> &'a Database {
        self.txn.db()
    }

    fn gate(&self, field: &FieldRef, time: LogicalTime) -> Result<Gate> {
        Ok(match self.db().clock(&field.key, &field.field)? {
            Some(FieldClock {
                pending: Some(owner),
                ..
            }) if self.pending.contains(owner) => Gate::Held(owner),
            // A snapshot is the ship's current state, whatever its clock says.
            Some(clock) if self.mode == ApplyMode::Live && time < clock.time => Gate::Stale,
            // A pending stamp nobody owns is left over from a previous run.
            _ => Gate::Open,
        })
    }

    fn owned_by_pending(&self, key: &EntityKey, field: &str) -> Result<bool> {
        Ok(matches!(
            self.db().clock(key, field)?,
            Some(FieldClock { pending: Some(owner), .. }) if self.pending.contains(owner)
        ))
    }

    fn stamp(&self, field: &FieldRef, time: LogicalTime) -> Result<()> {
        if self.mode == ApplyMode::Backfill {
            return Ok(());
        }
        let time = match self.db().clock(&field.key, &field.field)? {
            Some(clock) if clock.time > time => clock.time,
            _ => time,
        };
        self.db()
            .set_clock(&field.key, &field.field, &FieldClock::confirmed(time))
    }

    fn hold(&mut self, owner: Uuid, diff: SyncDiff) -> Outcome {
        debug!(mutation = %owner, ?diff, "remote diff held behind pending write");
        self.pending.defer(owner, diff);
        Outcome::Deferred
    }

    // ------------------------------------------------------------------
    // Diffs
    // ------------------------------------------------------------------

    pub fn apply(&mut self, diff: &SyncDiff) -> Result<Outcome> {
        match diff {
            SyncDiff::Group { id, time, snapshot } => return self.apply_group(id, *time, snapshot),
            SyncDiff::ChannelAdded {
                group,
                id,
                time,
                snapshot,
            } => return self.apply_channel_added(group, id, *time, snapshot),
            SyncDiff::Reactions {
                channel,
                id,
                time,
                reacts,
            } => return self.apply_reactions(diff, channel, *id, *time, reacts),
            SyncDiff::Members { group, ships, diff } => return self.apply_members(group, ships, diff),
            SyncDiff::Role { group, sect, diff } => return self.apply_role(group, sect, diff),
            SyncDiff::ChannelOrder { group, order } => return self.apply_order(group, order),
            _ => {}
        }

        let (Some(field), Some(time)) = (diff.field(), diff.time()) else {
            return Ok(Outcome::Ignored);
        };
        match self.gate(&field, time)? {
            Gate::Held(owner) => return Ok(self.hold(owner, diff.clone())),
            Gate::Stale => {
                debug!(key = %field.key, field = %field.field, %time, "stale remote diff ignored");
                return Ok(Outcome::Stale);
            }
            Gate::Open => {}
        }

        let outcome = match diff {
            SyncDiff::GroupMeta { id, meta, .. } => match self.db().find_group(id)? {
                Some(group) if &group.meta == meta => Outcome::Unchanged,
                Some(mut group) => {
                    group.meta = meta.clone();
                    self.txn.upsert(&Entity::Group(group))?;
                    Outcome::Applied
                }
                None => Outcome::Ignored,
            },
            SyncDiff::GroupRemoved { id, .. } => self.remove_group(id)?,
            SyncDiff::ChannelMeta { id, meta, .. } => match self.db().find_channel(id)? {
                Some(channel) if &channel.meta == meta => Outcome::Unchanged,
                Some(mut channel) => {
                    channel.meta = meta.clone();
                    self.txn.upsert(&Entity::Channel(channel))?;
                    Outcome::Applied
                }
                None => Outcome::Ignored,
            },
            SyncDiff::ChannelRemoved { group, id, .. } => self.remove_channel(group, id)?,
            SyncDiff::Post {
                channel,
                id,
                parent,
                post,
                ..
            } => self.apply_post(channel, *id, *parent, post.as_ref())?,
            SyncDiff::Unread { channel, unread, .. } => {
                let next = Unread {
                    count: unread.count,
                    last_read: unread.last_read,
                };
                match self.db().find_channel(channel)? {
                    Some(existing) if existing.unread == next => Outcome::Unchanged,
                    Some(_) => {
                        self.db().set_unread(channel, &next)?;
                        self.txn.touch(EntityKey::Channel(channel.clone()));
                        Outcome::Applied
                    }
                    None => Outcome::Ignored,
                }
            }
            SyncDiff::Contact { ship, profile, .. } => match profile {
                None => {
                    if self.txn.remove(&EntityKey::Contact(ship.clone()))? {
                        Outcome::Applied
                    } else {
                        Outcome::Ignored
                    }
                }
                Some(profile) => {
                    let next = Contact::from_profile(ship.clone(), profile.clone());
                    if self.db().find_contact(ship)?.as_ref() == Some(&next) {
                        Outcome::Unchanged
                    } else {
                        self.txn.upsert(&Entity::Contact(next))?;
                        Outcome::Applied
                    }
                }
            },
            SyncDiff::Cohort { id, targets, .. } => match targets {
                None => {
                    if self.txn.remove(&EntityKey::Cohort(id.clone()))? {
                        Outcome::Applied
                    } else {
                        Outcome::Ignored
                    }
                }
                Some(targets) => {
                    let next = Cohort {
                        id: id.clone(),
                        targets: targets.clone(),
                    };
                    if self.db().find_cohort(id)?.as_ref() == Some(&next) {
                        Outcome::Unchanged
                    } else {
                        self.txn.upsert(&Entity::Cohort(next))?;
                        Outcome::Applied
                    }
                }
            },
            _ => Outcome::Ignored,
        };

        // Also stamps misses: the clock then rejects an older re-add.
        self.stamp(&field, time)?;
        Ok(outcome)
    }

    fn apply_group(&mut self, id: &GroupId, time: LogicalTime, snapshot: &GroupSnapshot) -> Result<Outcome> {
        let field = FieldRef::new(EntityKey::Group(id.clone()), fields::META);
        let existing = self.db().find_group(id)?;

        let take_meta = match (self.gate(&field, time)?, &existing) {
            (Gate::Held(owner), None) => {
                return Ok(self.hold(
                    owner,
                    SyncDiff::Group {
                        id: id.clone(),
                        time,
                        snapshot: snapshot.clone(),
                    },
                ))
            }
            (Gate::Stale, None) => return Ok(Outcome::Stale),
            (Gate::Held(owner), Some(_)) => {
                self.hold(
                    owner,
                    SyncDiff::GroupMeta {
                        id: id.clone(),
                        time,
                        meta: snapshot.meta.clone(),
                    },
                );
                false
            }
            (Gate::Stale, Some(_)) => false,
            (Gate::Open, _) => true,
        };

        let mut group = existing
            .clone()
            .unwrap_or_else(|| Group::new(id.clone(), snapshot.meta.clone()));
        if take_meta {
            group.meta = snapshot.meta.clone();
        }
        group.privacy = snapshot.privacy;
        group.channel_order = if snapshot.order.is_empty() {
            snapshot.channels.keys().cloned().collect()
        } else {
            snapshot.order.clone()
        };
        group.members = snapshot
            .fleet
            .iter()
            .map(|(ship, vessel)| Member {
                ship: ship.clone(),
                roles: vessel.sects.clone(),
            })
            .collect();
        group.roles = snapshot.cabals.clone();
        group.joined = true;

        let mut outcome = if existing.as_ref() == Some(&group) {
            Outcome::Unchanged
        } else {
            self.txn.upsert(&Entity::Group(group))?;
            Outcome::Applied
        };

        for (channel, channel_snapshot) in &snapshot.channels {
            if self.apply_channel_added(id, channel, time, channel_snapshot)? == Outcome::Applied {
                outcome = Outcome::Applied;
            }
        }

        if take_meta {
            self.stamp(&field, time)?;
        }
        Ok(outcome)
    }

    fn remove_group(&mut self, id: &GroupId) -> Result<Outcome> {
        if !self.db().group_exists(id)? {
            return Ok(Outcome::Ignored);
        }
        for channel in self.db().channels_for_group(id)? {
            self.txn.purge_channel(&channel.id)?;
        }
        self.txn.remove(&EntityKey::Group(id.clone()))?;
        info!(group = %id, "group removed");
        Ok(Outcome::Applied)
    }

    fn apply_channel_added(
        &mut self,
        group: &GroupId,
        id: &ChannelId,
        time: LogicalTime,
        snapshot: &ChannelSnapshot,
    ) -> Result<Outcome> {
        let field = FieldRef::new(EntityKey::Channel(id.clone()), fields::META);
        let existing = self.db().find_channel(id)?;

        let take_meta = match (self.gate(&field, time)?, &existing) {
            (Gate::Held(owner), None) => {
                return Ok(self.hold(
                    owner,
                    SyncDiff::ChannelAdded {
                        group: group.clone(),
                        id: id.clone(),
                        time,
                        snapshot: snapshot.clone(),
                    },
                ))
            }
            (Gate::Stale, None) => return Ok(Outcome::Stale),
            (Gate::Held(owner), Some(_)) => {
                self.hold(
                    owner,
                    SyncDiff::ChannelMeta {
                        id: id.clone(),
                        time,
                        meta: snapshot.meta.clone(),
                    },
                );
                false
            }
            (Gate::Stale, Some(_)) => false,
            (Gate::Open, _) => true,
        };

        let mut channel = existing
            .clone()
            .unwrap_or_else(|| Channel::new(id.clone(), Some(group.clone()), snapshot.meta.clone()));
        if take_meta {
            channel.meta = snapshot.meta.clone();
        }
        channel.group_id = Some(group.clone());
        channel.writers = snapshot.writers.clone();

        let outcome = if existing.as_ref() == Some(&channel) {
            Outcome::Unchanged
        } else {
            self.txn.upsert(&Entity::Channel(channel))?;
            Outcome::Applied
        };

        if self.mode == ApplyMode::Live {
            if let Some(mut parent) = self.db().find_group(group)? {
                if !parent.channel_order.contains(id) {
                    parent.channel_order.push(id.clone());
                    self.txn.upsert(&Entity::Group(parent))?;
                }
            }
        }

        if take_meta {
            self.stamp(&field, time)?;
        }
        Ok(outcome)
    }

    fn remove_channel(&mut self, group: &GroupId, id: &ChannelId) -> Result<Outcome> {
        if !self.db().channel_exists(id)? {
            return Ok(Outcome::Ignored);
        }
        self.txn.purge_channel(id)?;
        if let Some(mut parent) = self.db().find_group(group)? {
            if parent.channel_order.contains(id) {
                parent.channel_order.retain(|c| c != id);
                self.txn.upsert(&Entity::Group(parent))?;
            }
        }
        Ok(Outcome::Applied)
    }

    fn apply_members(&mut self, group: &GroupId, ships: &[Ship], diff: &FleetDiff) -> Result<Outcome> {
        let Some(mut record) = self.db().find_group(group)? else {
            return Ok(Outcome::Ignored);
        };
        let before = record.members.clone();
        match diff {
            FleetDiff::Add(_) => {
                for ship in ships {
                    if !record.members.iter().any(|m| &m.ship == ship) {
                        record.members.push(Member {
                            ship: ship.clone(),
                            roles: Vec::new(),
                        });
                    }
                }
            }
            FleetDiff::Del(_) => record.members.retain(|m| !ships.contains(&m.ship)),
            FleetDiff::AddSects(sects) => {
                for member in record.members.iter_mut().filter(|m| ships.contains(&m.ship)) {
                    for sect in sects {
                        if !member.roles.contains(sect) {
                            member.roles.push(sect.clone());
                        }
                    }
                }
            }
            FleetDiff::DelSects(sects) => {
                for member in record.members.iter_mut().filter(|m| ships.contains(&m.ship)) {
                    member.roles.retain(|r| !sects.contains(r));
                }
            }
        }
        if record.members == before {
            return Ok(Outcome::Unchanged);
        }
        self.txn.upsert(&Entity::Group(record))?;
        Ok(Outcome::Applied)
    }

    fn apply_role(&mut self, group: &GroupId, sect: &str, diff: &CabalDiff) -> Result<Outcome> {
        let Some(mut record) = self.db().find_group(group)? else {
            return Ok(Outcome::Ignored);
        };
        let changed = match diff {
            CabalDiff::Add(meta) => record.roles.insert(sect.to_string(), meta.clone()).as_ref() != Some(meta),
            CabalDiff::Del(_) => record.roles.remove(sect).is_some(),
        };
        if !changed {
            return Ok(Outcome::Unchanged);
        }
        self.txn.upsert(&Entity::Group(record))?;
        Ok(Outcome::Applied)
    }

    fn apply_order(&mut self, group: &GroupId, order: &[ChannelId]) -> Result<Outcome> {
        let Some(mut record) = self.db().find_group(group)? else {
            return Ok(Outcome::Ignored);
        };
        if record.channel_order == order {
            return Ok(Outcome::Unchanged);
        }
        record.channel_order = order.to_vec();
        self.txn.upsert(&Entity::Group(record))?;
        Ok(Outcome::Applied)
    }

    fn apply_post(
        &mut self,
        channel: &ChannelId,
        id: PostId,
        parent: Option<PostId>,
        post: Option<&PostSnapshot>,
    ) -> Result<Outcome> {
        let existing = self.db().find_post(channel, id)?;

        let Some(snapshot) = post else {
            return match existing {
                Some(mut record) if !record.deleted => {
                    record.deleted = true;
                    self.txn.upsert(&Entity::Post(record))?;
                    self.db().delete_activity_for_post(channel, id)?;
                    self.txn.touch(EntityKey::Channel(channel.clone()));
                    if let (ApplyMode::Live, Some(parent)) = (self.mode, parent) {
                        self.bump_reply_count(channel, parent, -1)?;
                    }
                    Ok(Outcome::Applied)
                }
                Some(_) => Ok(Outcome::Unchanged),
                None => Ok(Outcome::Ignored),
            };
        };

        if existing.as_ref().is_some_and(|p| p.deleted) {
            debug!(%channel, post = %id, "ignoring re-add of deleted post");
            return Ok(Outcome::Ignored);
        }

        let sent = millis_to_time(snapshot.sent);
        let mut reconciled = false;
        if existing.is_none() {
            if let Some(local) = self.db().find_post_by_sent(channel, &snapshot.author, sent)? {
                if local.id != id && local.delivery == DeliveryStatus::Pending {
                    debug!(%channel, local = %local.id, remote = %id, "optimistic post delivered");
                    self.txn.remove(&EntityKey::post(channel, local.id))?;
                    reconciled = true;
                }
            }
        }

        let key = EntityKey::post(channel, id);
        let reactions = self.merge_reactions(
            &key,
            existing.as_ref().map(|p| &p.reactions),
            &snapshot.reacts,
        )?;
        let record = Post {
            id,
            channel_id: channel.clone(),
            author: snapshot.author.clone(),
            sent,
            content: snapshot.content.clone(),
            parent_id: parent,
            reactions,
            reply_count: snapshot.reply_count,
            delivery: DeliveryStatus::Sent,
            edited: snapshot.edited,
            deleted: false,
        };
        if existing.as_ref() == Some(&record) {
            return Ok(Outcome::Unchanged);
        }

        let is_new = existing.is_none();
        self.txn.upsert(&Entity::Post(record.clone()))?;
        if is_new {
            if let (ApplyMode::Live, Some(parent), false) = (self.mode, parent, reconciled) {
                self.bump_reply_count(channel, parent, 1)?;
            }
            self.derive_activity(&record)?;
        }
        Ok(Outcome::Applied)
    }

    /// Remote reactions, except where our own reaction change is in flight.
    fn merge_reactions(
        &self,
        key: &EntityKey,
        local: Option<&BTreeMap<Ship, String>>,
        remote: &BTreeMap<Ship, String>,
    ) -> Result<BTreeMap<Ship, String>> {
        let mut merged = remote.clone();
        let Some(local) = local else {
            return Ok(merged);
        };
        let ships: BTreeSet<&Ship> = local.keys().chain(remote.keys()).collect();
        for ship in ships {
            if self.owned_by_pending(key, &fields::react(ship))? {
                match local.get(ship) {
                    Some(react) => merged.insert(ship.clone(), react.clone()),
                    None => merged.remove(ship),
                };
            }
        }
        Ok(merged)
    }

    fn apply_reactions(
        &mut self,
        diff: &SyncDiff,
        channel: &ChannelId,
        id: PostId,
        time: LogicalTime,
        reacts: &BTreeMap<Ship, String>,
    ) -> Result<Outcome> {
        let Some(mut record) = self.db().find_post(channel, id)? else {
            return Ok(Outcome::Ignored);
        };
        if record.deleted {
            return Ok(Outcome::Ignored);
        }
        let key = EntityKey::post(channel, id);
        let before = record.reactions.clone();
        let ships: BTreeSet<Ship> = before.keys().chain(reacts.keys()).cloned().collect();

        let mut held = BTreeSet::new();
        for ship in ships {
            let field = FieldRef::new(key.clone(), fields::react(&ship));
            match self.gate(&field, time)? {
                Gate::Held(owner) => {
                    held.insert(owner);
                    continue;
                }
                Gate::Stale => continue,
                Gate::Open => {}
            }
            match reacts.get(&ship) {
                Some(react) => record.reactions.insert(ship.clone(), react.clone()),
                None => record.reactions.remove(&ship),
            };
            self.stamp(&field, time)?;
        }
        for owner in &held {
            self.hold(*owner, diff.clone());
        }

        if record.reactions != before {
            self.txn.upsert(&Entity::Post(record))?;
            Ok(Outcome::Applied)
        } else if !held.is_empty() {
            Ok(Outcome::Deferred)
        } else {
            Ok(Outcome::Unchanged)
        }
    }

    fn bump_reply_count(&mut self, channel: &ChannelId, parent: PostId, delta: i64) -> Result<()> {
        if let Some(mut record) = self.db().find_post(channel, parent)? {
            let next = (record.reply_count as i64 + delta).max(0) as u32;
            if next != record.reply_count {
                record.reply_count = next;
                self.txn.upsert(&Entity::Post(record))?;
            }
        }
        Ok(())
    }

    /// Record an activity event for posts that concern us: mentions,
    /// replies in threads we started, and posts in channels we follow.
    fn derive_activity(&mut self, post: &Post) -> Result<()> {
        if &post.author == self.own || post.deleted {
            return Ok(());
        }
        let Some(channel) = self.db().find_channel(&post.channel_id)? else {
            return Ok(());
        };
        let mentioned = post.content.mentions().iter().any(|s| s == self.own);

        let (source, kind) = match post.parent_id {
            Some(parent) => {
                let own_thread = self
                    .db()
                    .find_post(&post.channel_id, parent)?
                    .is_some_and(|p| &p.author == self.own);
                if !own_thread && !mentioned {
                    return Ok(());
                }
                let kind = if mentioned { ActivityKind::Mention } else { ActivityKind::Reply };
                (
                    ActivitySource::Thread {
                        channel: post.channel_id.clone(),
                        parent,
                    },
                    kind,
                )
            }
            None => {
                let kind = if mentioned { ActivityKind::Mention } else { ActivityKind::Post };
                (ActivitySource::Channel(post.channel_id.clone()), kind)
            }
        };

        let event = ActivityEvent {
            source,
            post_id: post.id,
            author: post.author.clone(),
            kind,
            group_id: channel.group_id,
            time: post.sent,
            preview: preview(&post.content),
        };
        self.txn.upsert(&Entity::Activity(event))
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Make joined groups match `snapshot`. Groups with a pending local
    /// write survive until it settles.
    pub fn replace_groups(&mut self, snapshot: &GroupsSnapshot, time: LogicalTime) -> Result<()> {
        let mut keep: BTreeSet<GroupId> = snapshot.keys().cloned().collect();
        let mut doomed = Vec::new();
        for group in self.db().list_groups()? {
            if keep.contains(&group.id) {
                continue;
            }
            if self.owned_by_pending(&EntityKey::Group(group.id.clone()), fields::META)? {
                keep.insert(group.id);
                continue;
            }
            doomed.extend(self.db().channels_for_group(&group.id)?.into_iter().map(|c| c.id));
        }

        let removed = self.txn.retain_groups(&keep)?;
        if !removed.is_empty() {
            info!(count = removed.len(), "dropped groups missing from snapshot");
        }
        for channel in doomed {
            self.txn.purge_channel(&channel)?;
        }

        for (id, group) in snapshot {
            self.apply(&SyncDiff::Group {
                id: id.clone(),
                time,
                snapshot: group.clone(),
            })?;
        }
        Ok(())
    }

    pub fn replace_group(&mut self, id: &GroupId, snapshot: &GroupSnapshot, time: LogicalTime) -> Result<()> {
        self.apply(&SyncDiff::Group {
            id: id.clone(),
            time,
            snapshot: snapshot.clone(),
        })?;
        if self.db().group_exists(id)? {
            let keep: BTreeSet<ChannelId> = snapshot.channels.keys().cloned().collect();
            let removed = self.txn.retain_channels_for_group(id, &keep)?;
            if !removed.is_empty() {
                info!(group = %id, count = removed.len(), "dropped channels missing from snapshot");
            }
        }
        Ok(())
    }

    /// Make the snapshot's window of `channel` match it. Posts older than
    /// the window, pending sends and tombstones are kept.
    pub fn replace_posts(&mut self, channel: &ChannelId, snapshot: &PostsSnapshot, time: LogicalTime) -> Result<()> {
        if channel.kind().is_direct() && !self.db().channel_exists(channel)? {
            self.txn.upsert(&Entity::Channel(Channel::new(
                channel.clone(),
                None,
                ChannelMeta::default(),
            )))?;
        }

        let mut keep = BTreeSet::new();
        for (id, post) in &snapshot.posts {
            keep.insert(*id);
            self.apply(&SyncDiff::Post {
                channel: channel.clone(),
                id: *id,
                parent: None,
                time,
                post: Some(post.clone()),
            })?;
        }
        for (parent, replies) in &snapshot.replies {
            for (id, reply) in replies {
                keep.insert(*id);
                self.apply(&SyncDiff::Post {
                    channel: channel.clone(),
                    id: *id,
                    parent: Some(*parent),
                    time,
                    post: Some(reply.clone()),
                })?;
            }
        }
        // Threads the snapshot says nothing about stay as they are.
        for parent in snapshot.posts.keys() {
            if !snapshot.replies.contains_key(parent) {
                for reply in self.db().thread_replies(channel, *parent)? {
                    keep.insert(reply.id);
                }
            }
        }

        let from = match snapshot.older {
            Some(_) => match snapshot.posts.keys().next() {
                Some(first) => Some(*first),
                None => return Ok(()),
            },
            None => None,
        };
        let removed = self.txn.retain_posts(channel, &keep, from)?;
        if !removed.is_empty() {
            debug!(%channel, count = removed.len(), "dropped posts missing from snapshot");
        }
        Ok(())
    }

    pub fn replace_unreads(&mut self, snapshot: &UnreadsSnapshot, time: LogicalTime) -> Result<()> {
        for (channel, unread) in snapshot {
            self.apply(&SyncDiff::Unread {
                channel: channel.clone(),
                time,
                unread: unread.clone(),
            })?;
        }
        Ok(())
    }

    pub fn replace_contacts(&mut self, snapshot: &ContactsSnapshot, time: LogicalTime) -> Result<()> {
        let mut keep: BTreeSet<Ship> = snapshot.keys().cloned().collect();
        for contact in self.db().list_contacts()? {
            if self.owned_by_pending(&EntityKey::Contact(contact.id.clone()), fields::PROFILE)? {
                keep.insert(contact.id);
            }
        }
        self.txn.retain_contacts(&keep, self.own)?;
        for (ship, profile) in snapshot {
            self.apply(&SyncDiff::Contact {
                ship: ship.clone(),
                time,
                profile: Some(profile.clone()),
            })?;
        }
        Ok(())
    }

    pub fn replace_cohorts(&mut self, snapshot: &CohortsSnapshot, time: LogicalTime) -> Result<()> {
        let mut keep: BTreeSet<String> = snapshot.keys().cloned().collect();
        for cohort in self.db().list_cohorts()? {
            if self.owned_by_pending(&EntityKey::Cohort(cohort.id.clone()), fields::TARGETS)? {
                keep.insert(cohort.id);
            }
        }
        self.txn.retain_cohorts(&keep)?;
        for (id, targets) in snapshot {
            self.apply(&SyncDiff::Cohort {
                id: id.clone(),
                time,
                targets: Some(targets.clone()),
            })?;
        }
        Ok(())
    }
}

pub(crate) fn millis_to_time(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn preview(content: &Story) -> String {
    let text = content.to_plain_text();
    if text.chars().count() <= PREVIEW_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(PREVIEW_CHARS).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tlon_shared::protocol::Vessel;
    use tlon_shared::story::{Inline, InlineNode, Verse};
    use tlon_shared::GroupMeta;
    use tlon_store::{LocalStore, Snapshot};

    use crate::mutation::{MutationStatus, PendingMutation};

    fn zod() -> Ship {
        "~zod".parse().unwrap()
    }

    fn flag() -> GroupId {
        "~zod/test".parse().unwrap()
    }

    fn nest() -> ChannelId {
        "chat/~zod/general".parse().unwrap()
    }

    fn group_snapshot(title: &str) -> GroupSnapshot {
        let mut snapshot = GroupSnapshot {
            meta: GroupMeta::titled(title),
            ..GroupSnapshot::default()
        };
        snapshot.channels.insert(
            nest(),
            ChannelSnapshot {
                meta: ChannelMeta {
                    title: "General".into(),
                    description: String::new(),
                },
                writers: Vec::new(),
            },
        );
        snapshot.fleet.insert(zod(), Vessel::default());
        snapshot
    }

    fn post(author: &str, sent: i64, text: &str) -> PostSnapshot {
        PostSnapshot {
            author: author.parse().unwrap(),
            sent,
            content: Story::text(text),
            reacts: BTreeMap::new(),
            reply_count: 0,
            edited: false,
        }
    }

    fn apply(store: &LocalStore, pending: &mut PendingRegistry, diff: &SyncDiff) -> Outcome {
        store
            .write(|txn| Applier::new(txn, pending, &zod(), ApplyMode::Live).apply(diff))
            .unwrap()
    }

    fn seeded() -> (LocalStore, PendingRegistry) {
        let store = LocalStore::open_in_memory().unwrap();
        let mut pending = PendingRegistry::default();
        let diff = SyncDiff::Group {
            id: flag(),
            time: LogicalTime(10),
            snapshot: group_snapshot("Old"),
        };
        assert_eq!(apply(&store, &mut pending, &diff), Outcome::Applied);
        (store, pending)
    }

    fn title(store: &LocalStore) -> String {
        store.read(|db| db.get_group(&flag())).unwrap().meta.title
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let (store, mut pending) = seeded();
        let diff = SyncDiff::Post {
            channel: nest(),
            id: PostId(100),
            parent: None,
            time: LogicalTime(20),
            post: Some(post("~bus", 1_700_000_000_000, "hi")),
        };
        assert_eq!(apply(&store, &mut pending, &diff), Outcome::Applied);
        let once = store.read(|db| db.posts_for_channel(&nest(), 10)).unwrap();
        assert_eq!(apply(&store, &mut pending, &diff), Outcome::Unchanged);
        let twice = store.read(|db| db.posts_for_channel(&nest(), 10)).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.len(), 1);
    }

    #[test]
    fn older_meta_does_not_regress_newer() {
        let (store, mut pending) = seeded();
        let newer = SyncDiff::GroupMeta {
            id: flag(),
            time: LogicalTime(30),
            meta: GroupMeta::titled("New"),
        };
        let older = SyncDiff::GroupMeta {
            id: flag(),
            time: LogicalTime(20),
            meta: GroupMeta::titled("Older"),
        };
        assert_eq!(apply(&store, &mut pending, &newer), Outcome::Applied);
        assert_eq!(apply(&store, &mut pending, &older), Outcome::Stale);
        assert_eq!(title(&store), "New");
    }

    #[test]
    fn backfill_overrides_a_clock_ahead_of_ours() {
        let (store, mut pending) = seeded();
        let ahead = SyncDiff::GroupMeta {
            id: flag(),
            time: LogicalTime(LogicalTime::now().0 + 60_000),
            meta: GroupMeta::titled("A2"),
        };
        assert_eq!(apply(&store, &mut pending, &ahead), Outcome::Applied);

        let mut snapshot = GroupsSnapshot::new();
        snapshot.insert(flag(), group_snapshot("A3"));
        store
            .write(|txn| {
                Applier::new(txn, &mut pending, &zod(), ApplyMode::Backfill)
                    .replace_groups(&snapshot, LogicalTime::now())
            })
            .unwrap();
        assert_eq!(title(&store), "A3");
    }

    #[test]
    fn pending_field_parks_the_diff() {
        let (store, mut pending) = seeded();
        let owner = Uuid::new_v4();
        pending.insert(PendingMutation {
            local_id: owner,
            label: "edit".into(),
            targets: vec![EntityKey::Group(flag())],
            fields: Vec::new(),
            snapshot: Snapshot::default(),
            prior_clocks: BTreeMap::new(),
            status: MutationStatus::Pending,
            patch: Arc::new(|_| Ok(())),
            on_ack: None,
            deferred: Vec::new(),
        });
        store
            .read(|db| {
                db.set_clock(
                    &EntityKey::Group(flag()),
                    fields::META,
                    &FieldClock {
                        time: LogicalTime(50),
                        pending: Some(owner),
                    },
                )
            })
            .unwrap();

        let remote = SyncDiff::GroupMeta {
            id: flag(),
            time: LogicalTime(60),
            meta: GroupMeta::titled("Remote"),
        };
        assert_eq!(apply(&store, &mut pending, &remote), Outcome::Deferred);
        assert_eq!(title(&store), "Old");
        assert_eq!(pending.get(owner).unwrap().deferred, vec![remote]);
    }

    #[test]
    fn deleted_posts_stay_deleted() {
        let (store, mut pending) = seeded();
        let add = SyncDiff::Post {
            channel: nest(),
            id: PostId(100),
            parent: None,
            time: LogicalTime(20),
            post: Some(post("~bus", 1_700_000_000_000, "hi")),
        };
        let del = SyncDiff::Post {
            channel: nest(),
            id: PostId(100),
            parent: None,
            time: LogicalTime(21),
            post: None,
        };
        apply(&store, &mut pending, &add);
        assert_eq!(apply(&store, &mut pending, &del), Outcome::Applied);
        let readd = SyncDiff::Post {
            channel: nest(),
            id: PostId(100),
            parent: None,
            time: LogicalTime(22),
            post: Some(post("~bus", 1_700_000_000_000, "hi")),
        };
        assert_eq!(apply(&store, &mut pending, &readd), Outcome::Ignored);
        assert!(store.read(|db| db.posts_for_channel(&nest(), 10)).unwrap().is_empty());
    }

    #[test]
    fn remote_echo_replaces_optimistic_post() {
        let (store, mut pending) = seeded();
        let sent = millis_to_time(1_700_000_000_000);
        let local_id = PostId::from_time(sent);
        store
            .upsert([Entity::Post(Post {
                id: local_id,
                channel_id: nest(),
                author: zod(),
                sent,
                content: Story::text("hello"),
                parent_id: None,
                reactions: BTreeMap::new(),
                reply_count: 0,
                delivery: DeliveryStatus::Pending,
                edited: false,
                deleted: false,
            })])
            .unwrap();

        let echo = SyncDiff::Post {
            channel: nest(),
            id: PostId(local_id.0 + 7),
            parent: None,
            time: LogicalTime(20),
            post: Some(post("~zod", 1_700_000_000_000, "hello")),
        };
        apply(&store, &mut pending, &echo);
        let posts = store.read(|db| db.posts_for_channel(&nest(), 10)).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, PostId(local_id.0 + 7));
        assert_eq!(posts[0].delivery, DeliveryStatus::Sent);
    }

    #[test]
    fn mentions_and_replies_produce_activity() {
        let (store, mut pending) = seeded();
        let mut mention = post("~bus", 1_700_000_000_000, "");
        mention.content = Story(vec![Verse::Inline(vec![
            Inline::Text("hey ".into()),
            Inline::Node(InlineNode::Ship(zod())),
        ])]);
        apply(
            &store,
            &mut pending,
            &SyncDiff::Post {
                channel: nest(),
                id: PostId(100),
                parent: None,
                time: LogicalTime(20),
                post: Some(mention),
            },
        );
        // Our own post, then a reply to it.
        apply(
            &store,
            &mut pending,
            &SyncDiff::Post {
                channel: nest(),
                id: PostId(200),
                parent: None,
                time: LogicalTime(21),
                post: Some(post("~zod", 1_700_000_001_000, "mine")),
            },
        );
        apply(
            &store,
            &mut pending,
            &SyncDiff::Post {
                channel: nest(),
                id: PostId(201),
                parent: Some(PostId(200)),
                time: LogicalTime(22),
                post: Some(post("~bus", 1_700_000_002_000, "re")),
            },
        );

        let events = store
            .read(|db| db.activity_since(millis_to_time(0)))
            .unwrap();
        let kinds: Vec<ActivityKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ActivityKind::Reply, ActivityKind::Mention]);
        let parent = store.read(|db| db.get_post(&nest(), PostId(200))).unwrap();
        assert_eq!(parent.reply_count, 1);
    }

    #[test]
    fn replace_posts_prunes_only_the_window() {
        let (store, mut pending) = seeded();
        for (id, sent) in [(100u128, 1_000i64), (200, 2_000), (300, 3_000)] {
            apply(
                &store,
                &mut pending,
                &SyncDiff::Post {
                    channel: nest(),
                    id: PostId(id),
                    parent: None,
                    time: LogicalTime(20),
                    post: Some(post("~bus", sent, "x")),
                },
            );
        }

        // Window starts at 200 and no longer has 300; 100 is outside it.
        let mut snapshot = PostsSnapshot {
            older: Some(PostId(100)),
            ..PostsSnapshot::default()
        };
        snapshot.posts.insert(PostId(200), post("~bus", 2_000, "x"));
        store
            .write(|txn| {
                Applier::new(txn, &mut pending, &zod(), ApplyMode::Backfill).replace_posts(
                    &nest(),
                    &snapshot,
                    LogicalTime(40),
                )
            })
            .unwrap();

        let ids: Vec<PostId> = store
            .read(|db| db.posts_for_channel(&nest(), 10))
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![PostId(100), PostId(200)]);
    }
}

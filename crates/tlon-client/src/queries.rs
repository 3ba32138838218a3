//! Live queries for the UI.
//!
//! Each query reads from the store and re-runs when a write overlaps it.
//! Queries over synced data also start that data's sync scope, and report
//! `is_loading` until the scope's first backfill lands.

use chrono::{DateTime, Utc};

use tlon_shared::{ChannelId, GroupId, PostId};
use tlon_store::{
    ActivityBucket, Channel, Cohort, Contact, EntityKey, Filter, Group, LiveQuery, Post, StoreReader,
};

use crate::sync::{Scope, SyncEngine};

#[derive(Clone)]
pub struct Queries {
    reader: StoreReader,
    sync: SyncEngine,
    post_window: u32,
}

impl Queries {
    pub fn new(reader: StoreReader, sync: SyncEngine, post_window: usize) -> Self {
        Self {
            reader,
            sync,
            post_window: u32::try_from(post_window).unwrap_or(u32::MAX),
        }
    }

    /// Joined groups by title.
    pub fn groups(&self) -> LiveQuery<Vec<Group>> {
        let loading = self.sync.ensure(Scope::Groups);
        LiveQuery::spawn(self.reader.clone(), Filter::Groups, Some(loading), |db| db.list_groups())
    }

    pub fn group(&self, id: &GroupId) -> LiveQuery<Option<Group>> {
        let loading = self.sync.ensure(Scope::Group(id.clone()));
        let id = id.clone();
        LiveQuery::spawn(
            self.reader.clone(),
            Filter::ChannelsOfGroup(id.clone()),
            Some(loading),
            move |db| db.find_group(&id),
        )
    }

    /// Channels of a group in the group's order.
    pub fn channels(&self, group: &GroupId) -> LiveQuery<Vec<Channel>> {
        let loading = self.sync.ensure(Scope::Group(group.clone()));
        let group = group.clone();
        LiveQuery::spawn(
            self.reader.clone(),
            Filter::ChannelsOfGroup(group.clone()),
            Some(loading),
            move |db| db.channels_for_group(&group),
        )
    }

    /// DMs and group DMs. They arrive with the unreads.
    pub fn direct_channels(&self) -> LiveQuery<Vec<Channel>> {
        let loading = self.sync.ensure(Scope::Unreads);
        LiveQuery::spawn(self.reader.clone(), Filter::DirectChannels, Some(loading), |db| {
            db.direct_channels()
        })
    }

    /// The newest posts of a channel, oldest first.
    pub fn posts(&self, channel: &ChannelId) -> LiveQuery<Vec<Post>> {
        let loading = self.sync.ensure(Scope::Channel(channel.clone()));
        let filter = Filter::Posts {
            channel: channel.clone(),
            limit: self.post_window,
        };
        let (channel, limit) = (channel.clone(), self.post_window);
        LiveQuery::spawn(self.reader.clone(), filter, Some(loading), move |db| {
            db.posts_for_channel(&channel, limit)
        })
    }

    pub fn thread(&self, channel: &ChannelId, parent: PostId) -> LiveQuery<Vec<Post>> {
        let loading = self.sync.ensure(Scope::Channel(channel.clone()));
        let filter = Filter::Thread {
            channel: channel.clone(),
            parent,
        };
        let channel = channel.clone();
        LiveQuery::spawn(self.reader.clone(), filter, Some(loading), move |db| {
            db.thread_replies(&channel, parent)
        })
    }

    pub fn contacts(&self) -> LiveQuery<Vec<Contact>> {
        let loading = self.sync.ensure(Scope::Contacts);
        LiveQuery::spawn(self.reader.clone(), Filter::Contacts, Some(loading), |db| db.list_contacts())
    }

    pub fn cohorts(&self) -> LiveQuery<Vec<Cohort>> {
        let loading = self.sync.ensure(Scope::Cohorts);
        LiveQuery::spawn(self.reader.clone(), Filter::Cohorts, Some(loading), |db| db.list_cohorts())
    }

    /// Activity since `since`, one bucket per channel or thread.
    pub fn activity(&self, since: DateTime<Utc>) -> LiveQuery<Vec<ActivityBucket>> {
        let loading = self.sync.ensure(Scope::Unreads);
        LiveQuery::spawn(
            self.reader.clone(),
            Filter::Activity { since },
            Some(loading),
            move |db| db.activity_buckets(since),
        )
    }

    /// Channels and posts stored before their parent. Purely local.
    pub fn orphans(&self) -> LiveQuery<Vec<EntityKey>> {
        LiveQuery::spawn(self.reader.clone(), Filter::Orphans, None, |db| db.orphans())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, Harness};
    use serde_json::json;
    use tlon_shared::protocol::{GroupDiff, GroupUpdate, Update};
    use tlon_shared::{ChannelMeta, GroupMeta, LogicalTime};
    use tlon_store::Entity;

    fn queries(h: &Harness) -> Queries {
        Queries::new(h.state.reader(), h.state.sync.clone(), 50)
    }

    #[tokio::test]
    async fn groups_query_loads_then_follows_changes() {
        let h = Harness::new(fast_config());
        h.ship.set_scry(
            "groups",
            "/v2/groups",
            json!({ "~bus/club": { "meta": { "title": "Club" } } }),
        );

        let mut groups = queries(&h).groups();
        let state = groups
            .wait_for(|s| !s.is_loading && s.data.as_ref().is_some_and(|g| !g.is_empty()))
            .await
            .unwrap();
        assert_eq!(state.data.unwrap()[0].meta.title, "Club");

        let event = Update::Group(GroupUpdate::new(
            "~bus/club".parse().unwrap(),
            LogicalTime::now(),
            GroupDiff::Meta(GroupMeta::titled("Renamed")),
        ))
        .to_event();
        h.ship.push("groups", "/v1/groups", &event.mark, event.json);
        let state = groups
            .wait_for(|s| s.data.as_ref().is_some_and(|g| g.first().is_some_and(|g| g.meta.title == "Renamed")))
            .await;
        assert!(state.is_some());
    }

    #[tokio::test]
    async fn orphans_clear_when_parent_arrives() {
        let h = Harness::new(fast_config());
        let group: GroupId = "~bus/late".parse().unwrap();
        let nest: ChannelId = "chat/~bus/general".parse().unwrap();
        h.state
            .store
            .upsert([Entity::Channel(Channel::new(nest.clone(), Some(group.clone()), ChannelMeta::default()))])
            .unwrap();

        let mut orphans = queries(&h).orphans();
        assert_eq!(orphans.current().data.unwrap(), vec![EntityKey::Channel(nest)]);

        h.state
            .store
            .upsert([Entity::Group(Group::new(group, GroupMeta::titled("Late")))])
            .unwrap();
        let state = orphans.wait_for(|s| s.data.as_ref().is_some_and(|o| o.is_empty())).await;
        assert!(state.is_some());
    }
}

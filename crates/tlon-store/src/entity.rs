//! Kind-erased entity handles used by the generic store API, change sets and
//! live-query filters.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tlon_shared::{ChannelId, GroupId, PostId, Ship};

use crate::models::{ActivityEvent, Channel, Cohort, Contact, Group, Post};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Group,
    Channel,
    Post,
    Contact,
    Cohort,
    Activity,
}

/// Stable identity of one stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKey {
    Group(GroupId),
    Channel(ChannelId),
    Post { channel: ChannelId, id: PostId },
    Contact(Ship),
    Cohort(String),
    Activity { source: String, post: PostId },
}

impl EntityKey {
    pub fn post(channel: &ChannelId, id: PostId) -> Self {
        Self::Post {
            channel: channel.clone(),
            id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Group(_) => EntityKind::Group,
            Self::Channel(_) => EntityKind::Channel,
            Self::Post { .. } => EntityKind::Post,
            Self::Contact(_) => EntityKind::Contact,
            Self::Cohort(_) => EntityKind::Cohort,
            Self::Activity { .. } => EntityKind::Activity,
        }
    }

    /// Text form used as the `field_clocks.entity_key` column.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(id) => write!(f, "group:{id}"),
            Self::Channel(id) => write!(f, "channel:{id}"),
            Self::Post { channel, id } => write!(f, "post:{channel}#{}", id.storage_key()),
            Self::Contact(ship) => write!(f, "contact:{ship}"),
            Self::Cohort(id) => write!(f, "cohort:{id}"),
            Self::Activity { source, post } => {
                write!(f, "activity:{source}#{}", post.storage_key())
            }
        }
    }
}

/// Any stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Entity {
    Group(Group),
    Channel(Channel),
    Post(Post),
    Contact(Contact),
    Cohort(Cohort),
    Activity(ActivityEvent),
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Group(g) => EntityKey::Group(g.id.clone()),
            Self::Channel(c) => EntityKey::Channel(c.id.clone()),
            Self::Post(p) => EntityKey::post(&p.channel_id, p.id),
            Self::Contact(c) => EntityKey::Contact(c.id.clone()),
            Self::Cohort(c) => EntityKey::Cohort(c.id.clone()),
            Self::Activity(a) => EntityKey::Activity {
                source: a.source.storage_key(),
                post: a.post_id,
            },
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.key().kind()
    }

    pub fn into_group(self) -> Option<Group> {
        match self {
            Self::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn into_channel(self) -> Option<Channel> {
        match self {
            Self::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_post(self) -> Option<Post> {
        match self {
            Self::Post(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_contact(self) -> Option<Contact> {
        match self {
            Self::Contact(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_cohort(self) -> Option<Cohort> {
        match self {
            Self::Cohort(c) => Some(c),
            _ => None,
        }
    }
}

/// A store query.  Results come back in the order documented per variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Joined groups, by title.
    Groups,
    /// Every known group hosted by a ship (previews included), by title.
    GroupsHostedBy(Ship),
    /// Channels of a group, in the group's channel order.
    ChannelsOfGroup(GroupId),
    /// DMs and group DMs.
    DirectChannels,
    /// The newest `limit` top-level posts of a channel, ascending by id.
    Posts { channel: ChannelId, limit: u32 },
    /// Replies to one post, ascending by id.
    Thread { channel: ChannelId, parent: PostId },
    Contacts,
    Cohorts,
    /// Activity events newer than `since`, newest first.
    Activity { since: DateTime<Utc> },
    /// Channels and posts waiting for their parent.
    Orphans,
}

impl Filter {
    /// Whether a write to `key` may change this filter's result.
    pub fn matches(&self, key: &EntityKey) -> bool {
        match (self, key) {
            (Self::Groups, EntityKey::Group(_)) => true,
            (Self::GroupsHostedBy(host), EntityKey::Group(id)) => &id.host == host,
            (Self::ChannelsOfGroup(group), EntityKey::Group(id)) => group == id,
            (Self::ChannelsOfGroup(_), EntityKey::Channel(id)) => !id.kind().is_direct(),
            (Self::DirectChannels, EntityKey::Channel(id)) => id.kind().is_direct(),
            (Self::Posts { channel, .. }, EntityKey::Post { channel: c, .. }) => channel == c,
            (Self::Thread { channel, .. }, EntityKey::Post { channel: c, .. }) => channel == c,
            (Self::Contacts, EntityKey::Contact(_)) => true,
            (Self::Cohorts, EntityKey::Cohort(_)) => true,
            (Self::Activity { .. }, EntityKey::Activity { .. }) => true,
            (Self::Activity { .. }, EntityKey::Channel(_)) => true,
            (Self::Orphans, EntityKey::Channel(_) | EntityKey::Post { .. }) => true,
            (Self::Orphans, EntityKey::Group(_)) => true,
            _ => false,
        }
    }
}

/// The keys touched by one committed write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub keys: BTreeSet<EntityKey>,
    /// Set when the whole store was wiped.
    pub reset: bool,
}

impl ChangeSet {
    pub fn reset() -> Self {
        Self {
            keys: BTreeSet::new(),
            reset: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && !self.reset
    }

    pub fn overlaps(&self, filter: &Filter) -> bool {
        self.reset || self.keys.iter().any(|k| filter.matches(k))
    }
}

/// One clocked field of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef {
    pub key: EntityKey,
    pub field: String,
}

impl FieldRef {
    pub fn new(key: EntityKey, field: impl Into<String>) -> Self {
        Self {
            key,
            field: field.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan(s: &str) -> ChannelId {
        s.parse().unwrap()
    }

    #[test]
    fn post_filter_matches_only_its_channel() {
        let filter = Filter::Posts {
            channel: chan("chat/~zod/general"),
            limit: 50,
        };
        let id = PostId(1);
        assert!(filter.matches(&EntityKey::post(&chan("chat/~zod/general"), id)));
        assert!(!filter.matches(&EntityKey::post(&chan("chat/~zod/random"), id)));
        assert!(!filter.matches(&EntityKey::Channel(chan("chat/~zod/general"))));
    }

    #[test]
    fn change_set_overlap() {
        let mut changes = ChangeSet::default();
        assert!(changes.is_empty());
        changes
            .keys
            .insert(EntityKey::Group("~zod/test".parse().unwrap()));
        assert!(changes.overlaps(&Filter::Groups));
        assert!(!changes.overlaps(&Filter::Contacts));
        assert!(ChangeSet::reset().overlaps(&Filter::Contacts));
    }

    #[test]
    fn storage_keys_are_distinct_per_kind() {
        let group = EntityKey::Group("~zod/test".parse().unwrap());
        let contact = EntityKey::Contact("~zod".parse().unwrap());
        assert_eq!(group.storage_key(), "group:~zod/test");
        assert_eq!(contact.storage_key(), "contact:~zod");
        assert_eq!(group.kind(), EntityKind::Group);
    }
}

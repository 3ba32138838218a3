//! Remote changes normalized to one diff per entity-level fact.

use std::collections::BTreeMap;

use tlon_shared::protocol::{
    CabalDiff, ChannelDelta, ChannelDiff, ChannelSnapshot, FleetDiff, GroupDiff, GroupSnapshot,
    PostSnapshot, UnreadSnapshot, Update,
};
use tlon_shared::{
    ChannelId, ChannelMeta, ContactProfile, GroupId, GroupMeta, LogicalTime, PostId, Ship,
};
use tlon_store::{EntityKey, FieldRef};

/// Names of the clocked fields.
pub mod fields {
    use tlon_shared::Ship;

    pub const META: &str = "meta";
    pub const ESSAY: &str = "essay";
    pub const UNREAD: &str = "unread";
    pub const PROFILE: &str = "profile";
    pub const TARGETS: &str = "targets";

    pub fn react(ship: &Ship) -> String {
        format!("react/{ship}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncDiff {
    /// Full group state (creation, or one group of a snapshot).
    Group { id: GroupId, time: LogicalTime, snapshot: GroupSnapshot },
    GroupMeta { id: GroupId, time: LogicalTime, meta: GroupMeta },
    GroupRemoved { id: GroupId, time: LogicalTime },
    ChannelAdded { group: GroupId, id: ChannelId, time: LogicalTime, snapshot: ChannelSnapshot },
    ChannelMeta { id: ChannelId, time: LogicalTime, meta: ChannelMeta },
    ChannelRemoved { group: GroupId, id: ChannelId, time: LogicalTime },
    Members { group: GroupId, ships: Vec<Ship>, diff: FleetDiff },
    Role { group: GroupId, sect: String, diff: CabalDiff },
    ChannelOrder { group: GroupId, order: Vec<ChannelId> },
    /// A post or reply; `post: None` deletes it.
    Post {
        channel: ChannelId,
        id: PostId,
        parent: Option<PostId>,
        time: LogicalTime,
        post: Option<PostSnapshot>,
    },
    Reactions { channel: ChannelId, id: PostId, time: LogicalTime, reacts: BTreeMap<Ship, String> },
    Unread { channel: ChannelId, time: LogicalTime, unread: UnreadSnapshot },
    Contact { ship: Ship, time: LogicalTime, profile: Option<ContactProfile> },
    Cohort { id: String, time: LogicalTime, targets: Option<Vec<Ship>> },
}

impl SyncDiff {
    /// Split a decoded subscription event. Updates without their own time
    /// are stamped with `received`.
    pub fn from_update(update: Update, received: LogicalTime) -> Vec<SyncDiff> {
        match update {
            Update::Group(u) => {
                let id = u.flag;
                let time = u.update.time;
                let diff = match u.update.diff {
                    GroupDiff::Create(snapshot) => SyncDiff::Group { id, time, snapshot },
                    GroupDiff::Meta(meta) => SyncDiff::GroupMeta { id, time, meta },
                    GroupDiff::Del(_) => SyncDiff::GroupRemoved { id, time },
                    GroupDiff::Channel { nest, diff } => match diff {
                        ChannelDiff::Add(snapshot) => SyncDiff::ChannelAdded {
                            group: id,
                            id: nest,
                            time,
                            snapshot,
                        },
                        ChannelDiff::Edit(meta) => SyncDiff::ChannelMeta { id: nest, time, meta },
                        ChannelDiff::Del(_) => SyncDiff::ChannelRemoved {
                            group: id,
                            id: nest,
                            time,
                        },
                    },
                    GroupDiff::Fleet { ships, diff } => SyncDiff::Members { group: id, ships, diff },
                    GroupDiff::Cabal { sect, diff } => SyncDiff::Role { group: id, sect, diff },
                    GroupDiff::Order(order) => SyncDiff::ChannelOrder { group: id, order },
                };
                vec![diff]
            }
            Update::Channel(r) => {
                let channel = r.nest;
                let time = r.time;
                let diff = match r.response {
                    ChannelDelta::Post { id, post } => SyncDiff::Post {
                        channel,
                        id,
                        parent: None,
                        time,
                        post,
                    },
                    ChannelDelta::Reply { parent, id, reply } => SyncDiff::Post {
                        channel,
                        id,
                        parent: Some(parent),
                        time,
                        post: reply,
                    },
                    ChannelDelta::Reacts { id, reacts } => SyncDiff::Reactions {
                        channel,
                        id,
                        time,
                        reacts,
                    },
                    ChannelDelta::Meta(meta) => SyncDiff::ChannelMeta { id: channel, time, meta },
                };
                vec![diff]
            }
            Update::Activity(a) => vec![SyncDiff::Unread {
                channel: a.channel,
                time: received,
                unread: a.unread,
            }],
            Update::Contact(c) => vec![SyncDiff::Contact {
                ship: c.ship,
                time: c.time,
                profile: c.contact,
            }],
            Update::Broadcaster(b) => vec![SyncDiff::Cohort {
                id: b.cohort,
                time: received,
                targets: b.targets,
            }],
        }
    }

    pub fn time(&self) -> Option<LogicalTime> {
        match self {
            Self::Group { time, .. }
            | Self::GroupMeta { time, .. }
            | Self::GroupRemoved { time, .. }
            | Self::ChannelAdded { time, .. }
            | Self::ChannelMeta { time, .. }
            | Self::ChannelRemoved { time, .. }
            | Self::Post { time, .. }
            | Self::Reactions { time, .. }
            | Self::Unread { time, .. }
            | Self::Contact { time, .. }
            | Self::Cohort { time, .. } => Some(*time),
            Self::Members { .. } | Self::Role { .. } | Self::ChannelOrder { .. } => None,
        }
    }

    /// The single clocked field this diff writes, if any. `Group`,
    /// `ChannelAdded` and `Reactions` gate their fields individually.
    pub fn field(&self) -> Option<FieldRef> {
        let (key, field) = match self {
            Self::GroupMeta { id, .. } | Self::GroupRemoved { id, .. } => {
                (EntityKey::Group(id.clone()), fields::META)
            }
            Self::ChannelMeta { id, .. } | Self::ChannelRemoved { id, .. } => {
                (EntityKey::Channel(id.clone()), fields::META)
            }
            Self::Post { channel, id, .. } => (EntityKey::post(channel, *id), fields::ESSAY),
            Self::Unread { channel, .. } => (EntityKey::Channel(channel.clone()), fields::UNREAD),
            Self::Contact { ship, .. } => (EntityKey::Contact(ship.clone()), fields::PROFILE),
            Self::Cohort { id, .. } => (EntityKey::Cohort(id.clone()), fields::TARGETS),
            Self::Group { .. }
            | Self::ChannelAdded { .. }
            | Self::Reactions { .. }
            | Self::Members { .. }
            | Self::Role { .. }
            | Self::ChannelOrder { .. } => return None,
        };
        Some(FieldRef::new(key, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlon_shared::protocol::{ChannelResponse, GroupUpdate};

    #[test]
    fn channel_edits_inside_group_updates_become_channel_diffs() {
        let flag: GroupId = "~zod/test".parse().unwrap();
        let nest: ChannelId = "chat/~zod/general".parse().unwrap();
        let update = Update::Group(GroupUpdate::new(
            flag,
            LogicalTime(3),
            GroupDiff::Channel {
                nest: nest.clone(),
                diff: ChannelDiff::Edit(ChannelMeta {
                    title: "Lobby".into(),
                    description: String::new(),
                }),
            },
        ));
        let diffs = SyncDiff::from_update(update, LogicalTime(99));
        assert_eq!(diffs.len(), 1);
        assert_eq!(
            diffs[0].field(),
            Some(FieldRef::new(EntityKey::Channel(nest), fields::META))
        );
    }

    #[test]
    fn replies_keep_their_parent() {
        let nest: ChannelId = "chat/~zod/general".parse().unwrap();
        let update = Update::Channel(ChannelResponse {
            nest,
            time: LogicalTime(5),
            response: ChannelDelta::Reply {
                parent: PostId(10),
                id: PostId(11),
                reply: None,
            },
        });
        match &SyncDiff::from_update(update, LogicalTime(0))[0] {
            SyncDiff::Post { parent, id, post, .. } => {
                assert_eq!(*parent, Some(PostId(10)));
                assert_eq!(*id, PostId(11));
                assert!(post.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

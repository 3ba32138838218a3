//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tlon_shared::{
    ChannelId, ChannelKind, ChannelMeta, ContactProfile, GroupId, GroupMeta, PostId, Privacy,
    RoleMeta, Ship, Story,
};

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A group: metadata, ordered channel list, roster and roles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub meta: GroupMeta,
    pub privacy: Privacy,
    /// Channel ids in display order. Non-owning back-references.
    pub channel_order: Vec<ChannelId>,
    pub members: Vec<Member>,
    pub roles: BTreeMap<String, RoleMeta>,
    /// Whether the current user has joined (false for previews).
    pub joined: bool,
}

impl Group {
    pub fn new(id: GroupId, meta: GroupMeta) -> Self {
        Self {
            id,
            meta,
            privacy: Privacy::default(),
            channel_order: Vec::new(),
            members: Vec::new(),
            roles: BTreeMap::new(),
            joined: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub ship: Ship,
    pub roles: Vec<String>,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A conversation channel: a group channel, DM or group DM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub kind: ChannelKind,
    /// Parent group; `None` for DMs and group DMs.
    pub group_id: Option<GroupId>,
    pub meta: ChannelMeta,
    /// Roles allowed to post. Empty means everyone.
    pub writers: Vec<String>,
    pub unread: Unread,
}

impl Channel {
    pub fn new(id: ChannelId, group_id: Option<GroupId>, meta: ChannelMeta) -> Self {
        Self {
            kind: id.kind(),
            id,
            group_id,
            meta,
            writers: Vec::new(),
            unread: Unread::default(),
        }
    }
}

/// Unread cursor for a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Unread {
    pub count: u32,
    pub last_read: Option<PostId>,
}

// ---------------------------------------------------------------------------
// Post
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Written optimistically, not yet acknowledged.
    Pending,
    Sent,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "pending" {
            Self::Pending
        } else {
            Self::Sent
        }
    }
}

/// A post or reply.  Edits and deletes produce new versions under the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub channel_id: ChannelId,
    pub author: Ship,
    /// When the author sent it. Together with `author`, identifies an
    /// optimistic post before the ship assigns its id.
    pub sent: DateTime<Utc>,
    pub content: Story,
    pub parent_id: Option<PostId>,
    pub reactions: BTreeMap<Ship, String>,
    pub reply_count: u32,
    pub delivery: DeliveryStatus,
    pub edited: bool,
    /// Tombstone: deleted posts stay so stale re-adds are ignored.
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: Ship,
    pub nickname: String,
    pub avatar: String,
    pub bio: String,
    pub color: String,
    pub pinned_groups: Vec<GroupId>,
}

impl Contact {
    pub fn from_profile(id: Ship, profile: ContactProfile) -> Self {
        Self {
            id,
            nickname: profile.nickname,
            avatar: profile.avatar,
            bio: profile.bio,
            color: profile.color,
            pinned_groups: profile.groups,
        }
    }

    pub fn to_profile(&self) -> ContactProfile {
        ContactProfile {
            nickname: self.nickname.clone(),
            avatar: self.avatar.clone(),
            bio: self.bio.clone(),
            color: self.color.clone(),
            groups: self.pinned_groups.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cohort (broadcast list)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cohort {
    pub id: String,
    pub targets: Vec<Ship>,
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// Where an activity event happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum ActivitySource {
    Channel(ChannelId),
    Thread { channel: ChannelId, parent: PostId },
}

impl ActivitySource {
    pub fn channel(&self) -> &ChannelId {
        match self {
            Self::Channel(c) | Self::Thread { channel: c, .. } => c,
        }
    }

    /// Stable text key (`chat/~zod/general` or `chat/~zod/general/<parent>`).
    pub fn storage_key(&self) -> String {
        match self {
            Self::Channel(c) => c.to_string(),
            Self::Thread { channel, parent } => format!("{channel}/{}", parent.storage_key()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Post,
    Reply,
    Mention,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Reply => "reply",
            Self::Mention => "mention",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "reply" => Self::Reply,
            "mention" => Self::Mention,
            _ => Self::Post,
        }
    }
}

/// Derived, read-only notification record for one post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub source: ActivitySource,
    pub post_id: PostId,
    pub author: Ship,
    pub kind: ActivityKind,
    pub group_id: Option<GroupId>,
    pub time: DateTime<Utc>,
    pub preview: String,
}

/// Activity events of one source within a time window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityBucket {
    pub source: ActivitySource,
    pub newest: ActivityEvent,
    /// Every event of the window, newest first.
    pub all: Vec<ActivityEvent>,
    /// Newer than the channel's read cursor.
    pub unread: bool,
}

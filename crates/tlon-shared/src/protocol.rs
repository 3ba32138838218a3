//! Wire protocol spoken with the ship's agents.
//!
//! Writes are pokes (`{app, mark, json}`) answered by an ack or a nack.
//! Reads are scries returning a JSON snapshot. Subscriptions push events of
//! the same `{app, mark, json}` shape. The typed actions below serialize to
//! the JSON bodies the agents expect; the typed updates and snapshots
//! deserialize what they send back.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::*;
use crate::error::ProtocolError;
use crate::meta::{ChannelMeta, ContactProfile, GroupMeta, Privacy, RoleMeta};
use crate::story::{Nil, Story};
use crate::types::{ChannelId, ChannelKind, GroupId, LogicalTime, PostId, Ship};

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// A write request addressed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poke {
    pub app: String,
    pub mark: String,
    pub json: Value,
}

impl Poke {
    pub fn new(app: &str, mark: &str, json: Value) -> Self {
        Self {
            app: app.to_string(),
            mark: mark.to_string(),
            json,
        }
    }
}

/// One event delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipEvent {
    pub app: String,
    pub mark: String,
    pub json: Value,
}

fn to_json<T: Serialize>(value: &T) -> Value {
    // Serializing these plain data types cannot fail: all map keys are strings.
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Group actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCreate {
    pub name: String,
    pub title: String,
    pub description: String,
    pub image: String,
    pub cover: String,
    pub privacy: Privacy,
    /// Initial members and their roles.
    pub members: BTreeMap<Ship, Vec<String>>,
}

impl GroupCreate {
    pub fn to_poke(&self) -> Poke {
        Poke::new(APP_GROUPS, MARK_GROUP_CREATE, to_json(self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timed<T> {
    pub time: LogicalTime,
    pub diff: T,
}

/// A group diff addressed to a flag. Pokes and subscription updates share
/// this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupUpdate {
    pub flag: GroupId,
    pub update: Timed<GroupDiff>,
}

impl GroupUpdate {
    pub fn new(flag: GroupId, time: LogicalTime, diff: GroupDiff) -> Self {
        Self {
            flag,
            update: Timed { time, diff },
        }
    }

    pub fn to_poke(&self) -> Poke {
        Poke::new(APP_GROUPS, MARK_GROUP_ACTION, to_json(self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupDiff {
    Create(GroupSnapshot),
    Meta(GroupMeta),
    Del(Nil),
    Channel { nest: ChannelId, diff: ChannelDiff },
    Fleet { ships: Vec<Ship>, diff: FleetDiff },
    Cabal { sect: String, diff: CabalDiff },
    Order(Vec<ChannelId>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelDiff {
    Add(ChannelSnapshot),
    Edit(ChannelMeta),
    Del(Nil),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FleetDiff {
    Add(Nil),
    Del(Nil),
    AddSects(Vec<String>),
    DelSects(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CabalDiff {
    Add(RoleMeta),
    Del(Nil),
}

pub fn leave_group_poke(flag: &GroupId) -> Poke {
    Poke::new(APP_GROUPS, "group-leave", json!(flag.to_string()))
}

// ---------------------------------------------------------------------------
// Channel actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCreate {
    pub kind: ChannelKind,
    pub group: GroupId,
    pub name: String,
    pub title: String,
    pub description: String,
    pub readers: Vec<String>,
    pub writers: Vec<String>,
}

impl ChannelCreate {
    pub fn to_poke(&self) -> Poke {
        Poke::new(APP_CHANNELS, MARK_CHANNEL_ACTION, json!({ "create": to_json(self) }))
    }
}

/// Post content as sent by the author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Essay {
    pub content: Story,
    pub author: Ship,
    /// Milliseconds since the Unix epoch.
    pub sent: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PostAction {
    Add(Essay),
    Edit { id: PostId, essay: Essay },
    Del(PostId),
    AddReact { id: PostId, ship: Ship, react: String },
    DelReact { id: PostId, ship: Ship },
    Reply { id: PostId, action: ReplyAction },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyAction {
    Add(Essay),
    Del(PostId),
    AddReact { id: PostId, ship: Ship, react: String },
    DelReact { id: PostId, ship: Ship },
}

/// Route a post action to the agent owning the channel.
pub fn post_poke(channel: &ChannelId, action: &PostAction) -> Poke {
    match channel.kind() {
        ChannelKind::Dm => Poke::new(
            APP_CHAT,
            MARK_DM_ACTION,
            json!({ "ship": channel.as_str(), "action": to_json(action) }),
        ),
        ChannelKind::GroupDm => Poke::new(
            APP_CHAT,
            MARK_CLUB_ACTION,
            json!({ "id": channel.as_str(), "action": to_json(action) }),
        ),
        ChannelKind::Chat | ChannelKind::Notebook | ChannelKind::Gallery => Poke::new(
            APP_CHANNELS,
            MARK_CHANNEL_ACTION,
            json!({ "channel": { "nest": channel.as_str(), "action": { "post": to_json(action) } } }),
        ),
    }
}

// ---------------------------------------------------------------------------
// Activity, contacts, broadcaster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityAction {
    Read {
        channel: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<PostId>,
    },
}

impl ActivityAction {
    pub fn to_poke(&self) -> Poke {
        Poke::new(APP_ACTIVITY, MARK_ACTIVITY_ACTION, to_json(self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContactAction {
    #[serde(rename = "self")]
    Profile(ContactProfile),
}

impl ContactAction {
    pub fn to_poke(&self) -> Poke {
        Poke::new(APP_CONTACTS, MARK_CONTACT_ACTION, to_json(self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastAction {
    AddCohort { cohort: String, targets: Vec<Ship> },
    DelCohort { cohort: String, targets: Vec<Ship> },
}

impl BroadcastAction {
    pub fn to_poke(&self) -> Poke {
        Poke::new(APP_BROADCASTER, MARK_BROADCASTER_ACTION, to_json(self))
    }
}

// ---------------------------------------------------------------------------
// Snapshots (scry results)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub meta: GroupMeta,
    #[serde(default)]
    pub privacy: Privacy,
    #[serde(default)]
    pub channels: BTreeMap<ChannelId, ChannelSnapshot>,
    #[serde(default)]
    pub order: Vec<ChannelId>,
    #[serde(default)]
    pub fleet: BTreeMap<Ship, Vessel>,
    #[serde(default)]
    pub cabals: BTreeMap<String, RoleMeta>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Vessel {
    #[serde(default)]
    pub sects: Vec<String>,
    #[serde(default)]
    pub joined: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub meta: ChannelMeta,
    #[serde(default)]
    pub writers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostSnapshot {
    pub author: Ship,
    pub sent: i64,
    pub content: Story,
    #[serde(default)]
    pub reacts: BTreeMap<Ship, String>,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(default)]
    pub edited: bool,
}

/// A window of a channel's posts, newest first in the ship's paging.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PostsSnapshot {
    #[serde(default)]
    pub posts: BTreeMap<PostId, PostSnapshot>,
    /// Replies keyed by parent id.
    #[serde(default)]
    pub replies: BTreeMap<PostId, BTreeMap<PostId, PostSnapshot>>,
    /// Set when older posts exist beyond this window.
    #[serde(default)]
    pub older: Option<PostId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnreadSnapshot {
    pub count: u32,
    #[serde(default)]
    pub last_read: Option<PostId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPreview {
    pub meta: GroupMeta,
    #[serde(default)]
    pub privacy: Privacy,
    #[serde(default)]
    pub member_count: u32,
}

pub type GroupsSnapshot = BTreeMap<GroupId, GroupSnapshot>;
pub type UnreadsSnapshot = BTreeMap<ChannelId, UnreadSnapshot>;
pub type ContactsSnapshot = BTreeMap<Ship, ContactProfile>;
pub type CohortsSnapshot = BTreeMap<String, Vec<Ship>>;
pub type GroupPreviews = BTreeMap<GroupId, GroupPreview>;

pub fn decode_snapshot<T: DeserializeOwned>(what: &'static str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { what, source })
}

// ---------------------------------------------------------------------------
// Updates (subscription events)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResponse {
    pub nest: ChannelId,
    pub time: LogicalTime,
    pub response: ChannelDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelDelta {
    /// `None` means the post was deleted.
    Post { id: PostId, post: Option<PostSnapshot> },
    Reacts { id: PostId, reacts: BTreeMap<Ship, String> },
    Reply { parent: PostId, id: PostId, reply: Option<PostSnapshot> },
    Meta(ChannelMeta),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityUpdate {
    pub channel: ChannelId,
    pub unread: UnreadSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactUpdate {
    pub ship: Ship,
    pub time: LogicalTime,
    /// `None` when the contact was dropped.
    pub contact: Option<ContactProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcasterUpdate {
    pub cohort: String,
    /// `None` when the cohort was deleted.
    pub targets: Option<Vec<Ship>>,
}

/// A decoded subscription event.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Group(GroupUpdate),
    Channel(ChannelResponse),
    Activity(ActivityUpdate),
    Contact(ContactUpdate),
    Broadcaster(BroadcasterUpdate),
}

impl Update {
    /// Encode as the event an agent would emit; used by in-memory ships.
    pub fn to_event(&self) -> ShipEvent {
        let (app, mark, json) = match self {
            Update::Group(u) => (APP_GROUPS, MARK_GROUP_UPDATE, to_json(u)),
            Update::Channel(u) if u.nest.kind().is_direct() => {
                (APP_CHAT, MARK_WRIT_RESPONSE, to_json(u))
            }
            Update::Channel(u) => (APP_CHANNELS, MARK_CHANNEL_RESPONSE, to_json(u)),
            Update::Activity(u) => (APP_ACTIVITY, MARK_ACTIVITY_UPDATE, to_json(u)),
            Update::Contact(u) => (APP_CONTACTS, MARK_CONTACT_RESPONSE, to_json(u)),
            Update::Broadcaster(u) => (APP_BROADCASTER, MARK_BROADCASTER_UPDATE, to_json(u)),
        };
        ShipEvent {
            app: app.to_string(),
            mark: mark.to_string(),
            json,
        }
    }
}

/// Decode a subscription event by its mark.
pub fn decode_event(event: &ShipEvent) -> Result<Update, ProtocolError> {
    let json = event.json.clone();
    match event.mark.as_str() {
        MARK_GROUP_UPDATE => decode_snapshot("group-update", json).map(Update::Group),
        MARK_CHANNEL_RESPONSE | MARK_WRIT_RESPONSE => {
            decode_snapshot("channel-response", json).map(Update::Channel)
        }
        MARK_ACTIVITY_UPDATE => decode_snapshot("activity-update", json).map(Update::Activity),
        MARK_CONTACT_RESPONSE => decode_snapshot("contact-response", json).map(Update::Contact),
        MARK_BROADCASTER_UPDATE => {
            decode_snapshot("broadcaster-update", json).map(Update::Broadcaster)
        }
        _ => Err(ProtocolError::UnknownMark {
            app: event.app.clone(),
            mark: event.mark.clone(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Scry and subscription paths, as `(app, path)` pairs.
pub mod paths {
    use super::*;

    pub fn groups_scry() -> (&'static str, String) {
        (APP_GROUPS, "/v2/groups".to_string())
    }

    pub fn groups_watch() -> (&'static str, String) {
        (APP_GROUPS, "/v1/groups".to_string())
    }

    pub fn group_scry(flag: &GroupId) -> (&'static str, String) {
        (APP_GROUPS, format!("/v2/groups/{flag}"))
    }

    pub fn group_watch(flag: &GroupId) -> (&'static str, String) {
        (APP_GROUPS, format!("/v1/groups/{flag}"))
    }

    pub fn hosted_by_scry(host: &Ship) -> (&'static str, String) {
        (APP_GROUPS, format!("/v1/hosted/{host}"))
    }

    pub fn posts_scry(channel: &ChannelId, window: usize) -> (&'static str, String) {
        if channel.kind().is_direct() {
            (APP_CHAT, format!("/v3/{channel}/writs/newest/{window}"))
        } else {
            (APP_CHANNELS, format!("/v2/{channel}/posts/newest/{window}"))
        }
    }

    pub fn posts_watch(channel: &ChannelId) -> (&'static str, String) {
        if channel.kind().is_direct() {
            (APP_CHAT, format!("/v3/{channel}"))
        } else {
            (APP_CHANNELS, format!("/v2/{channel}"))
        }
    }

    pub fn unreads_scry() -> (&'static str, String) {
        (APP_ACTIVITY, "/v4/unreads".to_string())
    }

    pub fn unreads_watch() -> (&'static str, String) {
        (APP_ACTIVITY, "/v4/unreads".to_string())
    }

    pub fn contacts_scry() -> (&'static str, String) {
        (APP_CONTACTS, "/v1/book".to_string())
    }

    pub fn contacts_watch() -> (&'static str, String) {
        (APP_CONTACTS, "/v1/news".to_string())
    }

    pub fn cohorts_scry() -> (&'static str, String) {
        (APP_BROADCASTER, "/v0/cohorts".to_string())
    }

    pub fn cohorts_watch() -> (&'static str, String) {
        (APP_BROADCASTER, "/v0/cohorts".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_action_matches_agent_shape() {
        let action = BroadcastAction::AddCohort {
            cohort: "~zod/cohort1".to_string(),
            targets: vec!["~bob".parse().unwrap()],
        };
        let poke = action.to_poke();
        assert_eq!(poke.app, "broadcaster");
        assert_eq!(poke.mark, "broadcaster-action");
        assert_eq!(
            poke.json,
            json!({"add-cohort": {"cohort": "~zod/cohort1", "targets": ["~bob"]}})
        );
    }

    #[test]
    fn group_meta_update_shape() {
        let flag: GroupId = "~zod/test".parse().unwrap();
        let update = GroupUpdate::new(flag, LogicalTime(5), GroupDiff::Meta(GroupMeta::titled("New")));
        let poke = update.to_poke();
        assert_eq!(poke.mark, MARK_GROUP_ACTION);
        assert_eq!(poke.json["flag"], "~zod/test");
        assert_eq!(poke.json["update"]["time"], 5);
        assert_eq!(poke.json["update"]["diff"]["meta"]["title"], "New");
    }

    #[test]
    fn post_actions_route_by_channel_kind() {
        let essay = Essay {
            content: Story::text("hi"),
            author: "~zod".parse().unwrap(),
            sent: 1,
        };
        let action = PostAction::Add(essay);

        let dm: ChannelId = "~bus".parse().unwrap();
        assert_eq!(post_poke(&dm, &action).mark, MARK_DM_ACTION);

        let nest: ChannelId = "chat/~zod/general".parse().unwrap();
        let poke = post_poke(&nest, &action);
        assert_eq!(poke.app, APP_CHANNELS);
        assert_eq!(poke.json["channel"]["nest"], "chat/~zod/general");
        assert!(poke.json["channel"]["action"]["post"]["add"].is_object());
    }

    #[test]
    fn decodes_events_through_their_own_encoding() {
        let update = Update::Broadcaster(BroadcasterUpdate {
            cohort: "~zod/c".to_string(),
            targets: None,
        });
        let event = update.to_event();
        assert_eq!(decode_event(&event).unwrap(), update);
    }

    #[test]
    fn unknown_mark_is_an_error() {
        let event = ShipEvent {
            app: "groups".to_string(),
            mark: "mystery".to_string(),
            json: Value::Null,
        };
        assert!(matches!(
            decode_event(&event),
            Err(ProtocolError::UnknownMark { .. })
        ));
    }
}

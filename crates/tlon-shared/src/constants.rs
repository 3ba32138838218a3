/// Desk the client's agents live on.
pub const DESK: &str = "groups";

/// Agent names.
pub const APP_GROUPS: &str = "groups";
pub const APP_CHANNELS: &str = "channels";
pub const APP_CHAT: &str = "chat";
pub const APP_ACTIVITY: &str = "activity";
pub const APP_CONTACTS: &str = "contacts";
pub const APP_BROADCASTER: &str = "broadcaster";

/// Poke marks.
pub const MARK_GROUP_CREATE: &str = "group-create";
pub const MARK_GROUP_ACTION: &str = "group-action-4";
pub const MARK_CHANNEL_ACTION: &str = "channel-action-1";
pub const MARK_DM_ACTION: &str = "chat-dm-action-1";
pub const MARK_CLUB_ACTION: &str = "chat-club-action-1";
pub const MARK_ACTIVITY_ACTION: &str = "activity-action";
pub const MARK_CONTACT_ACTION: &str = "contact-action-1";
pub const MARK_BROADCASTER_ACTION: &str = "broadcaster-action";

/// Subscription update marks.
pub const MARK_GROUP_UPDATE: &str = "group-update";
pub const MARK_CHANNEL_RESPONSE: &str = "channel-response";
pub const MARK_WRIT_RESPONSE: &str = "writ-response";
pub const MARK_ACTIVITY_UPDATE: &str = "activity-update";
pub const MARK_CONTACT_RESPONSE: &str = "contact-response-0";
pub const MARK_BROADCASTER_UPDATE: &str = "broadcaster-update";

/// Title and short name of the channel created alongside every new group.
pub const DEFAULT_CHANNEL_NAME: &str = "general";
pub const DEFAULT_CHANNEL_TITLE: &str = "General";

/// The one message users see when a composite action fails.
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong";

/// Default page size for channel backfills.
pub const DEFAULT_POST_WINDOW: usize = 50;

/// Pokes without an ack after this long are treated as rejected.
pub const DEFAULT_POKE_TIMEOUT_MS: u64 = 15_000;

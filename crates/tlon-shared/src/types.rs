//! Identifiers used across the client.
//!
//! Every id has a canonical string form that is also its wire and storage
//! form, so ids stay stable and collision-free across resyncs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdError;

// ---------------------------------------------------------------------------
// Ship
// ---------------------------------------------------------------------------

/// An Urbit identity such as `~zod` or `~sampel-palnet`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ship(String);

impl Ship {
    /// The galaxy `~zod`, the conventional development ship.
    pub fn zod() -> Self {
        Self("~zod".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name without the leading sig, as eyre expects it (`zod`).
    pub fn without_sig(&self) -> &str {
        &self.0[1..]
    }
}

impl FromStr for Ship {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let body = s
            .strip_prefix('~')
            .ok_or_else(|| IdError::InvalidShip(s.to_string()))?;
        let valid = !body.is_empty()
            && !body.starts_with('-')
            && !body.ends_with('-')
            && body.chars().all(|c| c.is_ascii_lowercase() || c == '-');
        if !valid {
            return Err(IdError::InvalidShip(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Ship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// GroupId
// ---------------------------------------------------------------------------

/// A group "flag": host ship plus short name, rendered `~host/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId {
    pub host: Ship,
    pub name: String,
}

impl GroupId {
    pub fn new(host: Ship, name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if !is_term(&name) {
            return Err(IdError::InvalidTerm(name));
        }
        Ok(Self { host, name })
    }
}

impl FromStr for GroupId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, name) = s
            .split_once('/')
            .ok_or_else(|| IdError::InvalidGroup(s.to_string()))?;
        let host = host.parse().map_err(|_| IdError::InvalidGroup(s.to_string()))?;
        Self::new(host, name)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.name)
    }
}

/// Urbit `@tas`: lowercase letters, digits and hyphens, starting with a letter.
pub fn is_term(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelKind {
    Chat,
    Notebook,
    Gallery,
    Dm,
    GroupDm,
}

impl ChannelKind {
    /// Prefix used in a group channel's nest (`chat/~zod/general`).
    pub fn nest_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Chat => Some("chat"),
            Self::Notebook => Some("diary"),
            Self::Gallery => Some("heap"),
            Self::Dm | Self::GroupDm => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Notebook => "notebook",
            Self::Gallery => "gallery",
            Self::Dm => "dm",
            Self::GroupDm => "groupDm",
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Dm | Self::GroupDm)
    }
}

impl FromStr for ChannelKind {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "notebook" | "diary" => Ok(Self::Notebook),
            "gallery" | "heap" => Ok(Self::Gallery),
            "dm" => Ok(Self::Dm),
            "groupDm" => Ok(Self::GroupDm),
            other => Err(IdError::InvalidChannel(other.to_string())),
        }
    }
}

/// A channel identifier.
///
/// - group channels: `chat/~zod/general` (kind prefix, host, name)
/// - direct messages: the counterpart ship, `~bus`
/// - group DMs ("clubs"): a `0v`-prefixed club id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn nest(kind: ChannelKind, host: &Ship, name: &str) -> Result<Self, IdError> {
        let prefix = kind
            .nest_prefix()
            .ok_or_else(|| IdError::InvalidChannel(format!("{} has no nest", kind.as_str())))?;
        if !is_term(name) {
            return Err(IdError::InvalidTerm(name.to_string()));
        }
        Ok(Self(format!("{prefix}/{host}/{name}")))
    }

    pub fn dm(ship: &Ship) -> Self {
        Self(ship.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> ChannelKind {
        if self.0.starts_with('~') {
            ChannelKind::Dm
        } else if self.0.starts_with("0v") {
            ChannelKind::GroupDm
        } else {
            // Validated at construction.
            let prefix = self.0.split('/').next().unwrap_or_default();
            prefix.parse().unwrap_or(ChannelKind::Chat)
        }
    }

    /// Host ship of a group channel; the counterpart for a DM.
    pub fn host(&self) -> Option<Ship> {
        match self.kind() {
            ChannelKind::Dm => self.0.parse().ok(),
            ChannelKind::GroupDm => None,
            _ => self.0.split('/').nth(1).and_then(|s| s.parse().ok()),
        }
    }
}

impl FromStr for ChannelId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('~') {
            let ship: Ship = s.parse()?;
            return Ok(Self::dm(&ship));
        }
        if let Some(rest) = s.strip_prefix("0v") {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
                return Ok(Self(s.to_string()));
            }
            return Err(IdError::InvalidChannel(s.to_string()));
        }
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(prefix), Some(host), Some(name)) => {
                let kind: ChannelKind = prefix.parse()?;
                let host: Ship = host.parse()?;
                Self::nest(kind, &host, name)
            }
            _ => Err(IdError::InvalidChannel(s.to_string())),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// PostId (@da)
// ---------------------------------------------------------------------------

/// `@da` of the Unix epoch.
const DA_UNIX_EPOCH: u128 = 170_141_184_475_152_167_957_503_069_145_530_368_000;
/// One second in `@da` units.
const DA_SECOND: u128 = 1 << 64;
/// Width of the zero-padded storage form (u128::MAX has 39 digits).
const STORAGE_WIDTH: usize = 39;

/// A post identifier: an Urbit `@da` timestamp, so ids sort by time.
///
/// Rendered as dotted decimal (`170.141.184.506...`) like Urbit's `@ud`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostId(pub u128);

impl PostId {
    pub fn from_time(time: DateTime<Utc>) -> Self {
        let secs = time.timestamp().max(0) as u128;
        let frac = (time.timestamp_subsec_nanos() as u128 * DA_SECOND) / 1_000_000_000;
        Self(DA_UNIX_EPOCH + secs * DA_SECOND + frac)
    }

    pub fn to_time(&self) -> DateTime<Utc> {
        let since = self.0.saturating_sub(DA_UNIX_EPOCH);
        let secs = (since / DA_SECOND) as i64;
        let nanos = ((since % DA_SECOND) * 1_000_000_000 / DA_SECOND) as u32;
        Utc.timestamp_opt(secs, nanos)
            .single()
            .unwrap_or_default()
    }

    /// Zero-padded decimal; lexicographic order equals numeric order.
    pub fn storage_key(&self) -> String {
        format!("{:0width$}", self.0, width = STORAGE_WIDTH)
    }

    pub fn from_storage_key(s: &str) -> Result<Self, IdError> {
        s.parse::<u128>()
            .map(Self)
            .map_err(|_| IdError::InvalidPost(s.to_string()))
    }
}

impl FromStr for PostId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != '.').collect();
        if digits.is_empty() {
            return Err(IdError::InvalidPost(s.to_string()));
        }
        digits
            .parse::<u128>()
            .map(Self)
            .map_err(|_| IdError::InvalidPost(s.to_string()))
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.0.to_string();
        let head = raw.len() % 3;
        let mut out = String::with_capacity(raw.len() + raw.len() / 3);
        for (i, c) in raw.chars().enumerate() {
            if i != 0 && (i + 3 - head) % 3 == 0 {
                out.push('.');
            }
            out.push(c);
        }
        f.write_str(&out)
    }
}

// ---------------------------------------------------------------------------
// LogicalTime
// ---------------------------------------------------------------------------

/// Millisecond logical time used for last-writer-wins resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTime(pub i64);

impl LogicalTime {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Now, but strictly after `prev` so local writes always advance.
    pub fn after(prev: Option<LogicalTime>) -> Self {
        let now = Self::now();
        match prev {
            Some(p) if p >= now => Self(p.0 + 1),
            _ => now,
        }
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// serde: every id travels as its string form
// ---------------------------------------------------------------------------

macro_rules! string_serde {
    ($($ty:ty),*) => {$(
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    )*};
}

string_serde!(Ship, GroupId, ChannelId, PostId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ship_validation() {
        assert!("~zod".parse::<Ship>().is_ok());
        assert!("~sampel-palnet".parse::<Ship>().is_ok());
        assert!("zod".parse::<Ship>().is_err());
        assert!("~Zod".parse::<Ship>().is_err());
        assert!("~".parse::<Ship>().is_err());
    }

    #[test]
    fn group_id_round_trip() {
        let id: GroupId = "~zod/test".parse().unwrap();
        assert_eq!(id.host.as_str(), "~zod");
        assert_eq!(id.name, "test");
        assert_eq!(id.to_string(), "~zod/test");
        assert!("~zod/Test".parse::<GroupId>().is_err());
        assert!("~zod".parse::<GroupId>().is_err());
    }

    #[test]
    fn channel_kinds() {
        let nest: ChannelId = "chat/~zod/general".parse().unwrap();
        assert_eq!(nest.kind(), ChannelKind::Chat);
        assert_eq!(nest.host().unwrap().as_str(), "~zod");

        let diary: ChannelId = "diary/~zod/notes".parse().unwrap();
        assert_eq!(diary.kind(), ChannelKind::Notebook);

        let dm: ChannelId = "~bus".parse().unwrap();
        assert_eq!(dm.kind(), ChannelKind::Dm);

        let club: ChannelId = "0v4.00000.qd4p2".parse().unwrap();
        assert_eq!(club.kind(), ChannelKind::GroupDm);
        assert!(club.host().is_none());
    }

    #[test]
    fn post_id_orders_by_time() {
        let t1 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t2 = Utc.timestamp_opt(1_700_000_000, 1_000_000).unwrap();
        let a = PostId::from_time(t1);
        let b = PostId::from_time(t2);
        assert!(a < b);
        assert!(a.storage_key() < b.storage_key());
        assert_eq!(a.to_time(), t1);
    }

    #[test]
    fn post_id_dotted_form() {
        let id = PostId(170_141_184_506_000_000_000);
        assert_eq!(id.to_string(), "170.141.184.506.000.000.000");
        assert_eq!("170.141.184.506.000.000.000".parse::<PostId>().unwrap(), id);
        assert_eq!(PostId(12).to_string(), "12");
        assert_eq!(PostId(1234).to_string(), "1.234");
    }

    #[test]
    fn logical_time_after_is_monotonic() {
        let far = LogicalTime(i64::MAX - 10);
        assert_eq!(LogicalTime::after(Some(far)), LogicalTime(i64::MAX - 9));
        assert!(LogicalTime::after(None) > LogicalTime(0));
    }
}

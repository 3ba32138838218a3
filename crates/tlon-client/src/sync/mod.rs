//! Remote-to-local synchronization.
//!
//! Each [`Scope`] is one subscription plus the snapshot that backs it. The
//! [`SyncEngine`] runs one task per live scope; [`Applier`] does the actual
//! merging into the store.

mod apply;
mod diff;
mod engine;

use serde::Serialize;

use tlon_shared::protocol::paths;
use tlon_shared::{ChannelId, GroupId};

pub use apply::{ApplyMode, Applier, Outcome};
pub use diff::{fields, SyncDiff};
pub use engine::SyncEngine;

/// A unit of synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum Scope {
    /// Every joined group.
    Groups,
    Group(GroupId),
    /// One channel's newest window of posts (group channel, DM or club).
    Channel(ChannelId),
    Unreads,
    Contacts,
    Cohorts,
}

impl Scope {
    pub fn scry_path(&self, post_window: usize) -> (&'static str, String) {
        match self {
            Self::Groups => paths::groups_scry(),
            Self::Group(id) => paths::group_scry(id),
            Self::Channel(id) => paths::posts_scry(id, post_window),
            Self::Unreads => paths::unreads_scry(),
            Self::Contacts => paths::contacts_scry(),
            Self::Cohorts => paths::cohorts_scry(),
        }
    }

    pub fn watch_path(&self) -> (&'static str, String) {
        match self {
            Self::Groups => paths::groups_watch(),
            Self::Group(id) => paths::group_watch(id),
            Self::Channel(id) => paths::posts_watch(id),
            Self::Unreads => paths::unreads_watch(),
            Self::Contacts => paths::contacts_watch(),
            Self::Cohorts => paths::cohorts_watch(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Groups => write!(f, "groups"),
            Self::Group(id) => write!(f, "group {id}"),
            Self::Channel(id) => write!(f, "channel {id}"),
            Self::Unreads => write!(f, "unreads"),
            Self::Contacts => write!(f, "contacts"),
            Self::Cohorts => write!(f, "cohorts"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeState {
    Uninitialized,
    Backfilling,
    Live,
    /// Discontinuity: a fresh backfill is running over live data.
    Resyncing,
}

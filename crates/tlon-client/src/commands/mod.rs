//! User-facing operations.
//!
//! Each sub-module groups related commands by domain. Commands are free
//! functions taking the [`ClientState`](crate::state::ClientState) first;
//! writes go through the mutation coordinator, reads through the store.

pub mod activity;
pub mod cohorts;
pub mod groups;
pub mod messaging;
pub mod profile;

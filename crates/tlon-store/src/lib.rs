//! # tlon-store
//!
//! Local store for the Tlon client, backed by SQLite.
//!
//! The store is the single source of truth for everything the UI reads.
//! [`Database`] wraps a `rusqlite::Connection` and provides typed CRUD
//! helpers for every domain model; [`LocalStore`] shares it between tasks,
//! makes batches atomic and publishes a [`ChangeSet`] after every commit so
//! [`LiveQuery`] results stay current.

pub mod activity;
pub mod channels;
pub mod clocks;
pub mod cohorts;
pub mod contacts;
pub mod database;
pub mod entity;
pub mod groups;
pub mod live;
pub mod local;
pub mod migrations;
pub mod models;
pub mod posts;
pub mod reactions;

mod error;

pub use clocks::FieldClock;
pub use database::Database;
pub use entity::{ChangeSet, Entity, EntityKey, EntityKind, FieldRef, Filter};
pub use error::{Result, StoreError};
pub use live::{LiveQuery, QueryState};
pub use local::{LocalStore, Snapshot, StoreReader, WriteTxn};
pub use models::*;

//! # tlon-shared
//!
//! Vocabulary shared by every crate of the client: identifiers, structured
//! post content, metadata types and the typed wire protocol spoken with the
//! ship's agents.

pub mod constants;
pub mod error;
pub mod meta;
pub mod protocol;
pub mod story;
pub mod types;

pub use error::{IdError, ProtocolError};
pub use meta::{ChannelMeta, ContactProfile, GroupMeta, Privacy, RoleMeta};
pub use story::Story;
pub use types::{ChannelId, ChannelKind, GroupId, LogicalTime, PostId, Ship};

//! Read state.

use chrono::{DateTime, Utc};

use tlon_shared::protocol::ActivityAction;
use tlon_shared::{ChannelId, PostId};
use tlon_store::{ActivityBucket, EntityKey, Unread};

use crate::error::{ClientError, Result};
use crate::mutation::Mutation;
use crate::state::ClientState;
use crate::sync::fields;

/// Mark everything in `channel` as read, up to its newest post.
pub async fn mark_channel_read(state: &ClientState, channel: &ChannelId) -> Result<()> {
    let (found, newest) = state.store.read(|db| {
        let found = db.find_channel(channel)?;
        let newest = db.posts_for_channel(channel, 1)?.pop().map(|p| p.id);
        Ok((found, newest))
    })?;
    let Some(found) = found else {
        return Err(ClientError::NotFound(format!("Channel {channel}")));
    };

    let next = Unread {
        count: 0,
        last_read: newest.or(found.unread.last_read),
    };
    if found.unread == next {
        return Ok(());
    }
    let action = ActivityAction::Read {
        channel: channel.clone(),
        thread: None,
    };
    let nest = channel.clone();
    let mutation = Mutation::new("mark read", action.to_poke())
        .field(EntityKey::Channel(channel.clone()), fields::UNREAD)
        .patch(move |txn| {
            if txn.db().set_unread(&nest, &next)? {
                txn.touch(EntityKey::Channel(nest.clone()));
            }
            Ok(())
        });
    state.coordinator.mutate(mutation).await
}

/// Mark the replies to `parent` as read. Only the ship tracks thread
/// cursors, so the channel's own counter is left alone.
pub async fn mark_thread_read(state: &ClientState, channel: &ChannelId, parent: PostId) -> Result<()> {
    let action = ActivityAction::Read {
        channel: channel.clone(),
        thread: Some(parent),
    };
    state.gateway.request(&action.to_poke()).await?;
    Ok(())
}

/// Activity since `since`, bucketed by channel or thread.
pub fn activity_buckets(state: &ClientState, since: DateTime<Utc>) -> Result<Vec<ActivityBucket>> {
    Ok(state.store.read(|db| db.activity_buckets(since))?)
}

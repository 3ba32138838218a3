//! Posting, editing and reacting in channels and DMs.
//!
//! Every command here writes optimistically through the coordinator. A sent
//! post shows up at once with [`DeliveryStatus::Pending`]; the ship's echo
//! later replaces it with the confirmed post.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::debug;

use tlon_shared::protocol::{post_poke, Essay, PostAction, ReplyAction};
use tlon_shared::{ChannelId, ChannelMeta, PostId, Ship, Story};
use tlon_store::{Channel, DeliveryStatus, Entity, EntityKey, Post, WriteTxn};

use crate::error::{ClientError, Result};
use crate::mutation::Mutation;
use crate::state::ClientState;
use crate::sync::fields;

/// Send a top-level post. Returns the local id the post was stored under.
pub async fn send_post(state: &ClientState, channel: &ChannelId, content: Story) -> Result<PostId> {
    send(state, channel, None, content).await
}

pub async fn send_reply(
    state: &ClientState,
    channel: &ChannelId,
    parent: PostId,
    content: Story,
) -> Result<PostId> {
    send(state, channel, Some(parent), content).await
}

async fn send(state: &ClientState, channel: &ChannelId, parent: Option<PostId>, content: Story) -> Result<PostId> {
    if content.is_empty() {
        return Err(ClientError::Invalid("Message is empty".to_string()));
    }
    if let Some(parent) = parent {
        let exists = state.store.read(|db| db.find_post(channel, parent))?;
        if !exists.is_some_and(|p| !p.deleted) {
            return Err(ClientError::NotFound(format!("Post {parent}")));
        }
    }

    let own = state.own().clone();
    let sent = free_timestamp(state, channel, &own)?;
    let id = PostId::from_time(sent);
    let essay = Essay {
        content: content.clone(),
        author: own.clone(),
        sent: sent.timestamp_millis(),
    };
    let action = match parent {
        None => PostAction::Add(essay),
        Some(parent) => PostAction::Reply {
            id: parent,
            action: ReplyAction::Add(essay),
        },
    };

    let needs_channel = channel.kind().is_direct() && !state.store.read(|db| db.channel_exists(channel))?;

    let mut mutation =
        Mutation::new("send post", post_poke(channel, &action)).field(EntityKey::post(channel, id), fields::ESSAY);
    if needs_channel {
        mutation = mutation.target(EntityKey::Channel(channel.clone()));
    }
    if let Some(parent) = parent {
        mutation = mutation.target(EntityKey::post(channel, parent));
    }

    let post = Post {
        id,
        channel_id: channel.clone(),
        author: own,
        sent,
        content,
        parent_id: parent,
        reactions: Default::default(),
        reply_count: 0,
        delivery: DeliveryStatus::Pending,
        edited: false,
        deleted: false,
    };
    let nest = channel.clone();
    let acked = channel.clone();
    let mutation = mutation
        .patch(move |txn| {
            if needs_channel && !txn.db().channel_exists(&nest)? {
                txn.upsert(&Entity::Channel(Channel::new(nest.clone(), None, ChannelMeta::default())))?;
            }
            txn.upsert(&Entity::Post(post.clone()))?;
            if let Some(parent) = post.parent_id {
                adjust_reply_count(txn, &nest, parent, 1)?;
            }
            Ok(())
        })
        .on_ack(move |txn| {
            // The echo may already have replaced it.
            if let Some(mut post) = txn.db().find_post(&acked, id)? {
                if post.delivery == DeliveryStatus::Pending {
                    post.delivery = DeliveryStatus::Sent;
                    txn.upsert(&Entity::Post(post))?;
                }
            }
            Ok(())
        });

    state.coordinator.mutate(mutation).await?;
    debug!(%channel, post = %id, "post delivered");
    Ok(id)
}

pub async fn edit_post(state: &ClientState, channel: &ChannelId, id: PostId, content: Story) -> Result<()> {
    if content.is_empty() {
        return Err(ClientError::Invalid("Message is empty".to_string()));
    }
    let post = live_post(state, channel, id)?;
    if &post.author != state.own() {
        return Err(ClientError::Invalid("Only the author can edit a post".to_string()));
    }
    if post.parent_id.is_some() {
        return Err(ClientError::Invalid("Replies can't be edited".to_string()));
    }

    let action = PostAction::Edit {
        id,
        essay: Essay {
            content: content.clone(),
            author: post.author.clone(),
            sent: post.sent.timestamp_millis(),
        },
    };
    let nest = channel.clone();
    let mutation = Mutation::new("edit post", post_poke(channel, &action))
        .field(EntityKey::post(channel, id), fields::ESSAY)
        .patch(move |txn| {
            if let Some(mut post) = txn.db().find_post(&nest, id)? {
                post.content = content.clone();
                post.edited = true;
                txn.upsert(&Entity::Post(post))?;
            }
            Ok(())
        });
    state.coordinator.mutate(mutation).await
}

/// Delete a post or reply. The local row becomes a tombstone.
pub async fn delete_post(state: &ClientState, channel: &ChannelId, id: PostId) -> Result<()> {
    let post = live_post(state, channel, id)?;

    let action = match post.parent_id {
        None => PostAction::Del(id),
        Some(parent) => PostAction::Reply {
            id: parent,
            action: ReplyAction::Del(id),
        },
    };

    let mut mutation =
        Mutation::new("delete post", post_poke(channel, &action)).field(EntityKey::post(channel, id), fields::ESSAY);
    if let Some(parent) = post.parent_id {
        mutation = mutation.target(EntityKey::post(channel, parent));
    }

    let nest = channel.clone();
    let mutation = mutation.patch(move |txn| {
        let Some(mut post) = txn.db().find_post(&nest, id)? else {
            return Ok(());
        };
        if post.deleted {
            return Ok(());
        }
        post.deleted = true;
        txn.upsert(&Entity::Post(post.clone()))?;
        txn.db().delete_activity_for_post(&nest, id)?;
        if let Some(parent) = post.parent_id {
            adjust_reply_count(txn, &nest, parent, -1)?;
        }
        Ok(())
    });
    state.coordinator.mutate(mutation).await
}

pub async fn add_reaction(state: &ClientState, channel: &ChannelId, id: PostId, react: &str) -> Result<()> {
    if react.is_empty() {
        return Err(ClientError::Invalid("Reaction is empty".to_string()));
    }
    react_to(state, channel, id, Some(react.to_string())).await
}

pub async fn remove_reaction(state: &ClientState, channel: &ChannelId, id: PostId) -> Result<()> {
    react_to(state, channel, id, None).await
}

async fn react_to(state: &ClientState, channel: &ChannelId, id: PostId, react: Option<String>) -> Result<()> {
    let post = live_post(state, channel, id)?;
    let own = state.own().clone();

    let action = match (post.parent_id, &react) {
        (None, Some(react)) => PostAction::AddReact {
            id,
            ship: own.clone(),
            react: react.clone(),
        },
        (None, None) => PostAction::DelReact { id, ship: own.clone() },
        (Some(parent), Some(react)) => PostAction::Reply {
            id: parent,
            action: ReplyAction::AddReact {
                id,
                ship: own.clone(),
                react: react.clone(),
            },
        },
        (Some(parent), None) => PostAction::Reply {
            id: parent,
            action: ReplyAction::DelReact { id, ship: own.clone() },
        },
    };

    let nest = channel.clone();
    let label = if react.is_some() { "add reaction" } else { "remove reaction" };
    let mutation = Mutation::new(label, post_poke(channel, &action))
        .field(EntityKey::post(channel, id), fields::react(&own))
        .patch(move |txn| {
            if let Some(mut post) = txn.db().find_post(&nest, id)? {
                let changed = match &react {
                    Some(r) => post.reactions.insert(own.clone(), r.clone()).as_ref() != Some(r),
                    None => post.reactions.remove(&own).is_some(),
                };
                if changed {
                    txn.upsert(&Entity::Post(post))?;
                }
            }
            Ok(())
        });
    state.coordinator.mutate(mutation).await
}

fn live_post(state: &ClientState, channel: &ChannelId, id: PostId) -> Result<Post> {
    match state.store.read(|db| db.find_post(channel, id))? {
        Some(post) if !post.deleted => Ok(post),
        _ => Err(ClientError::NotFound(format!("Post {id}"))),
    }
}

fn adjust_reply_count(txn: &mut WriteTxn<'_>, channel: &ChannelId, parent: PostId, delta: i64) -> tlon_store::Result<()> {
    if let Some(mut post) = txn.db().find_post(channel, parent)? {
        post.reply_count = (post.reply_count as i64 + delta).max(0) as u32;
        txn.upsert(&Entity::Post(post))?;
    }
    Ok(())
}

/// A millisecond `sent` time no post of ours in `channel` uses yet. Post
/// ids derive from it, and the echo is matched on author plus `sent`.
fn free_timestamp(state: &ClientState, channel: &ChannelId, own: &Ship) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    let mut sent = Utc.timestamp_millis_opt(now.timestamp_millis()).single().unwrap_or(now);
    state.store.read(|db| {
        while db.find_post(channel, PostId::from_time(sent))?.is_some()
            || db.find_post_by_sent(channel, own, sent)?.is_some()
        {
            sent += Duration::milliseconds(1);
        }
        Ok(())
    })?;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, Harness};
    use tlon_api::PokeReply;
    use tlon_shared::GroupId;

    fn nest() -> ChannelId {
        "chat/~zod/general".parse().unwrap()
    }

    fn seed_channel(h: &Harness) {
        let group: GroupId = "~zod/test".parse().unwrap();
        h.state
            .store
            .upsert([Entity::Channel(Channel::new(nest(), Some(group), ChannelMeta::default()))])
            .unwrap();
    }

    fn post(h: &Harness, id: PostId) -> Option<Post> {
        h.state.store.read(|db| db.find_post(&nest(), id)).unwrap()
    }

    #[tokio::test]
    async fn sent_post_is_marked_delivered_on_ack() {
        let h = Harness::new(fast_config());
        seed_channel(&h);

        let id = send_post(&h.state, &nest(), Story::text("hi")).await.unwrap();
        let stored = post(&h, id).unwrap();
        assert_eq!(stored.delivery, DeliveryStatus::Sent);
        assert_eq!(stored.content.to_plain_text(), "hi");
        assert_eq!(h.ship.pokes_with_mark("channel-action-1").len(), 1);
    }

    #[tokio::test]
    async fn rejected_post_disappears() {
        let h = Harness::new(fast_config());
        seed_channel(&h);
        h.ship.script_poke("channel-action-1", PokeReply::Nack("no".into()));

        assert!(send_post(&h.state, &nest(), Story::text("hi")).await.is_err());
        let remaining = h.state.store.read(|db| db.posts_for_channel(&nest(), 10)).unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn reply_bumps_parent_and_rollback_restores_it() {
        let h = Harness::new(fast_config());
        seed_channel(&h);
        let parent = send_post(&h.state, &nest(), Story::text("parent")).await.unwrap();

        send_reply(&h.state, &nest(), parent, Story::text("first")).await.unwrap();
        assert_eq!(post(&h, parent).unwrap().reply_count, 1);

        h.ship.script_poke("channel-action-1", PokeReply::Nack("no".into()));
        assert!(send_reply(&h.state, &nest(), parent, Story::text("second")).await.is_err());
        assert_eq!(post(&h, parent).unwrap().reply_count, 1);
        let thread = h.state.store.read(|db| db.thread_replies(&nest(), parent)).unwrap();
        assert_eq!(thread.len(), 1);
    }

    #[tokio::test]
    async fn deleted_reply_leaves_a_tombstone() {
        let h = Harness::new(fast_config());
        seed_channel(&h);
        let parent = send_post(&h.state, &nest(), Story::text("parent")).await.unwrap();
        let reply = send_reply(&h.state, &nest(), parent, Story::text("oops")).await.unwrap();

        delete_post(&h.state, &nest(), reply).await.unwrap();
        assert!(post(&h, reply).unwrap().deleted);
        assert_eq!(post(&h, parent).unwrap().reply_count, 0);
        assert!(matches!(
            delete_post(&h.state, &nest(), reply).await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_reaction_is_reverted() {
        let h = Harness::new(fast_config());
        seed_channel(&h);
        let id = send_post(&h.state, &nest(), Story::text("hi")).await.unwrap();
        let own = h.state.own().clone();

        add_reaction(&h.state, &nest(), id, "👍").await.unwrap();
        assert!(post(&h, id).unwrap().reactions.contains_key(&own));

        h.ship.script_poke("channel-action-1", PokeReply::Nack("no".into()));
        assert!(remove_reaction(&h.state, &nest(), id).await.is_err());
        assert_eq!(post(&h, id).unwrap().reactions.get(&own).map(String::as_str), Some("👍"));
    }

    #[tokio::test]
    async fn edit_keeps_original_sent_time() {
        let h = Harness::new(fast_config());
        seed_channel(&h);
        let id = send_post(&h.state, &nest(), Story::text("draft")).await.unwrap();
        let sent = post(&h, id).unwrap().sent;

        edit_post(&h.state, &nest(), id, Story::text("final")).await.unwrap();
        let edited = post(&h, id).unwrap();
        assert!(edited.edited);
        assert_eq!(edited.sent, sent);
        assert_eq!(edited.content.to_plain_text(), "final");
    }

    #[tokio::test]
    async fn first_dm_creates_the_channel() {
        let h = Harness::new(fast_config());
        let bob: Ship = "~bob".parse().unwrap();
        let dm = ChannelId::dm(&bob);

        send_post(&h.state, &dm, Story::text("hey")).await.unwrap();
        assert!(h.state.store.read(|db| db.channel_exists(&dm)).unwrap());
        assert_eq!(h.ship.pokes_with_mark("chat-dm-action-1").len(), 1);
    }
}

use std::collections::BTreeMap;

use rusqlite::params;

use tlon_shared::{ChannelId, PostId, Ship};

use crate::database::{to_json_col, Database};
use crate::error::Result;

impl Database {
    /// Set `ship`'s reaction on a post, replacing any previous one.
    /// Returns `false` when the post is not stored.
    pub fn set_reaction(
        &self,
        channel: &ChannelId,
        post: PostId,
        ship: &Ship,
        react: &str,
    ) -> Result<bool> {
        let Some(mut reactions) = self.reactions_for_post(channel, post)? else {
            return Ok(false);
        };
        reactions.insert(ship.clone(), react.to_string());
        self.write_reactions(channel, post, &reactions)
    }

    pub fn remove_reaction(&self, channel: &ChannelId, post: PostId, ship: &Ship) -> Result<bool> {
        let Some(mut reactions) = self.reactions_for_post(channel, post)? else {
            return Ok(false);
        };
        if reactions.remove(ship).is_none() {
            return Ok(false);
        }
        self.write_reactions(channel, post, &reactions)
    }

    pub fn reactions_for_post(
        &self,
        channel: &ChannelId,
        post: PostId,
    ) -> Result<Option<BTreeMap<Ship, String>>> {
        Ok(self.find_post(channel, post)?.map(|p| p.reactions))
    }

    fn write_reactions(
        &self,
        channel: &ChannelId,
        post: PostId,
        reactions: &BTreeMap<Ship, String>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE posts SET reactions = ?3 WHERE channel_id = ?1 AND id = ?2",
            params![
                channel.to_string(),
                post.storage_key(),
                to_json_col(reactions)?
            ],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, DeliveryStatus, Post};
    use chrono::Utc;
    use tlon_shared::{ChannelMeta, Story};

    #[test]
    fn set_replace_and_remove() {
        let db = Database::open_in_memory().unwrap();
        let chan: ChannelId = "~bus".parse().unwrap();
        db.upsert_channel(&Channel::new(chan.clone(), None, ChannelMeta::default()))
            .unwrap();
        db.upsert_post(&Post {
            id: PostId(1),
            channel_id: chan.clone(),
            author: "~bus".parse().unwrap(),
            sent: Utc::now(),
            content: Story::text("hi"),
            parent_id: None,
            reactions: BTreeMap::new(),
            reply_count: 0,
            delivery: DeliveryStatus::Sent,
            edited: false,
            deleted: false,
        })
        .unwrap();

        let zod: Ship = "~zod".parse().unwrap();
        assert!(db.set_reaction(&chan, PostId(1), &zod, "👍").unwrap());
        assert!(db.set_reaction(&chan, PostId(1), &zod, "🔥").unwrap());
        let reactions = db.reactions_for_post(&chan, PostId(1)).unwrap().unwrap();
        assert_eq!(reactions.get(&zod).map(String::as_str), Some("🔥"));

        assert!(db.remove_reaction(&chan, PostId(1), &zod).unwrap());
        assert!(!db.remove_reaction(&chan, PostId(1), &zod).unwrap());
        assert!(!db.set_reaction(&chan, PostId(2), &zod, "👍").unwrap());
    }
}

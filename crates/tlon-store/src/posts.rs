//! CRUD operations for [`Post`] records.
//!
//! Post ids are stored as zero-padded decimal text, so `ORDER BY id` is
//! time order.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;

use tlon_shared::{ChannelId, PostId, Ship};

use crate::database::{conversion_err, from_json_col, not_found, optional, parse_col, to_json_col, Database};
use crate::error::Result;
use crate::models::{DeliveryStatus, Post};

const POST_COLUMNS: &str = "channel_id, id, author, sent, content, parent_id, reactions, \
                            reply_count, delivery, edited, deleted";

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert or replace a post. A post whose channel is unknown is kept as
    /// an orphan until the channel arrives.
    pub fn upsert_post(&self, post: &Post) -> Result<()> {
        let orphaned = !self.channel_exists(&post.channel_id)?;
        if orphaned {
            tracing::warn!(channel = %post.channel_id, post = %post.id, "post stored before its channel");
        }

        self.conn().execute(
            "INSERT INTO posts (channel_id, id, author, sent, content, parent_id, reactions,
                                reply_count, delivery, edited, deleted, orphaned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(channel_id, id) DO UPDATE SET
                author = excluded.author,
                sent = excluded.sent,
                content = excluded.content,
                parent_id = excluded.parent_id,
                reactions = excluded.reactions,
                reply_count = excluded.reply_count,
                delivery = excluded.delivery,
                edited = excluded.edited,
                deleted = excluded.deleted,
                orphaned = excluded.orphaned",
            params![
                post.channel_id.to_string(),
                post.id.storage_key(),
                post.author.as_str(),
                post.sent.timestamp_millis(),
                to_json_col(&post.content)?,
                post.parent_id.map(|p| p.storage_key()),
                to_json_col(&post.reactions)?,
                post.reply_count,
                post.delivery.as_str(),
                post.edited,
                post.deleted,
                orphaned,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn adopt_posts(&self, channel: &ChannelId) -> Result<Vec<PostId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM posts WHERE channel_id = ?1 AND orphaned = 1")?;
        let rows = stmt.query_map(params![channel.to_string()], |row| row.get::<_, String>(0))?;
        let mut adopted = Vec::new();
        for row in rows {
            adopted.push(PostId::from_storage_key(&row?)?);
        }

        if !adopted.is_empty() {
            self.conn().execute(
                "UPDATE posts SET orphaned = 0 WHERE channel_id = ?1",
                params![channel.to_string()],
            )?;
            tracing::info!(channel = %channel, count = adopted.len(), "adopted orphan posts");
        }
        Ok(adopted)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a post, tombstones included.
    pub fn get_post(&self, channel: &ChannelId, id: PostId) -> Result<Post> {
        self.conn()
            .query_row(
                &format!("SELECT {POST_COLUMNS} FROM posts WHERE channel_id = ?1 AND id = ?2"),
                params![channel.to_string(), id.storage_key()],
                row_to_post,
            )
            .map_err(not_found)
    }

    pub fn find_post(&self, channel: &ChannelId, id: PostId) -> Result<Option<Post>> {
        optional(self.get_post(channel, id))
    }

    /// The newest `limit` live top-level posts of a channel, ascending by id.
    pub fn posts_for_channel(&self, channel: &ChannelId, limit: u32) -> Result<Vec<Post>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {POST_COLUMNS} FROM (
                SELECT * FROM posts
                WHERE channel_id = ?1 AND parent_id IS NULL AND deleted = 0
                ORDER BY id DESC
                LIMIT ?2
             )
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![channel.to_string(), limit], row_to_post)?;

        let mut posts = Vec::new();
        for row in rows {
            posts.push(row?);
        }
        Ok(posts)
    }

    /// Live replies to `parent`, ascending by id.
    pub fn thread_replies(&self, channel: &ChannelId, parent: PostId) -> Result<Vec<Post>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {POST_COLUMNS} FROM posts
             WHERE channel_id = ?1 AND parent_id = ?2 AND deleted = 0
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(
            params![channel.to_string(), parent.storage_key()],
            row_to_post,
        )?;

        let mut posts = Vec::new();
        for row in rows {
            posts.push(row?);
        }
        Ok(posts)
    }

    /// Look a post up by its cache id: author plus sent time.
    pub fn find_post_by_sent(
        &self,
        channel: &ChannelId,
        author: &Ship,
        sent: DateTime<Utc>,
    ) -> Result<Option<Post>> {
        optional(
            self.conn()
                .query_row(
                    &format!(
                        "SELECT {POST_COLUMNS} FROM posts
                         WHERE channel_id = ?1 AND author = ?2 AND sent = ?3
                         ORDER BY id ASC LIMIT 1"
                    ),
                    params![channel.to_string(), author.as_str(), sent.timestamp_millis()],
                    row_to_post,
                )
                .map_err(not_found),
        )
    }

    pub fn pending_posts(&self, channel: &ChannelId) -> Result<Vec<Post>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {POST_COLUMNS} FROM posts
             WHERE channel_id = ?1 AND delivery = 'pending'
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![channel.to_string()], row_to_post)?;

        let mut posts = Vec::new();
        for row in rows {
            posts.push(row?);
        }
        Ok(posts)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Physically remove a post row (rollback of an optimistic send).
    pub fn delete_post_row(&self, channel: &ChannelId, id: PostId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM posts WHERE channel_id = ?1 AND id = ?2",
            params![channel.to_string(), id.storage_key()],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_posts_for_channel(&self, channel: &ChannelId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM posts WHERE channel_id = ?1",
            params![channel.to_string()],
        )?;
        Ok(affected)
    }

    /// Delete posts a fresh channel window no longer contains.
    ///
    /// Only the window's range is considered: top-level posts at or after
    /// `from` (every top-level post when `from` is `None`) and replies whose
    /// parent is in `keep`. Pending posts and tombstones are never removed.
    pub fn retain_posts(
        &self,
        channel: &ChannelId,
        keep: &BTreeSet<PostId>,
        from: Option<PostId>,
    ) -> Result<Vec<PostId>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, parent_id FROM posts
             WHERE channel_id = ?1 AND delivery = 'sent' AND deleted = 0",
        )?;
        let rows = stmt.query_map(params![channel.to_string()], |row| {
            let id: String = row.get(0)?;
            let parent: Option<String> = row.get(1)?;
            Ok((id, parent))
        })?;

        let mut removed = Vec::new();
        for row in rows {
            let (id, parent) = row?;
            let id = PostId::from_storage_key(&id)?;
            if keep.contains(&id) {
                continue;
            }
            let in_window = match parent {
                None => from.map_or(true, |f| id >= f),
                Some(p) => keep.contains(&PostId::from_storage_key(&p)?),
            };
            if in_window {
                removed.push(id);
            }
        }
        for id in &removed {
            self.delete_post_row(channel, *id)?;
        }
        Ok(removed)
    }
}

pub(crate) fn row_to_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<Post> {
    let channel_str: String = row.get(0)?;
    let id_str: String = row.get(1)?;
    let author_str: String = row.get(2)?;
    let sent_ms: i64 = row.get(3)?;
    let content: String = row.get(4)?;
    let parent_str: Option<String> = row.get(5)?;
    let reactions: String = row.get(6)?;
    let delivery: String = row.get(8)?;

    let id = PostId::from_storage_key(&id_str).map_err(|e| conversion_err(1, e))?;
    let parent_id = match parent_str {
        Some(s) => Some(PostId::from_storage_key(&s).map_err(|e| conversion_err(5, e))?),
        None => None,
    };
    let sent = Utc
        .timestamp_millis_opt(sent_ms)
        .single()
        .unwrap_or_default();

    Ok(Post {
        id,
        channel_id: parse_col(0, &channel_str)?,
        author: parse_col(2, &author_str)?,
        sent,
        content: from_json_col(4, &content)?,
        parent_id,
        reactions: from_json_col(6, &reactions)?,
        reply_count: row.get(7)?,
        delivery: DeliveryStatus::parse(&delivery),
        edited: row.get(9)?,
        deleted: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Channel;
    use std::collections::BTreeMap;
    use tlon_shared::{ChannelMeta, Story};

    fn chan() -> ChannelId {
        "~bus".parse().unwrap()
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_channel(&Channel::new(chan(), None, ChannelMeta::default()))
            .unwrap();
        db
    }

    fn post(id: u128, parent: Option<u128>) -> Post {
        Post {
            id: PostId(id),
            channel_id: chan(),
            author: "~zod".parse().unwrap(),
            sent: Utc.timestamp_millis_opt(id as i64).unwrap(),
            content: Story::text(format!("post {id}")),
            parent_id: parent.map(PostId),
            reactions: BTreeMap::new(),
            reply_count: 0,
            delivery: DeliveryStatus::Sent,
            edited: false,
            deleted: false,
        }
    }

    #[test]
    fn window_is_newest_n_ascending() {
        let db = setup();
        for id in [5u128, 1, 4, 2, 3] {
            db.upsert_post(&post(id, None)).unwrap();
        }
        let ids: Vec<u128> = db
            .posts_for_channel(&chan(), 3)
            .unwrap()
            .iter()
            .map(|p| p.id.0)
            .collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn ordering_is_numeric_across_digit_counts() {
        let db = setup();
        db.upsert_post(&post(100, None)).unwrap();
        db.upsert_post(&post(9, None)).unwrap();
        let ids: Vec<u128> = db
            .posts_for_channel(&chan(), 10)
            .unwrap()
            .iter()
            .map(|p| p.id.0)
            .collect();
        assert_eq!(ids, vec![9, 100]);
    }

    #[test]
    fn replies_and_tombstones() {
        let db = setup();
        db.upsert_post(&post(10, None)).unwrap();
        db.upsert_post(&post(11, Some(10))).unwrap();
        let mut gone = post(12, Some(10));
        gone.deleted = true;
        db.upsert_post(&gone).unwrap();

        let replies = db.thread_replies(&chan(), PostId(10)).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(db.get_post(&chan(), PostId(12)).unwrap().deleted);
        // Replies never show up in the top-level window.
        assert_eq!(db.posts_for_channel(&chan(), 10).unwrap().len(), 1);
    }

    #[test]
    fn cache_id_lookup() {
        let db = setup();
        let p = post(7, None);
        db.upsert_post(&p).unwrap();
        let found = db
            .find_post_by_sent(&chan(), &p.author, p.sent)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, p.id);
    }

    #[test]
    fn retain_keeps_pending_and_older_posts() {
        let db = setup();
        db.upsert_post(&post(1, None)).unwrap();
        db.upsert_post(&post(5, None)).unwrap();
        db.upsert_post(&post(6, None)).unwrap();
        let mut pending = post(7, None);
        pending.delivery = DeliveryStatus::Pending;
        db.upsert_post(&pending).unwrap();

        let keep: BTreeSet<PostId> = [PostId(5)].into_iter().collect();
        let removed = db.retain_posts(&chan(), &keep, Some(PostId(5))).unwrap();
        assert_eq!(removed, vec![PostId(6)]);
        assert!(db.find_post(&chan(), PostId(1)).unwrap().is_some());
        assert!(db.find_post(&chan(), PostId(7)).unwrap().is_some());
    }

    #[test]
    fn post_before_channel_is_orphaned() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_post(&post(3, None)).unwrap();
        assert_eq!(db.orphans().unwrap().len(), 1);

        let adopted = db
            .upsert_channel(&Channel::new(chan(), None, ChannelMeta::default()))
            .unwrap();
        assert_eq!(adopted, vec![PostId(3)]);
        assert!(db.orphans().unwrap().is_empty());
    }
}

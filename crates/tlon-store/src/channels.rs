//! CRUD operations for [`Channel`] records, including orphan bookkeeping.

use std::collections::BTreeSet;

use rusqlite::params;

use tlon_shared::{ChannelId, ChannelMeta, GroupId, PostId};

use crate::database::{from_json_col, not_found, optional, parse_col, to_json_col, Database};
use crate::entity::EntityKey;
use crate::error::Result;
use crate::models::{Channel, Unread};

const CHANNEL_COLUMNS: &str =
    "id, kind, group_id, title, description, writers, unread_count, last_read";

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert or replace a channel.
    ///
    /// A group channel whose group is not stored yet is kept as an orphan
    /// and adopted by [`Database::upsert_group`]. Posts that were waiting for
    /// this channel are adopted here and returned.
    pub fn upsert_channel(&self, channel: &Channel) -> Result<Vec<PostId>> {
        let orphaned = match &channel.group_id {
            Some(group) => !self.group_exists(group)?,
            None => false,
        };
        if orphaned {
            tracing::warn!(channel = %channel.id, "channel stored before its group");
        }

        self.conn().execute(
            "INSERT INTO channels (id, kind, group_id, title, description, writers,
                                   unread_count, last_read, orphaned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                group_id = excluded.group_id,
                title = excluded.title,
                description = excluded.description,
                writers = excluded.writers,
                unread_count = excluded.unread_count,
                last_read = excluded.last_read,
                orphaned = excluded.orphaned",
            params![
                channel.id.to_string(),
                channel.kind.as_str(),
                channel.group_id.as_ref().map(|g| g.to_string()),
                channel.meta.title,
                channel.meta.description,
                to_json_col(&channel.writers)?,
                channel.unread.count,
                channel.unread.last_read.map(|p| p.storage_key()),
                orphaned,
            ],
        )?;

        self.adopt_posts(&channel.id)
    }

    /// Clear the orphan flag of every channel of `group`.
    pub(crate) fn adopt_channels(&self, group: &GroupId) -> Result<Vec<ChannelId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM channels WHERE group_id = ?1 AND orphaned = 1")?;
        let rows = stmt.query_map(params![group.to_string()], |row| {
            let raw: String = row.get(0)?;
            parse_col::<ChannelId>(0, &raw)
        })?;
        let mut adopted = Vec::new();
        for row in rows {
            adopted.push(row?);
        }

        if !adopted.is_empty() {
            self.conn().execute(
                "UPDATE channels SET orphaned = 0 WHERE group_id = ?1",
                params![group.to_string()],
            )?;
            tracing::info!(group = %group, count = adopted.len(), "adopted orphan channels");
        }
        Ok(adopted)
    }

    pub fn set_unread(&self, channel: &ChannelId, unread: &Unread) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE channels SET unread_count = ?2, last_read = ?3 WHERE id = ?1",
            params![
                channel.to_string(),
                unread.count,
                unread.last_read.map(|p| p.storage_key()),
            ],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_channel(&self, id: &ChannelId) -> Result<Channel> {
        self.conn()
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"),
                params![id.to_string()],
                row_to_channel,
            )
            .map_err(not_found)
    }

    pub fn find_channel(&self, id: &ChannelId) -> Result<Option<Channel>> {
        optional(self.get_channel(id))
    }

    pub fn channel_exists(&self, id: &ChannelId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM channels WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Channels of a group in the group's display order; channels missing
    /// from the order follow, sorted by id.
    pub fn channels_for_group(&self, group: &GroupId) -> Result<Vec<Channel>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE group_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![group.to_string()], row_to_channel)?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }

        let order = self
            .find_group(group)?
            .map(|g| g.channel_order)
            .unwrap_or_default();
        channels.sort_by_key(|c| order.iter().position(|o| o == &c.id).unwrap_or(usize::MAX));
        Ok(channels)
    }

    /// DMs and group DMs, most recently read last.
    pub fn direct_channels(&self) -> Result<Vec<Channel>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels
             WHERE group_id IS NULL
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_channel)?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }

    /// Channels and posts currently waiting for a parent.
    pub fn orphans(&self) -> Result<Vec<EntityKey>> {
        let mut keys = Vec::new();

        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM channels WHERE orphaned = 1 ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            parse_col::<ChannelId>(0, &raw)
        })?;
        for row in rows {
            keys.push(EntityKey::Channel(row?));
        }

        let mut stmt = self
            .conn()
            .prepare("SELECT channel_id, id FROM posts WHERE orphaned = 1 ORDER BY channel_id, id")?;
        let rows = stmt.query_map([], |row| {
            let channel: String = row.get(0)?;
            let id: String = row.get(1)?;
            Ok((parse_col::<ChannelId>(0, &channel)?, id))
        })?;
        for row in rows {
            let (channel, id) = row?;
            keys.push(EntityKey::post(&channel, PostId::from_storage_key(&id)?));
        }

        Ok(keys)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete the channel row only; its posts stay so the delete can be
    /// rolled back.
    pub fn delete_channel(&self, id: &ChannelId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM channels WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }

    /// Delete a channel with its posts and activity.
    pub fn purge_channel(&self, id: &ChannelId) -> Result<bool> {
        self.delete_posts_for_channel(id)?;
        self.delete_activity_for_channel(id)?;
        self.delete_channel(id)
    }

    /// Delete channels of `group` not in `keep`. Returns the removed ids.
    pub fn retain_channels_for_group(
        &self,
        group: &GroupId,
        keep: &BTreeSet<ChannelId>,
    ) -> Result<Vec<ChannelId>> {
        let removed: Vec<ChannelId> = self
            .channels_for_group(group)?
            .into_iter()
            .map(|c| c.id)
            .filter(|id| !keep.contains(id))
            .collect();
        for id in &removed {
            self.purge_channel(id)?;
        }
        Ok(removed)
    }
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let group_str: Option<String> = row.get(2)?;
    let writers: String = row.get(5)?;
    let last_read: Option<String> = row.get(7)?;

    let group_id = match group_str {
        Some(s) => Some(parse_col(2, &s)?),
        None => None,
    };
    let last_read = match last_read {
        Some(s) => Some(
            PostId::from_storage_key(&s).map_err(|e| crate::database::conversion_err(7, e))?,
        ),
        None => None,
    };

    Ok(Channel {
        id: parse_col(0, &id_str)?,
        kind: parse_col(1, &kind_str)?,
        group_id,
        meta: ChannelMeta {
            title: row.get(3)?,
            description: row.get(4)?,
        },
        writers: from_json_col(5, &writers)?,
        unread: Unread {
            count: row.get(6)?,
            last_read,
        },
    })
}

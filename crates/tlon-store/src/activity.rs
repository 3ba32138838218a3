//! Derived activity feed: one row per relevant post, grouped into buckets
//! per source for display.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;

use tlon_shared::{ChannelId, PostId};

use crate::database::{conversion_err, parse_col, Database};
use crate::error::Result;
use crate::models::{ActivityBucket, ActivityEvent, ActivityKind, ActivitySource};

impl Database {
    /// Record an event. Re-inserting the same `(source, post)` is a no-op.
    pub fn insert_activity(&self, event: &ActivityEvent) -> Result<bool> {
        let parent = match &event.source {
            ActivitySource::Thread { parent, .. } => Some(parent.storage_key()),
            ActivitySource::Channel(_) => None,
        };
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO activity_events
                (source, post_id, channel_id, parent_id, author, kind, group_id, time, preview)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.source.storage_key(),
                event.post_id.storage_key(),
                event.source.channel().to_string(),
                parent,
                event.author.as_str(),
                event.kind.as_str(),
                event.group_id.as_ref().map(|g| g.to_string()),
                event.time.timestamp_millis(),
                event.preview,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Events newer than `since`, newest first.
    pub fn activity_since(&self, since: DateTime<Utc>) -> Result<Vec<ActivityEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT channel_id, parent_id, post_id, author, kind, group_id, time, preview
             FROM activity_events
             WHERE time >= ?1
             ORDER BY time DESC, post_id DESC",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], row_to_event)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Events newer than `since` grouped by source, most recent bucket first.
    pub fn activity_buckets(&self, since: DateTime<Utc>) -> Result<Vec<ActivityBucket>> {
        let mut grouped: BTreeMap<ActivitySource, Vec<ActivityEvent>> = BTreeMap::new();
        for event in self.activity_since(since)? {
            grouped.entry(event.source.clone()).or_default().push(event);
        }

        let mut buckets = Vec::with_capacity(grouped.len());
        for (source, all) in grouped {
            // `all` is newest first.
            let Some(newest) = all.first().cloned() else {
                continue;
            };
            let unread = match self.find_channel(source.channel())? {
                Some(channel) => match channel.unread.last_read {
                    Some(last_read) => newest.post_id > last_read,
                    None => channel.unread.count > 0,
                },
                None => false,
            };
            buckets.push(ActivityBucket {
                source,
                newest,
                all,
                unread,
            });
        }
        buckets.sort_by(|a, b| b.newest.time.cmp(&a.newest.time));
        Ok(buckets)
    }

    pub fn find_activity(&self, source: &str, post: PostId) -> Result<Option<ActivityEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT channel_id, parent_id, post_id, author, kind, group_id, time, preview
             FROM activity_events
             WHERE source = ?1 AND post_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![source, post.storage_key()], row_to_event)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn delete_activity(&self, source: &str, post: PostId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM activity_events WHERE source = ?1 AND post_id = ?2",
            params![source, post.storage_key()],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_activity_for_post(&self, channel: &ChannelId, post: PostId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM activity_events WHERE channel_id = ?1 AND post_id = ?2",
            params![channel.to_string(), post.storage_key()],
        )?;
        Ok(affected)
    }

    pub fn delete_activity_for_channel(&self, channel: &ChannelId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM activity_events WHERE channel_id = ?1",
            params![channel.to_string()],
        )?;
        Ok(affected)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityEvent> {
    let channel: String = row.get(0)?;
    let parent: Option<String> = row.get(1)?;
    let post: String = row.get(2)?;
    let author: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let group: Option<String> = row.get(5)?;
    let time_ms: i64 = row.get(6)?;

    let channel: ChannelId = parse_col(0, &channel)?;
    let source = match parent {
        Some(p) => ActivitySource::Thread {
            channel,
            parent: PostId::from_storage_key(&p).map_err(|e| conversion_err(1, e))?,
        },
        None => ActivitySource::Channel(channel),
    };
    let group_id = match group {
        Some(g) => Some(parse_col(5, &g)?),
        None => None,
    };

    Ok(ActivityEvent {
        source,
        post_id: PostId::from_storage_key(&post).map_err(|e| conversion_err(2, e))?,
        author: parse_col(3, &author)?,
        kind: ActivityKind::parse(&kind),
        group_id,
        time: Utc.timestamp_millis_opt(time_ms).single().unwrap_or_default(),
        preview: row.get(7)?,
    })
}

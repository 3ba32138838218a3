//! CRUD operations for [`Group`] records.

use std::collections::BTreeSet;

use rusqlite::params;

use tlon_shared::{GroupId, GroupMeta, Privacy, Ship};

use crate::database::{from_json_col, not_found, optional, parse_col, to_json_col, Database};
use crate::error::Result;
use crate::models::Group;

const GROUP_COLUMNS: &str =
    "id, title, description, image, cover, privacy, channel_order, members, roles, joined";

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert or replace a group.
    ///
    /// Channels that arrived before their group are re-parented; their ids
    /// are returned so the caller can publish them as changed.
    pub fn upsert_group(&self, group: &Group) -> Result<Vec<tlon_shared::ChannelId>> {
        self.conn().execute(
            "INSERT INTO groups (id, title, description, image, cover, privacy,
                                 channel_order, members, roles, joined)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                image = excluded.image,
                cover = excluded.cover,
                privacy = excluded.privacy,
                channel_order = excluded.channel_order,
                members = excluded.members,
                roles = excluded.roles,
                joined = excluded.joined",
            params![
                group.id.to_string(),
                group.meta.title,
                group.meta.description,
                group.meta.image,
                group.meta.cover,
                group.privacy.as_str(),
                to_json_col(&group.channel_order)?,
                to_json_col(&group.members)?,
                to_json_col(&group.roles)?,
                group.joined,
            ],
        )?;

        self.adopt_channels(&group.id)
    }

    /// Insert a group only if no row exists yet. Returns whether it was new.
    pub fn insert_group_if_absent(&self, group: &Group) -> Result<bool> {
        if self.group_exists(&group.id)? {
            return Ok(false);
        }
        self.upsert_group(group)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_group(&self, id: &GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?1"),
                params![id.to_string()],
                row_to_group,
            )
            .map_err(not_found)
    }

    pub fn find_group(&self, id: &GroupId) -> Result<Option<Group>> {
        optional(self.get_group(id))
    }

    pub fn group_exists(&self, id: &GroupId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM groups WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Joined groups ordered by title.
    pub fn list_groups(&self) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups
             WHERE joined = 1
             ORDER BY title COLLATE NOCASE ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// All known groups hosted by `host`, joined or not.
    pub fn groups_by_host(&self, host: &Ship) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups
             WHERE id LIKE ?1 || '/%'
             ORDER BY title COLLATE NOCASE ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![host.as_str()], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    pub fn group_ids(&self) -> Result<Vec<GroupId>> {
        let mut stmt = self.conn().prepare("SELECT id FROM groups ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            parse_col(0, &raw)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a group row. Its channels are left to the caller.
    pub fn delete_group(&self, id: &GroupId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM groups WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }

    /// Delete joined groups not in `keep`. Previews are left alone.
    pub fn retain_groups(&self, keep: &BTreeSet<GroupId>) -> Result<Vec<GroupId>> {
        let mut stmt = self.conn().prepare("SELECT id FROM groups WHERE joined = 1")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            parse_col::<GroupId>(0, &raw)
        })?;

        let mut removed = Vec::new();
        for row in rows {
            let id = row?;
            if !keep.contains(&id) {
                removed.push(id);
            }
        }
        for id in &removed {
            self.delete_group(id)?;
        }
        Ok(removed)
    }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id_str: String = row.get(0)?;
    let privacy: String = row.get(5)?;
    let order: String = row.get(6)?;
    let members: String = row.get(7)?;
    let roles: String = row.get(8)?;

    Ok(Group {
        id: parse_col(0, &id_str)?,
        meta: GroupMeta {
            title: row.get(1)?,
            description: row.get(2)?,
            image: row.get(3)?,
            cover: row.get(4)?,
        },
        privacy: Privacy::parse(&privacy),
        channel_order: from_json_col(6, &order)?,
        members: from_json_col(7, &members)?,
        roles: from_json_col(8, &roles)?,
        joined: row.get(9)?,
    })
}

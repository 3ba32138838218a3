use std::collections::BTreeSet;

use rusqlite::params;

use tlon_shared::Ship;

use crate::database::{from_json_col, not_found, optional, parse_col, to_json_col, Database};
use crate::error::Result;
use crate::models::Contact;

impl Database {
    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contacts (id, nickname, avatar, bio, color, pinned_groups)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                nickname = excluded.nickname,
                avatar = excluded.avatar,
                bio = excluded.bio,
                color = excluded.color,
                pinned_groups = excluded.pinned_groups",
            params![
                contact.id.as_str(),
                contact.nickname,
                contact.avatar,
                contact.bio,
                contact.color,
                to_json_col(&contact.pinned_groups)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_contact(&self, id: &Ship) -> Result<Contact> {
        self.conn()
            .query_row(
                "SELECT id, nickname, avatar, bio, color, pinned_groups
                 FROM contacts WHERE id = ?1",
                params![id.as_str()],
                row_to_contact,
            )
            .map_err(not_found)
    }

    pub fn find_contact(&self, id: &Ship) -> Result<Option<Contact>> {
        optional(self.get_contact(id))
    }

    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, nickname, avatar, bio, color, pinned_groups
             FROM contacts ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    pub fn delete_contact(&self, id: &Ship) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM contacts WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    /// Delete contacts not in `keep`, except `own` (our own profile).
    pub fn retain_contacts(&self, keep: &BTreeSet<Ship>, own: &Ship) -> Result<Vec<Ship>> {
        let removed: Vec<Ship> = self
            .list_contacts()?
            .into_iter()
            .map(|c| c.id)
            .filter(|id| id != own && !keep.contains(id))
            .collect();
        for id in &removed {
            self.delete_contact(id)?;
        }
        Ok(removed)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let id: String = row.get(0)?;
    let pinned: String = row.get(5)?;
    Ok(Contact {
        id: parse_col(0, &id)?,
        nickname: row.get(1)?,
        avatar: row.get(2)?,
        bio: row.get(3)?,
        color: row.get(4)?,
        pinned_groups: from_json_col(5, &pinned)?,
    })
}

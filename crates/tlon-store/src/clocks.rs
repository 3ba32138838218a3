//! Per-field logical clocks for last-writer-wins reconciliation.
//!
//! A clock records the logical time of the last accepted write to one field
//! of one entity, and the optimistic mutation that owns the field while that
//! write is unconfirmed.

use rusqlite::params;
use uuid::Uuid;

use tlon_shared::LogicalTime;

use crate::database::{conversion_err, not_found, optional, Database};
use crate::entity::EntityKey;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldClock {
    pub time: LogicalTime,
    /// Local id of the pending mutation that wrote this field, if any.
    pub pending: Option<Uuid>,
}

impl FieldClock {
    pub fn confirmed(time: LogicalTime) -> Self {
        Self {
            time,
            pending: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Database {
    pub fn clock(&self, key: &EntityKey, field: &str) -> Result<Option<FieldClock>> {
        optional(
            self.conn()
                .query_row(
                    "SELECT time, pending FROM field_clocks WHERE entity_key = ?1 AND field = ?2",
                    params![key.storage_key(), field],
                    |row| {
                        let time: i64 = row.get(0)?;
                        let pending: Option<String> = row.get(1)?;
                        let pending = match pending {
                            Some(s) => Some(Uuid::parse_str(&s).map_err(|e| conversion_err(1, e))?),
                            None => None,
                        };
                        Ok(FieldClock {
                            time: LogicalTime(time),
                            pending,
                        })
                    },
                )
                .map_err(not_found),
        )
    }

    pub fn set_clock(&self, key: &EntityKey, field: &str, clock: &FieldClock) -> Result<()> {
        self.conn().execute(
            "INSERT INTO field_clocks (entity_key, field, time, pending)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity_key, field) DO UPDATE SET
                time = excluded.time,
                pending = excluded.pending",
            params![
                key.storage_key(),
                field,
                clock.time.0,
                clock.pending.map(|id| id.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Restore a field's clock to a previous value (`None` removes it).
    pub fn restore_clock(&self, key: &EntityKey, field: &str, clock: Option<&FieldClock>) -> Result<()> {
        match clock {
            Some(clock) => self.set_clock(key, field, clock),
            None => {
                self.conn().execute(
                    "DELETE FROM field_clocks WHERE entity_key = ?1 AND field = ?2",
                    params![key.storage_key(), field],
                )?;
                Ok(())
            }
        }
    }

    /// Release every field owned by `mutation`. Returns how many were owned.
    pub fn confirm_clocks(&self, mutation: Uuid) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE field_clocks SET pending = NULL WHERE pending = ?1",
            params![mutation.to_string()],
        )?;
        Ok(affected)
    }

    /// Drop every clock of an entity (it was removed for good).
    pub fn clear_clocks(&self, key: &EntityKey) -> Result<()> {
        self.conn().execute(
            "DELETE FROM field_clocks WHERE entity_key = ?1",
            params![key.storage_key()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_then_confirmed() {
        let db = Database::open_in_memory().unwrap();
        let key = EntityKey::Group("~zod/test".parse().unwrap());
        assert!(db.clock(&key, "meta").unwrap().is_none());

        let mutation = Uuid::new_v4();
        db.set_clock(
            &key,
            "meta",
            &FieldClock {
                time: LogicalTime(20),
                pending: Some(mutation),
            },
        )
        .unwrap();
        assert!(db.clock(&key, "meta").unwrap().unwrap().is_pending());

        assert_eq!(db.confirm_clocks(mutation).unwrap(), 1);
        let clock = db.clock(&key, "meta").unwrap().unwrap();
        assert_eq!(clock, FieldClock::confirmed(LogicalTime(20)));

        db.restore_clock(&key, "meta", None).unwrap();
        assert!(db.clock(&key, "meta").unwrap().is_none());
    }
}

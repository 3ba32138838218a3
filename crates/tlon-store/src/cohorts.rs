use std::collections::BTreeSet;

use rusqlite::params;

use crate::database::{from_json_col, not_found, optional, to_json_col, Database};
use crate::error::Result;
use crate::models::Cohort;

impl Database {
    pub fn upsert_cohort(&self, cohort: &Cohort) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cohorts (id, targets) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET targets = excluded.targets",
            params![cohort.id, to_json_col(&cohort.targets)?],
        )?;
        Ok(())
    }

    pub fn get_cohort(&self, id: &str) -> Result<Cohort> {
        self.conn()
            .query_row(
                "SELECT id, targets FROM cohorts WHERE id = ?1",
                params![id],
                row_to_cohort,
            )
            .map_err(not_found)
    }

    pub fn find_cohort(&self, id: &str) -> Result<Option<Cohort>> {
        optional(self.get_cohort(id))
    }

    pub fn list_cohorts(&self) -> Result<Vec<Cohort>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, targets FROM cohorts ORDER BY id ASC")?;
        let rows = stmt.query_map([], row_to_cohort)?;

        let mut cohorts = Vec::new();
        for row in rows {
            cohorts.push(row?);
        }
        Ok(cohorts)
    }

    pub fn delete_cohort(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM cohorts WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn retain_cohorts(&self, keep: &BTreeSet<String>) -> Result<Vec<String>> {
        let removed: Vec<String> = self
            .list_cohorts()?
            .into_iter()
            .map(|c| c.id)
            .filter(|id| !keep.contains(id))
            .collect();
        for id in &removed {
            self.delete_cohort(id)?;
        }
        Ok(removed)
    }
}

fn row_to_cohort(row: &rusqlite::Row<'_>) -> rusqlite::Result<Cohort> {
    let targets: String = row.get(1)?;
    Ok(Cohort {
        id: row.get(0)?,
        targets: from_json_col(1, &targets)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cohort_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let cohort = Cohort {
            id: "~zod/cohort1".into(),
            targets: vec!["~bob".parse().unwrap(), "~sam".parse().unwrap()],
        };
        db.upsert_cohort(&cohort).unwrap();
        assert_eq!(db.get_cohort("~zod/cohort1").unwrap(), cohort);
        assert!(db.find_cohort("~zod/other").unwrap().is_none());

        db.retain_cohorts(&BTreeSet::new()).unwrap();
        assert!(db.list_cohorts().unwrap().is_empty());
    }
}

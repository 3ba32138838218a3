//! Broadcast cohorts: named lists of ships a message can be sent to.

use serde::Serialize;
use tracing::{info, warn};

use tlon_shared::protocol::BroadcastAction;
use tlon_shared::Ship;
use tlon_store::{Cohort, Entity, EntityKey};

use crate::error::{ClientError, Result};
use crate::mutation::Mutation;
use crate::state::ClientState;
use crate::sync::{fields, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CohortMode {
    Add,
    Del,
}

/// Ships in `selected` the change cannot apply to: for `Add` those already
/// in the cohort, for `Del` those not in it. Unknown targets flag nothing.
pub fn invalid_ships(mode: CohortMode, targets: Option<&[Ship]>, selected: &[Ship]) -> Vec<Ship> {
    let Some(targets) = targets else {
        return Vec::new();
    };
    selected
        .iter()
        .filter(|ship| match mode {
            CohortMode::Add => targets.contains(ship),
            CohortMode::Del => !targets.contains(ship),
        })
        .cloned()
        .collect()
}

/// The state of the invite form.
#[derive(Debug, Clone)]
pub struct CohortInvite {
    pub mode: CohortMode,
    /// Cohort being edited; `None` when creating one.
    pub cohort: Option<String>,
    pub selected: Vec<Ship>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortValidation {
    pub invalid_ships: Vec<Ship>,
    pub show_error: bool,
    /// What to tell the user when `show_error` is set.
    pub message: Option<String>,
}

impl CohortInvite {
    pub fn validate(&self, state: &ClientState) -> Result<CohortValidation> {
        let targets = match &self.cohort {
            Some(id) => state.store.read(|db| db.find_cohort(id))?.map(|c| c.targets),
            None => None,
        };
        let invalid = invalid_ships(self.mode, targets.as_deref(), &self.selected);
        let show_error = !invalid.is_empty();
        Ok(CohortValidation {
            message: show_error.then(|| invalid_message(self.mode, &invalid)),
            invalid_ships: invalid,
            show_error,
        })
    }
}

fn invalid_message(mode: CohortMode, invalid: &[Ship]) -> String {
    let mut out = String::new();
    let last = invalid.len().saturating_sub(1);
    for (i, ship) in invalid.iter().enumerate() {
        if i == last {
            if invalid.len() > 1 {
                out.push_str("and ");
            }
            out.push_str(ship.as_str());
            out.push(' ');
        } else {
            out.push_str(ship.as_str());
            if invalid.len() > 2 {
                out.push(',');
            }
            out.push(' ');
        }
    }
    out.push_str(if invalid.len() > 1 { "are" } else { "is" });
    out.push_str(match mode {
        CohortMode::Add => " already in this chat.",
        CohortMode::Del => " not in this chat.",
    });
    out
}

/// Encode free text as an Urbit `@ta` knot, the form cohort tags take.
pub fn string_to_ta(name: &str) -> String {
    let mut out = String::from("~.");
    for unit in name.encode_utf16() {
        match unit {
            0x20 => out.push('.'),
            0x2e => out.push_str("~."),
            0x7e => out.push_str("~~"),
            0x61..=0x7a | 0x30..=0x39 | 0x2d => out.push(unit as u8 as char),
            _ => out.push_str(&format!("~{unit:x}.")),
        }
    }
    out
}

pub async fn add_to_cohort(state: &ClientState, cohort: &str, ships: Vec<Ship>) -> Result<()> {
    change_cohort(state, cohort, CohortMode::Add, ships).await
}

pub async fn remove_from_cohort(state: &ClientState, cohort: &str, ships: Vec<Ship>) -> Result<()> {
    change_cohort(state, cohort, CohortMode::Del, ships).await
}

async fn change_cohort(state: &ClientState, cohort: &str, mode: CohortMode, ships: Vec<Ship>) -> Result<()> {
    let invite = CohortInvite {
        mode,
        cohort: Some(cohort.to_string()),
        selected: ships.clone(),
    };
    let validation = invite.validate(state)?;
    if let Some(message) = validation.message {
        return Err(ClientError::Invalid(message));
    }

    let action = match mode {
        CohortMode::Add => BroadcastAction::AddCohort {
            cohort: cohort.to_string(),
            targets: ships.clone(),
        },
        CohortMode::Del => BroadcastAction::DelCohort {
            cohort: cohort.to_string(),
            targets: ships.clone(),
        },
    };

    let id = cohort.to_string();
    let key = EntityKey::Cohort(id.clone());
    let mutation = Mutation::new("edit cohort", action.to_poke())
        .field(key, fields::TARGETS)
        .patch(move |txn| {
            let mut record = txn.db().find_cohort(&id)?.unwrap_or_else(|| Cohort {
                id: id.clone(),
                targets: Vec::new(),
            });
            match mode {
                CohortMode::Add => {
                    for ship in &ships {
                        if !record.targets.contains(ship) {
                            record.targets.push(ship.clone());
                        }
                    }
                }
                CohortMode::Del => record.targets.retain(|t| !ships.contains(t)),
            }
            txn.upsert(&Entity::Cohort(record))
        });

    let result = state.coordinator.mutate(mutation).await;
    refetch(state).await;
    result
}

/// Create a cohort named `name`. Unlike edits this waits for the ship, then
/// returns the new cohort's tag.
pub async fn create_cohort(state: &ClientState, name: &str, targets: Vec<Ship>) -> Result<String> {
    if name.trim().is_empty() {
        return Err(ClientError::Invalid("A cohort needs a name".to_string()));
    }
    let tag = string_to_ta(name);
    let action = BroadcastAction::AddCohort {
        cohort: tag.clone(),
        targets,
    };
    let result = state.gateway.request(&action.to_poke()).await;
    refetch(state).await;
    result?;
    info!(cohort = %tag, "cohort created");
    Ok(tag)
}

async fn refetch(state: &ClientState) {
    if let Err(e) = state.sync.refresh(&Scope::Cohorts).await {
        warn!(error = %e, "cohort refetch failed");
    }
}

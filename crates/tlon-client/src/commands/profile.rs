use serde::{Deserialize, Serialize};
use tracing::info;

use tlon_shared::protocol::ContactAction;
use tlon_shared::{ContactProfile, GroupId};
use tlon_store::{Contact, Entity, EntityKey};

use crate::error::{ClientError, Result};
use crate::mutation::Mutation;
use crate::state::ClientState;
use crate::sync::fields;

/// Changes to our own profile. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileEdit {
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub color: Option<String>,
}

impl ProfileEdit {
    fn apply_to(&self, profile: &mut ContactProfile) {
        if let Some(nickname) = &self.nickname {
            profile.nickname = nickname.clone();
        }
        if let Some(avatar) = &self.avatar {
            profile.avatar = avatar.clone();
        }
        if let Some(bio) = &self.bio {
            profile.bio = bio.clone();
        }
        if let Some(color) = &self.color {
            profile.color = color.clone();
        }
    }
}

pub async fn update_profile(state: &ClientState, edit: ProfileEdit) -> Result<ContactProfile> {
    let profile = edit_own_profile(state, "update profile", |profile| {
        edit.apply_to(profile);
        Ok(())
    })
    .await?;
    info!(nickname = %profile.nickname, "profile updated");
    Ok(profile)
}

/// Show `group` on our profile.
pub async fn pin_group(state: &ClientState, group: &GroupId) -> Result<()> {
    if !state.store.read(|db| db.group_exists(group))? {
        return Err(ClientError::NotFound(format!("Group {group}")));
    }
    let group = group.clone();
    edit_own_profile(state, "pin group", move |profile| {
        if !profile.groups.contains(&group) {
            profile.groups.push(group.clone());
        }
        Ok(())
    })
    .await?;
    Ok(())
}

pub async fn unpin_group(state: &ClientState, group: &GroupId) -> Result<()> {
    let group = group.clone();
    edit_own_profile(state, "unpin group", move |profile| {
        profile.groups.retain(|g| g != &group);
        Ok(())
    })
    .await?;
    Ok(())
}

/// Compute the new profile from the stored one and write it optimistically.
/// The poke carries the whole profile, so the ship ends up with exactly what
/// the store shows.
async fn edit_own_profile(
    state: &ClientState,
    label: &str,
    change: impl FnOnce(&mut ContactProfile) -> Result<()>,
) -> Result<ContactProfile> {
    let own = state.own().clone();
    let mut profile = state
        .store
        .read(|db| db.find_contact(&own))?
        .map(|c| c.to_profile())
        .unwrap_or_default();
    change(&mut profile)?;

    let poke = ContactAction::Profile(profile.clone()).to_poke();
    let next = profile.clone();
    let mutation = Mutation::new(label, poke)
        .field(EntityKey::Contact(own.clone()), fields::PROFILE)
        .patch(move |txn| txn.upsert(&Entity::Contact(Contact::from_profile(own.clone(), next.clone()))));
    state.coordinator.mutate(mutation).await?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, Harness};
    use tlon_api::PokeReply;
    use tlon_shared::GroupMeta;
    use tlon_store::Group;

    fn own_contact(h: &Harness) -> Contact {
        h.state.store.read(|db| db.get_contact(h.state.own())).unwrap()
    }

    #[tokio::test]
    async fn partial_edit_keeps_other_fields() {
        let h = Harness::new(fast_config());
        update_profile(
            &h.state,
            ProfileEdit {
                nickname: Some("Zod".into()),
                bio: Some("first".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        update_profile(
            &h.state,
            ProfileEdit {
                bio: Some("second".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let contact = own_contact(&h);
        assert_eq!(contact.nickname, "Zod");
        assert_eq!(contact.bio, "second");
        assert_eq!(h.ship.pokes_with_mark("contact-action-1").len(), 2);
    }

    #[tokio::test]
    async fn pinning_round_trip() {
        let h = Harness::new(fast_config());
        let id: GroupId = "~zod/test".parse().unwrap();
        h.state
            .store
            .upsert([Entity::Group(Group::new(id.clone(), GroupMeta::titled("Test")))])
            .unwrap();

        pin_group(&h.state, &id).await.unwrap();
        pin_group(&h.state, &id).await.unwrap();
        assert_eq!(own_contact(&h).pinned_groups, vec![id.clone()]);

        h.ship.script_poke("contact-action-1", PokeReply::Nack("no".into()));
        assert!(unpin_group(&h.state, &id).await.is_err());
        assert_eq!(own_contact(&h).pinned_groups, vec![id.clone()]);

        unpin_group(&h.state, &id).await.unwrap();
        assert!(own_contact(&h).pinned_groups.is_empty());
    }

    #[tokio::test]
    async fn unknown_group_cannot_be_pinned() {
        let h = Harness::new(fast_config());
        let id: GroupId = "~zod/nope".parse().unwrap();
        assert!(matches!(pin_group(&h.state, &id).await, Err(ClientError::NotFound(_))));
        assert!(h.ship.pokes().is_empty());
    }
}

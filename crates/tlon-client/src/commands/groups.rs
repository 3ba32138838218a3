//! Group commands.

use std::collections::BTreeMap;

use tracing::{error, info, warn};

use tlon_shared::constants::{DEFAULT_CHANNEL_NAME, DEFAULT_CHANNEL_TITLE};
use tlon_shared::protocol::{
    leave_group_poke, paths, ChannelCreate, GroupCreate, GroupDiff, GroupPreviews, GroupUpdate, Poke,
};
use tlon_shared::story::Nil;
use tlon_shared::{ChannelId, ChannelKind, GroupId, GroupMeta, LogicalTime, Privacy, Ship};
use tlon_store::{Channel, Entity, EntityKey, Group};

use crate::error::{ClientError, Result};
use crate::mutation::Mutation;
use crate::state::ClientState;
use crate::sync::{fields, Scope};

/// What the user typed into the new-group form.
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub title: String,
    /// Becomes the group's name: `~host/short_code`.
    pub short_code: String,
    pub description: String,
    pub privacy: Privacy,
}

impl NewGroup {
    pub fn new(title: impl Into<String>, short_code: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            short_code: short_code.into(),
            description: String::new(),
            privacy: Privacy::default(),
        }
    }
}

/// Create a group with its default channel and wait until both are in the
/// store.
///
/// Every failure surfaces as the same generic error. Whatever the attempt
/// left behind locally is removed first, and a group the ship already
/// created is deleted there too.
pub async fn create_group(state: &ClientState, new: NewGroup) -> Result<(Group, Channel)> {
    let host = state.own().clone();
    let id = match GroupId::new(host.clone(), new.short_code.clone()) {
        Ok(id) => id,
        Err(e) => {
            error!(short_code = %new.short_code, error = %e, "invalid group name");
            return Err(ClientError::generic());
        }
    };

    if state.store.read(|db| db.group_exists(&id))? {
        warn!(group = %id, "group already exists");
        return Err(ClientError::generic());
    }

    info!(group = %id, "creating group");
    if let Err(e) = request_group(state, &id, &new).await {
        error!(group = %id, error = %e, "failed to create group");
        if let Err(cleanup) = remove_local_group(state, &id) {
            warn!(group = %id, error = %cleanup, "cleanup after failed create");
        }
        return Err(ClientError::generic());
    }

    match finish_group(state, &host, &id).await {
        Ok(created) => Ok(created),
        Err(e) => {
            error!(group = %id, error = %e, "failed to set up new group");
            // Best effort: left on the ship, the group comes back with the
            // next groups update.
            let undo = GroupUpdate::new(id.clone(), LogicalTime::now(), GroupDiff::Del(Nil)).to_poke();
            if let Err(e) = state.gateway.request(&undo).await {
                warn!(group = %id, error = %e, "could not delete half-created group");
            }
            if let Err(cleanup) = remove_local_group(state, &id) {
                warn!(group = %id, error = %cleanup, "cleanup after failed create");
            }
            Err(ClientError::generic())
        }
    }
}

async fn request_group(state: &ClientState, id: &GroupId, new: &NewGroup) -> Result<()> {
    let create = GroupCreate {
        name: id.name.clone(),
        title: new.title.clone(),
        description: new.description.clone(),
        image: String::new(),
        cover: String::new(),
        privacy: new.privacy,
        members: BTreeMap::new(),
    };
    state.gateway.request(&create.to_poke()).await?;
    Ok(())
}

async fn finish_group(state: &ClientState, host: &Ship, id: &GroupId) -> Result<(Group, Channel)> {
    info!(group = %id, "group created, adding default channel");

    let channel = ChannelCreate {
        kind: ChannelKind::Chat,
        group: id.clone(),
        name: DEFAULT_CHANNEL_NAME.to_string(),
        title: DEFAULT_CHANNEL_TITLE.to_string(),
        description: String::new(),
        readers: Vec::new(),
        writers: Vec::new(),
    };
    state.gateway.request(&channel.to_poke()).await?;

    state.sync.sync_new_group(id).await?;
    // Registers us as a member of the new channel.
    state.sync.sync_unreads().await?;

    let default_channel = ChannelId::nest(ChannelKind::Chat, host, DEFAULT_CHANNEL_NAME)?;
    let (group, channels) = state.store.read(|db| {
        Ok((db.find_group(id)?, db.channels_for_group(id)?))
    })?;
    let group = group.ok_or_else(|| ClientError::NotFound(format!("Group {id}")))?;
    let channel = channels
        .iter()
        .find(|c| c.id == default_channel)
        .or_else(|| channels.first())
        .cloned()
        .ok_or_else(|| ClientError::NotFound(format!("Channels of {id}")))?;
    Ok((group, channel))
}

fn remove_local_group(state: &ClientState, id: &GroupId) -> Result<()> {
    state.sync.teardown(&Scope::Group(id.clone()));
    state.store.write(|txn| {
        for channel in txn.db().channels_for_group(id)? {
            txn.purge_channel(&channel.id)?;
        }
        txn.remove(&EntityKey::Group(id.clone()))?;
        txn.db().clear_clocks(&EntityKey::Group(id.clone()))?;
        Ok(())
    })?;
    Ok(())
}

pub async fn set_group_metadata(state: &ClientState, id: &GroupId, meta: GroupMeta) -> Result<()> {
    if !state.store.read(|db| db.group_exists(id))? {
        return Err(ClientError::NotFound(format!("Group {id}")));
    }
    let poke = GroupUpdate::new(id.clone(), LogicalTime::now(), GroupDiff::Meta(meta.clone())).to_poke();
    let flag = id.clone();
    let mutation = Mutation::new("edit group", poke)
        .field(EntityKey::Group(id.clone()), fields::META)
        .patch(move |txn| {
            if let Some(mut group) = txn.db().find_group(&flag)? {
                group.meta = meta.clone();
                txn.upsert(&Entity::Group(group))?;
            }
            Ok(())
        });
    state.coordinator.mutate(mutation).await
}

/// Delete a group we host. It disappears locally right away; its posts are
/// purged once the ship confirms.
pub async fn delete_group(state: &ClientState, id: &GroupId) -> Result<()> {
    let poke = GroupUpdate::new(id.clone(), LogicalTime::now(), GroupDiff::Del(Nil)).to_poke();
    drop_group(state, id, "delete group", poke).await
}

pub async fn leave_group(state: &ClientState, id: &GroupId) -> Result<()> {
    drop_group(state, id, "leave group", leave_group_poke(id)).await
}

async fn drop_group(state: &ClientState, id: &GroupId, label: &str, poke: Poke) -> Result<()> {
    let channels: Vec<ChannelId> = state
        .store
        .read(|db| db.channels_for_group(id))?
        .into_iter()
        .map(|c| c.id)
        .collect();

    let mut mutation = Mutation::new(label, poke).field(EntityKey::Group(id.clone()), fields::META);
    for channel in &channels {
        mutation = mutation.target(EntityKey::Channel(channel.clone()));
    }

    let flag = id.clone();
    let patch_channels = channels.clone();
    let mutation = mutation
        .patch(move |txn| {
            for channel in &patch_channels {
                txn.remove(&EntityKey::Channel(channel.clone()))?;
            }
            txn.remove(&EntityKey::Group(flag.clone()))?;
            Ok(())
        })
        .on_ack(move |txn| {
            for channel in &channels {
                txn.purge_channel(channel)?;
            }
            Ok(())
        });

    let scope = Scope::Group(id.clone());
    state.sync.teardown(&scope);
    let result = state.coordinator.mutate(mutation).await;
    if result.is_err() {
        // The group is back; keep it in sync again.
        let _ = state.sync.ensure(scope);
    }
    result
}

/// Groups `host` runs, as previews. Groups already known locally are left
/// as they are.
pub async fn get_groups_hosted_by(state: &ClientState, host: &Ship) -> Result<Vec<Group>> {
    let (app, path) = paths::hosted_by_scry(host);
    let previews: GroupPreviews = match state.gateway.scry_as(app, &path).await {
        Ok(previews) => previews,
        Err(e) => {
            warn!(%host, error = %e, "hosted groups lookup failed");
            return Err(ClientError::Generic(format!("Couldn't find groups hosted by {host}")));
        }
    };

    let ids: Vec<GroupId> = previews.keys().cloned().collect();
    state.store.write(|txn| {
        for (id, preview) in &previews {
            let mut group = Group::new(id.clone(), preview.meta.clone());
            group.privacy = preview.privacy;
            group.joined = false;
            if txn.db().insert_group_if_absent(&group)? {
                txn.touch(EntityKey::Group(id.clone()));
            }
        }
        Ok(())
    })?;

    let groups = state.store.read(|db| {
        let mut found = Vec::new();
        for id in &ids {
            if let Some(group) = db.find_group(id)? {
                found.push(group);
            }
        }
        Ok(found)
    })?;
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, Harness};
    use tlon_api::PokeReply;
    use tlon_shared::protocol::GroupPreview;

    #[tokio::test]
    async fn existing_group_is_not_recreated_or_removed() {
        let h = Harness::new(fast_config());
        let id: GroupId = "~zod/test".parse().unwrap();
        h.state
            .store
            .upsert([Entity::Group(Group::new(id.clone(), GroupMeta::titled("Mine")))])
            .unwrap();

        let err = create_group(&h.state, NewGroup::new("Test", "test")).await.unwrap_err();
        assert_eq!(err.user_message(), "Something went wrong");
        assert!(h.ship.pokes().is_empty());
        assert!(h.state.store.read(|db| db.group_exists(&id)).unwrap());
    }

    #[tokio::test]
    async fn rejected_edit_keeps_old_title() {
        let h = Harness::new(fast_config());
        let id: GroupId = "~zod/test".parse().unwrap();
        h.state
            .store
            .upsert([Entity::Group(Group::new(id.clone(), GroupMeta::titled("Old")))])
            .unwrap();
        h.ship.script_poke("group-action-4", PokeReply::Nack("not admin".into()));

        assert!(set_group_metadata(&h.state, &id, GroupMeta::titled("New")).await.is_err());
        let group = h.state.store.read(|db| db.get_group(&id)).unwrap();
        assert_eq!(group.meta.title, "Old");
    }

    #[tokio::test]
    async fn failed_delete_brings_channels_back() {
        let h = Harness::new(fast_config());
        let id: GroupId = "~zod/test".parse().unwrap();
        let nest: ChannelId = "chat/~zod/general".parse().unwrap();
        h.state
            .store
            .upsert([
                Entity::Group(Group::new(id.clone(), GroupMeta::titled("Test"))),
                Entity::Channel(Channel::new(nest.clone(), Some(id.clone()), Default::default())),
            ])
            .unwrap();
        h.ship.script_poke("group-action-4", PokeReply::Nack("no".into()));

        assert!(delete_group(&h.state, &id).await.is_err());
        assert!(h.state.store.read(|db| db.channel_exists(&nest)).unwrap());
        assert!(h.state.store.read(|db| db.group_exists(&id)).unwrap());
        assert!(h.state.sync.state_watch(&Scope::Group(id.clone())).is_some());

        delete_group(&h.state, &id).await.unwrap();
        assert!(!h.state.store.read(|db| db.group_exists(&id)).unwrap());
        assert!(!h.state.store.read(|db| db.channel_exists(&nest)).unwrap());
    }

    #[tokio::test]
    async fn hosted_previews_do_not_overwrite_joined_groups() {
        let h = Harness::new(fast_config());
        let joined: GroupId = "~bus/joined".parse().unwrap();
        h.state
            .store
            .upsert([Entity::Group(Group::new(joined.clone(), GroupMeta::titled("Local")))])
            .unwrap();

        let mut previews = GroupPreviews::new();
        for (flag, title) in [("~bus/joined", "Remote"), ("~bus/other", "Other")] {
            previews.insert(
                flag.parse().unwrap(),
                GroupPreview {
                    meta: GroupMeta::titled(title),
                    privacy: Privacy::Public,
                    member_count: 3,
                },
            );
        }
        h.ship.set_scry("groups", "/v1/hosted/~bus", serde_json::to_value(&previews).unwrap());

        let host: Ship = "~bus".parse().unwrap();
        let groups = get_groups_hosted_by(&h.state, &host).await.unwrap();
        let titles: Vec<&str> = groups.iter().map(|g| g.meta.title.as_str()).collect();
        assert_eq!(titles, vec!["Local", "Other"]);
        assert!(!groups[1].joined);

        h.ship.remove_scry("groups", "/v1/hosted/~bus");
        let err = get_groups_hosted_by(&h.state, &host).await.unwrap_err();
        assert_eq!(err.user_message(), "Couldn't find groups hosted by ~bus");
    }
}

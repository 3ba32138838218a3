//! End-to-end behavior of the client against an in-memory ship.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tlon_api::{Backoff, MemoryShip, PokeReply};
use tlon_client::commands::cohorts::{CohortInvite, CohortMode};
use tlon_client::commands::groups::{create_group, set_group_metadata, NewGroup};
use tlon_client::{Client, ClientConfig, ClientEvent, Scope};
use tlon_shared::protocol::{ChannelDelta, ChannelResponse, GroupDiff, GroupUpdate, PostSnapshot, Update};
use tlon_shared::{ChannelId, ChannelMeta, GroupId, GroupMeta, LogicalTime, PostId, Ship, Story};
use tlon_store::{Channel, Cohort, Entity, Group, LocalStore};

fn config() -> ClientConfig {
    ClientConfig {
        poke_timeout: Duration::from_millis(200),
        backoff: Backoff {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2.0,
            max_attempts: 8,
        },
        max_sync_retries: 8,
        ..ClientConfig::default()
    }
}

fn setup() -> (Arc<MemoryShip>, Client) {
    let ship = Arc::new(MemoryShip::new());
    ship.set_scry("activity", "/v4/unreads", json!({}));
    let store = LocalStore::open_in_memory().unwrap();
    let client = Client::from_parts(config(), store, ship.clone());
    (ship, client)
}

async fn eventually(mut pred: impl FnMut() -> bool) {
    for _ in 0..400 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn title(client: &Client, id: &GroupId) -> String {
    client.state().store.read(|db| db.get_group(id)).unwrap().meta.title
}

fn push(ship: &MemoryShip, path: &str, update: Update) {
    let event = update.to_event();
    ship.push(&event.app, path, &event.mark, event.json);
}

fn meta_update(flag: &str, time: LogicalTime, title: &str) -> Update {
    Update::Group(GroupUpdate::new(
        flag.parse().unwrap(),
        time,
        GroupDiff::Meta(GroupMeta::titled(title)),
    ))
}

async fn live_groups(ship: &MemoryShip, client: &Client, groups: serde_json::Value) {
    ship.set_scry("groups", "/v2/groups", groups);
    let mut loading = client.state().sync.ensure(Scope::Groups);
    loading.wait_for(|l| !*l).await.unwrap();
}

#[tokio::test]
async fn create_group_yields_group_with_one_channel() {
    let (ship, client) = setup();
    ship.handle_pokes(|ship, poke| {
        match poke.mark.as_str() {
            "group-create" => {
                ship.set_scry("groups", "/v2/groups/~zod/test", json!({ "meta": { "title": "Test" } }));
            }
            "channel-action-1" => {
                ship.set_scry(
                    "groups",
                    "/v2/groups/~zod/test",
                    json!({
                        "meta": { "title": "Test" },
                        "channels": { "chat/~zod/general": { "meta": { "title": "General" } } },
                        "order": ["chat/~zod/general"]
                    }),
                );
                ship.set_scry("activity", "/v4/unreads", json!({ "chat/~zod/general": { "count": 0 } }));
            }
            _ => {}
        }
        PokeReply::Ack
    });

    let (group, channel) = create_group(client.state(), NewGroup::new("Test", "test")).await.unwrap();
    assert_eq!(group.id.to_string(), "~zod/test");
    assert_eq!(group.meta.title, "Test");
    assert_eq!(channel.id.to_string(), "chat/~zod/general");

    let channels = client.state().store.read(|db| db.channels_for_group(&group.id)).unwrap();
    assert_eq!(channels.len(), 1);
}

#[tokio::test]
async fn failed_default_channel_leaves_no_group() {
    let (ship, client) = setup();
    ship.set_scry("groups", "/v2/groups", json!({}));
    ship.handle_pokes(|ship, poke| {
        match poke.mark.as_str() {
            "group-create" => {
                ship.set_scry("groups", "/v2/groups/~zod/test", json!({ "meta": { "title": "Test" } }));
                ship.set_scry("groups", "/v2/groups", json!({ "~zod/test": { "meta": { "title": "Test" } } }));
            }
            "group-action-4" => {
                ship.remove_scry("groups", "/v2/groups/~zod/test");
                ship.set_scry("groups", "/v2/groups", json!({}));
            }
            _ => {}
        }
        PokeReply::Ack
    });
    ship.script_poke("channel-action-1", PokeReply::Nack("channel refused".into()));

    let err = create_group(client.state(), NewGroup::new("Test", "test")).await.unwrap_err();
    assert_eq!(err.user_message(), "Something went wrong");
    assert_eq!(ship.pokes_with_mark("group-action-4").len(), 1);

    let id: GroupId = "~zod/test".parse().unwrap();
    assert!(!client.state().store.read(|db| db.group_exists(&id)).unwrap());
    assert!(client.state().store.read(|db| db.channels_for_group(&id)).unwrap().is_empty());

    // The group list from the ship does not bring it back either.
    let mut loading = client.state().sync.ensure(Scope::Groups);
    loading.wait_for(|l| !*l).await.unwrap();
    assert!(!client.state().store.read(|db| db.group_exists(&id)).unwrap());
}

#[tokio::test]
async fn cohort_members_already_present_are_flagged() {
    let (_ship, client) = setup();
    let ships: Vec<Ship> = vec!["~bob".parse().unwrap(), "~sam".parse().unwrap()];
    client
        .state()
        .store
        .upsert([Entity::Cohort(Cohort {
            id: "~zod/cohort1".into(),
            targets: ships.clone(),
        })])
        .unwrap();

    let invite = CohortInvite {
        mode: CohortMode::Add,
        cohort: Some("~zod/cohort1".into()),
        selected: ships.clone(),
    };
    let validation = invite.validate(client.state()).unwrap();
    assert_eq!(validation.invalid_ships, ships);
    assert!(validation.show_error);
    assert_eq!(
        validation.message.as_deref(),
        Some("~bob and ~sam are already in this chat.")
    );
}

#[tokio::test]
async fn stale_remote_title_loses_to_newer_local_edit() {
    let (ship, client) = setup();
    live_groups(
        &ship,
        &client,
        json!({
            "~zod/test": { "meta": { "title": "Old" } },
            "~zod/other": { "meta": { "title": "Other" } }
        }),
    )
    .await;
    let id: GroupId = "~zod/test".parse().unwrap();

    set_group_metadata(client.state(), &id, GroupMeta::titled("New")).await.unwrap();
    let t2 = LogicalTime::now();

    // Written at T1, before the local edit, but delivered after it.
    push(&ship, "/v1/groups", meta_update("~zod/test", LogicalTime(t2.0 - 60_000), "Stale"));
    push(&ship, "/v1/groups", meta_update("~zod/other", LogicalTime::now(), "Marker"));

    let other: GroupId = "~zod/other".parse().unwrap();
    eventually(|| title(&client, &other) == "Marker").await;
    assert_eq!(title(&client, &id), "New");
}

#[tokio::test]
async fn rejected_edit_rolls_back_and_reports() {
    let (ship, client) = setup();
    let id: GroupId = "~zod/test".parse().unwrap();
    client
        .state()
        .store
        .upsert([Entity::Group(Group::new(id.clone(), GroupMeta::titled("Old")))])
        .unwrap();
    let mut events = client.events();
    ship.script_poke("group-action-4", PokeReply::Nack("not an admin".into()));

    let err = set_group_metadata(client.state(), &id, GroupMeta::titled("New")).await.unwrap_err();
    assert!(err.is_rejection());
    assert_eq!(title(&client, &id), "Old");
    assert!(client.state().coordinator.in_flight().is_empty());

    loop {
        if let ClientEvent::MutationRolledBack { label, .. } = events.recv().await.unwrap() {
            assert_eq!(label, "edit group");
            break;
        }
    }
}

#[tokio::test]
async fn events_apply_in_arrival_order() {
    let (ship, client) = setup();
    live_groups(&ship, &client, json!({ "~zod/test": { "meta": { "title": "0" } } })).await;
    let id: GroupId = "~zod/test".parse().unwrap();

    let base = LogicalTime::now().0;
    for i in 1..=5 {
        push(&ship, "/v1/groups", meta_update("~zod/test", LogicalTime(base + i), &i.to_string()));
    }
    eventually(|| title(&client, &id) == "5").await;
}

#[tokio::test]
async fn posts_are_deduplicated_and_ordered_by_id() {
    let (ship, client) = setup();
    let group: GroupId = "~zod/test".parse().unwrap();
    let nest: ChannelId = "chat/~zod/general".parse().unwrap();
    client
        .state()
        .store
        .upsert([
            Entity::Group(Group::new(group.clone(), GroupMeta::titled("Test"))),
            Entity::Channel(Channel::new(nest.clone(), Some(group), ChannelMeta::default())),
        ])
        .unwrap();
    ship.set_scry("channels", "/v2/chat/~zod/general/posts/newest/50", json!({}));
    let mut loading = client.state().sync.ensure(Scope::Channel(nest.clone()));
    loading.wait_for(|l| !*l).await.unwrap();

    let post = |id: PostId, text: &str| {
        Update::Channel(ChannelResponse {
            nest: nest.clone(),
            time: LogicalTime::now(),
            response: ChannelDelta::Post {
                id,
                post: Some(PostSnapshot {
                    author: "~bob".parse().unwrap(),
                    sent: id.to_time().timestamp_millis(),
                    content: Story::text(text),
                    reacts: Default::default(),
                    reply_count: 0,
                    edited: false,
                }),
            },
        })
    };
    let first = PostId::from_time(chrono::Utc::now() - chrono::Duration::seconds(10));
    let second = PostId::from_time(chrono::Utc::now());

    // The newer post arrives first; the older one arrives twice.
    push(&ship, "/v2/chat/~zod/general", post(second, "again"));
    push(&ship, "/v2/chat/~zod/general", post(first, "hello"));
    push(&ship, "/v2/chat/~zod/general", post(first, "hello"));

    let ids = || -> Vec<PostId> {
        client
            .state()
            .store
            .read(|db| db.posts_for_channel(&nest, 50))
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect()
    };
    eventually(|| ids().len() >= 2).await;
    // Let the duplicate land too.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ids(), vec![first, second]);
}

#[tokio::test]
async fn missed_changes_are_recovered_after_a_kick() {
    let (ship, client) = setup();
    live_groups(
        &ship,
        &client,
        json!({
            "~zod/a": { "meta": { "title": "A" } },
            "~zod/b": { "meta": { "title": "B" } }
        }),
    )
    .await;
    let mut groups = client.queries().groups();

    // While the subscription is down, b is deleted and a renamed.
    ship.set_scry("groups", "/v2/groups", json!({ "~zod/a": { "meta": { "title": "A2" } } }));
    ship.quit("groups", "/v1/groups");

    let state = groups
        .wait_for(|s| {
            s.data
                .as_ref()
                .is_some_and(|g| g.len() == 1 && g[0].meta.title == "A2")
        })
        .await;
    assert!(state.is_some());
}

#[tokio::test]
async fn resync_restores_ship_state_when_its_clock_runs_ahead() {
    let (ship, client) = setup();
    live_groups(&ship, &client, json!({ "~zod/test": { "meta": { "title": "A1" } } })).await;
    let id: GroupId = "~zod/test".parse().unwrap();

    // The ship stamps its updates a minute ahead of our clock.
    let ahead = LogicalTime(LogicalTime::now().0 + 60_000);
    push(&ship, "/v1/groups", meta_update("~zod/test", ahead, "A2"));
    eventually(|| title(&client, &id) == "A2").await;

    ship.set_scry("groups", "/v2/groups", json!({ "~zod/test": { "meta": { "title": "A3" } } }));
    ship.quit("groups", "/v1/groups");
    eventually(|| title(&client, &id) == "A3").await;
}

#[tokio::test]
async fn logout_wipes_the_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tlon.db");
    let ship = Arc::new(MemoryShip::new());
    let id: GroupId = "~zod/test".parse().unwrap();

    let client = Client::from_parts(config(), LocalStore::open_at(&path).unwrap(), ship.clone());
    client
        .state()
        .store
        .upsert([Entity::Group(Group::new(id.clone(), GroupMeta::titled("Test")))])
        .unwrap();
    client.logout().unwrap();
    drop(client);

    let reopened = LocalStore::open_at(&path).unwrap();
    assert!(!reopened.read(|db| db.group_exists(&id)).unwrap());
}

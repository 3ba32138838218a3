//! Per-scope sync tasks.
//!
//! A scope task subscribes first so nothing is lost while the snapshot is in
//! flight, backfills from a scry, then applies events in arrival order. A
//! `Reset` from the gateway means events may have been missed, so the task
//! backfills again over live data. Every write a task makes checks the
//! scope's generation inside the transaction: a task whose scope was torn
//! down or restarted cannot touch the store any more.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tlon_api::{ApiError, ApiGateway, Backoff, Subscription, SubscriptionEvent};
use tlon_shared::protocol::{
    decode_event, decode_snapshot, paths, CohortsSnapshot, ContactsSnapshot, GroupSnapshot,
    GroupsSnapshot, PostsSnapshot, ShipEvent, UnreadsSnapshot,
};
use tlon_shared::{GroupId, LogicalTime, Ship};
use tlon_store::LocalStore;

use super::apply::{Applier, ApplyMode};
use super::{Scope, ScopeState, SyncDiff};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::mutation::SharedPending;

struct ScopeEntry {
    generation: u64,
    state: watch::Receiver<ScopeState>,
    loading: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

/// A decoded scry result for one scope.
enum ScopeSnapshot {
    Groups(GroupsSnapshot),
    Group(GroupSnapshot),
    Posts(PostsSnapshot),
    Unreads(UnreadsSnapshot),
    Contacts(ContactsSnapshot),
    Cohorts(CohortsSnapshot),
}

impl ScopeSnapshot {
    fn decode(scope: &Scope, value: Value) -> Result<Self> {
        Ok(match scope {
            Scope::Groups => Self::Groups(decode_snapshot("groups", value)?),
            Scope::Group(_) => Self::Group(decode_snapshot("group", value)?),
            Scope::Channel(_) => Self::Posts(decode_snapshot("posts", value)?),
            Scope::Unreads => Self::Unreads(decode_snapshot("unreads", value)?),
            Scope::Contacts => Self::Contacts(decode_snapshot("contacts", value)?),
            Scope::Cohorts => Self::Cohorts(decode_snapshot("cohorts", value)?),
        })
    }

    fn replace(&self, scope: &Scope, applier: &mut Applier<'_, '_>, time: LogicalTime) -> tlon_store::Result<()> {
        match (self, scope) {
            (Self::Groups(s), _) => applier.replace_groups(s, time),
            (Self::Group(s), Scope::Group(id)) => applier.replace_group(id, s, time),
            (Self::Posts(s), Scope::Channel(id)) => applier.replace_posts(id, s, time),
            (Self::Unreads(s), _) => applier.replace_unreads(s, time),
            (Self::Contacts(s), _) => applier.replace_contacts(s, time),
            (Self::Cohorts(s), _) => applier.replace_cohorts(s, time),
            _ => Ok(()),
        }
    }
}

struct Inner {
    store: LocalStore,
    gateway: ApiGateway,
    pending: SharedPending,
    events: EventBus,
    own: Ship,
    backoff: Backoff,
    post_window: usize,
    next_generation: AtomicU64,
    scopes: Mutex<HashMap<Scope, ScopeEntry>>,
}

/// Runs the sync tasks. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        gateway: ApiGateway,
        pending: SharedPending,
        events: EventBus,
        config: &ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                gateway,
                pending,
                events,
                own: config.ship.clone(),
                backoff: config.sync_backoff(),
                post_window: config.post_window,
                next_generation: AtomicU64::new(1),
                scopes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start the scopes every screen needs.
    pub fn start(&self) {
        self.ensure(Scope::Groups);
        self.ensure(Scope::Unreads);
    }

    /// Start `scope` unless it is already running. Returns its loading
    /// flag, which drops to `false` once the first backfill landed (or
    /// failed).
    pub fn ensure(&self, scope: Scope) -> watch::Receiver<bool> {
        let mut scopes = self.inner.scopes();
        if let Some(entry) = scopes.get(&scope) {
            if !entry.task.is_finished() {
                return entry.loading.clone();
            }
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let (state_tx, state_rx) = watch::channel(ScopeState::Uninitialized);
        let (loading_tx, loading_rx) = watch::channel(true);
        debug!(%scope, generation, "starting scope");
        let task = tokio::spawn(run_scope(
            self.inner.clone(),
            scope.clone(),
            generation,
            state_tx,
            loading_tx,
        ));
        scopes.insert(
            scope,
            ScopeEntry {
                generation,
                state: state_rx,
                loading: loading_rx.clone(),
                task,
            },
        );
        loading_rx
    }

    /// Stop `scope`. A backfill still in flight is discarded.
    pub fn teardown(&self, scope: &Scope) {
        let removed = self.inner.scopes().remove(scope);
        if let Some(entry) = removed {
            entry.task.abort();
            info!(%scope, "scope torn down");
            self.inner.events.emit(ClientEvent::ScopeState {
                scope: scope.clone(),
                state: ScopeState::Uninitialized,
            });
        }
    }

    /// Stop every scope.
    pub fn shutdown(&self) {
        let scopes: Vec<Scope> = self.inner.scopes().keys().cloned().collect();
        for scope in scopes {
            self.teardown(&scope);
        }
    }

    pub fn state(&self, scope: &Scope) -> ScopeState {
        self.inner
            .scopes()
            .get(scope)
            .map(|e| *e.state.borrow())
            .unwrap_or(ScopeState::Uninitialized)
    }

    pub fn state_watch(&self, scope: &Scope) -> Option<watch::Receiver<ScopeState>> {
        self.inner.scopes().get(scope).map(|e| e.state.clone())
    }

    /// Pull a freshly created group into the store. The ship may take a
    /// moment to expose it, so a missing group is retried with backoff.
    pub async fn sync_new_group(&self, id: &GroupId) -> Result<()> {
        let (app, path) = paths::group_scry(id);
        let gateway = &self.inner.gateway;
        let snapshot: GroupSnapshot = self
            .inner
            .backoff
            .retry(
                "new group",
                |e: &ApiError| matches!(e, ApiError::NotFound(_)) || e.is_transient(),
                || gateway.scry_as::<GroupSnapshot>(app, &path),
            )
            .await?;

        let pending = &self.inner.pending;
        let own = &self.inner.own;
        self.inner.store.write(|txn| {
            let mut pending = pending.lock();
            Applier::new(txn, &mut pending, own, ApplyMode::Backfill).replace_group(
                id,
                &snapshot,
                LogicalTime::now(),
            )
        })?;
        info!(group = %id, "new group synced");

        self.ensure(Scope::Group(id.clone()));
        Ok(())
    }

    /// One-shot unread snapshot.
    pub async fn sync_unreads(&self) -> Result<()> {
        self.refresh(&Scope::Unreads).await
    }

    /// Re-read `scope` from the ship once, outside of any running task.
    pub async fn refresh(&self, scope: &Scope) -> Result<()> {
        self.inner.backfill(scope, None).await.map(|_| ())
    }
}

impl Inner {
    fn scopes(&self) -> MutexGuard<'_, HashMap<Scope, ScopeEntry>> {
        self.scopes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, scope: &Scope, generation: Option<u64>) -> bool {
        match generation {
            None => true,
            Some(generation) => self
                .scopes()
                .get(scope)
                .is_some_and(|e| e.generation == generation),
        }
    }

    fn set_state(&self, scope: &Scope, tx: &watch::Sender<ScopeState>, state: ScopeState) {
        if *tx.borrow() == state {
            return;
        }
        debug!(%scope, ?state, "scope state");
        let _ = tx.send(state);
        self.events.emit(ClientEvent::ScopeState {
            scope: scope.clone(),
            state,
        });
    }

    async fn subscribe(&self, scope: &Scope) -> Result<Subscription> {
        let (app, path) = scope.watch_path();
        let sub = self
            .backoff
            .retry("subscribe", ApiError::is_transient, || self.gateway.subscribe(app, &path))
            .await?;
        Ok(sub)
    }

    /// Scry `scope` and replace its contents. `Ok(false)` when the result
    /// was discarded because the scope moved on to another generation.
    async fn backfill(&self, scope: &Scope, generation: Option<u64>) -> Result<bool> {
        let (app, path) = scope.scry_path(self.post_window);
        let value = self
            .backoff
            .retry("backfill", ApiError::is_transient, || self.gateway.scry(app, &path))
            .await?;
        let snapshot = ScopeSnapshot::decode(scope, value)?;

        let applied = self.store.write(|txn| {
            if !self.is_current(scope, generation) {
                return Ok(false);
            }
            let mut pending = self.pending.lock();
            let mut applier = Applier::new(txn, &mut pending, &self.own, ApplyMode::Backfill);
            snapshot.replace(scope, &mut applier, LogicalTime::now())?;
            Ok(true)
        })?;

        if applied {
            debug!(%scope, "backfill applied");
        } else {
            debug!(%scope, "stale backfill discarded");
        }
        Ok(applied)
    }

    fn apply_event(&self, scope: &Scope, generation: u64, event: &ShipEvent) {
        let update = match decode_event(event) {
            Ok(update) => update,
            Err(e) => {
                warn!(%scope, mark = %event.mark, error = %e, "undecodable event skipped");
                return;
            }
        };
        let diffs = SyncDiff::from_update(update, LogicalTime::now());

        let result = self.store.write(|txn| {
            if !self.is_current(scope, Some(generation)) {
                return Ok(());
            }
            let mut pending = self.pending.lock();
            let mut applier = Applier::new(txn, &mut pending, &self.own, ApplyMode::Live);
            for diff in &diffs {
                let outcome = applier.apply(diff)?;
                debug!(%scope, ?outcome, "event applied");
            }
            Ok(())
        });
        if let Err(e) = result {
            error!(%scope, error = %e, "failed to apply event");
        }
    }

    fn fail(&self, scope: &Scope, state: &watch::Sender<ScopeState>, loading: &watch::Sender<bool>, err: ClientError) {
        error!(%scope, error = %err, "sync failed");
        let _ = loading.send(false);
        self.set_state(scope, state, ScopeState::Uninitialized);
        self.events.emit(ClientEvent::SyncFailed {
            scope: scope.clone(),
            error: err.to_string(),
        });
    }
}

async fn run_scope(
    inner: Arc<Inner>,
    scope: Scope,
    generation: u64,
    state: watch::Sender<ScopeState>,
    loading: watch::Sender<bool>,
) {
    let mut resync = false;

    loop {
        let phase = if resync {
            ScopeState::Resyncing
        } else {
            ScopeState::Backfilling
        };
        inner.set_state(&scope, &state, phase);

        let mut sub = match inner.subscribe(&scope).await {
            Ok(sub) => sub,
            Err(e) => return inner.fail(&scope, &state, &loading, e),
        };

        match inner.backfill(&scope, Some(generation)).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => return inner.fail(&scope, &state, &loading, e),
        }
        let _ = loading.send(false);
        inner.set_state(&scope, &state, ScopeState::Live);

        loop {
            match sub.recv().await {
                Some(SubscriptionEvent::Event(event)) => inner.apply_event(&scope, generation, &event),
                Some(SubscriptionEvent::Reset) => {
                    warn!(%scope, "discontinuity, resyncing");
                    inner.set_state(&scope, &state, ScopeState::Resyncing);
                    match inner.backfill(&scope, Some(generation)).await {
                        Ok(true) => inner.set_state(&scope, &state, ScopeState::Live),
                        Ok(false) => return,
                        Err(e) => return inner.fail(&scope, &state, &loading, e),
                    }
                }
                Some(SubscriptionEvent::Closed) | None => break,
            }
        }

        warn!(%scope, "subscription closed, starting over");
        resync = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, wait_until, Harness};
    use serde_json::json;
    use tlon_shared::protocol::{GroupDiff, GroupUpdate, Update};
    use tlon_shared::GroupMeta;

    fn groups_with(titles: &[(&str, &str)]) -> Value {
        let snapshot: GroupsSnapshot = titles
            .iter()
            .map(|(flag, title)| {
                (
                    flag.parse().unwrap(),
                    GroupSnapshot {
                        meta: GroupMeta::titled(*title),
                        ..GroupSnapshot::default()
                    },
                )
            })
            .collect();
        serde_json::to_value(snapshot).unwrap()
    }

    fn titles(h: &Harness) -> Vec<String> {
        h.state
            .store
            .read(|db| db.list_groups())
            .unwrap()
            .into_iter()
            .map(|g| g.meta.title)
            .collect()
    }

    #[tokio::test]
    async fn backfill_then_live_events() {
        let h = Harness::new(fast_config());
        h.ship.set_scry("groups", "/v2/groups", groups_with(&[("~zod/a", "A")]));

        let mut loading = h.state.sync.ensure(Scope::Groups);
        loading.wait_for(|l| !*l).await.unwrap();
        assert_eq!(h.state.sync.state(&Scope::Groups), ScopeState::Live);
        assert_eq!(titles(&h), vec!["A"]);

        let event = Update::Group(GroupUpdate::new(
            "~zod/a".parse().unwrap(),
            LogicalTime::now(),
            GroupDiff::Meta(GroupMeta::titled("A2")),
        ))
        .to_event();
        h.ship.push("groups", "/v1/groups", &event.mark, event.json);
        wait_until(|| titles(&h) == vec!["A2"]).await;
    }

    #[tokio::test]
    async fn reset_backfills_again() {
        let h = Harness::new(fast_config());
        h.ship.set_scry(
            "groups",
            "/v2/groups",
            groups_with(&[("~zod/a", "A"), ("~zod/b", "B")]),
        );
        let mut loading = h.state.sync.ensure(Scope::Groups);
        loading.wait_for(|l| !*l).await.unwrap();
        assert_eq!(titles(&h).len(), 2);

        // Group b disappears while we are not listening.
        h.ship.set_scry("groups", "/v2/groups", groups_with(&[("~zod/a", "A")]));
        h.ship.quit("groups", "/v1/groups");
        wait_until(|| titles(&h) == vec!["A"]).await;
        wait_until(|| h.state.sync.state(&Scope::Groups) == ScopeState::Live).await;
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure() {
        let h = Harness::new(fast_config());
        let mut events = h.state.events.subscribe();
        h.ship.fail_scries(100);

        let mut loading = h.state.sync.ensure(Scope::Contacts);
        loading.wait_for(|l| !*l).await.unwrap();
        assert_eq!(h.state.sync.state(&Scope::Contacts), ScopeState::Uninitialized);

        loop {
            match events.recv().await.unwrap() {
                ClientEvent::SyncFailed { scope, .. } => {
                    assert_eq!(scope, Scope::Contacts);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn torn_down_scope_ignores_events() {
        let h = Harness::new(fast_config());
        h.ship.set_scry("groups", "/v2/groups", groups_with(&[("~zod/a", "A")]));
        let mut loading = h.state.sync.ensure(Scope::Groups);
        loading.wait_for(|l| !*l).await.unwrap();

        h.state.sync.teardown(&Scope::Groups);
        assert_eq!(h.state.sync.state(&Scope::Groups), ScopeState::Uninitialized);
        wait_until(|| h.ship.subscriber_count("groups", "/v1/groups") == 0).await;

        h.ship.push("groups", "/v1/groups", "group-update", json!({}));
        assert_eq!(titles(&h), vec!["A"]);
    }

    #[tokio::test]
    async fn new_group_is_polled_until_visible() {
        let h = Harness::new(fast_config());
        let flag: GroupId = "~zod/test".parse().unwrap();
        let ship = h.ship.clone();
        let value = serde_json::to_value(GroupSnapshot {
            meta: GroupMeta::titled("Test"),
            ..GroupSnapshot::default()
        })
        .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
            ship.set_scry("groups", "/v2/groups/~zod/test", value);
        });

        h.state.sync.sync_new_group(&flag).await.unwrap();
        let group = h.state.store.read(|db| db.get_group(&flag)).unwrap();
        assert_eq!(group.meta.title, "Test");
    }
}

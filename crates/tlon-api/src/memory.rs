//! In-process ship for tests and demos.
//!
//! Scries are answered from a table, pokes follow a per-mark script (ack by
//! default), and events are pushed to subscribers by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use tlon_shared::protocol::{Poke, ShipEvent};

use crate::error::{ApiError, Result};
use crate::transport::{ShipTransport, TransportEvent, TransportSubscription};

/// How the ship answers one poke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PokeReply {
    Ack,
    Nack(String),
    /// Never answer.
    Hang,
}

type PokeHandler = Arc<dyn Fn(&MemoryShip, &Poke) -> PokeReply + Send + Sync>;

struct Subscriber {
    app: String,
    path: String,
    tx: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct State {
    scries: HashMap<(String, String), Value>,
    scripts: HashMap<String, VecDeque<PokeReply>>,
    handler: Option<PokeHandler>,
    pokes: Vec<Poke>,
    subscribers: HashMap<u64, Subscriber>,
}

#[derive(Default)]
pub struct MemoryShip {
    state: Mutex<State>,
    next_id: AtomicU64,
    failing_subscribes: AtomicU32,
    failing_scries: AtomicU32,
}

impl MemoryShip {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_scry(&self, app: &str, path: &str, value: Value) {
        self.state()
            .scries
            .insert((app.to_string(), path.to_string()), value);
    }

    pub fn remove_scry(&self, app: &str, path: &str) {
        self.state()
            .scries
            .remove(&(app.to_string(), path.to_string()));
    }

    /// Queue a reply for the next poke with `mark`.
    pub fn script_poke(&self, mark: &str, reply: PokeReply) {
        self.state()
            .scripts
            .entry(mark.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Answer unscripted pokes with `handler`, which may also update the
    /// scry table to model the ship's side effects.
    pub fn handle_pokes<F>(&self, handler: F)
    where
        F: Fn(&MemoryShip, &Poke) -> PokeReply + Send + Sync + 'static,
    {
        self.state().handler = Some(Arc::new(handler));
    }

    /// Every poke received so far, in order.
    pub fn pokes(&self) -> Vec<Poke> {
        self.state().pokes.clone()
    }

    pub fn pokes_with_mark(&self, mark: &str) -> Vec<Poke> {
        self.state()
            .pokes
            .iter()
            .filter(|p| p.mark == mark)
            .cloned()
            .collect()
    }

    /// Deliver an event to every subscriber of `app`/`path`.
    pub fn push(&self, app: &str, path: &str, mark: &str, json: Value) {
        let event = ShipEvent {
            app: app.to_string(),
            mark: mark.to_string(),
            json,
        };
        for tx in self.senders(app, path) {
            let _ = tx.try_send(TransportEvent::Event(event.clone()));
        }
    }

    /// Kick every subscriber of `app`/`path`.
    pub fn quit(&self, app: &str, path: &str) {
        let kicked: Vec<Subscriber> = {
            let mut state = self.state();
            let ids: Vec<u64> = state
                .subscribers
                .iter()
                .filter(|(_, s)| s.app == app && s.path == path)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| state.subscribers.remove(id))
                .collect()
        };
        for sub in kicked {
            let _ = sub.tx.try_send(TransportEvent::Quit);
        }
    }

    /// Drop every subscription stream without a quit, like a lost connection.
    pub fn disconnect_all(&self) {
        self.state().subscribers.clear();
    }

    pub fn subscriber_count(&self, app: &str, path: &str) -> usize {
        self.state()
            .subscribers
            .values()
            .filter(|s| s.app == app && s.path == path)
            .count()
    }

    /// Make the next `n` subscribe calls fail.
    pub fn fail_subscribes(&self, n: u32) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` scries fail with a transient error.
    pub fn fail_scries(&self, n: u32) {
        self.failing_scries.store(n, Ordering::SeqCst);
    }

    fn senders(&self, app: &str, path: &str) -> Vec<mpsc::Sender<TransportEvent>> {
        self.state()
            .subscribers
            .values()
            .filter(|s| s.app == app && s.path == path)
            .map(|s| s.tx.clone())
            .collect()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ShipTransport for MemoryShip {
    async fn poke(&self, poke: &Poke) -> Result<()> {
        let (scripted, handler) = {
            let mut state = self.state();
            state.pokes.push(poke.clone());
            let scripted = state
                .scripts
                .get_mut(&poke.mark)
                .and_then(|queue| queue.pop_front());
            (scripted, state.handler.clone())
        };

        let reply = match (scripted, handler) {
            (Some(reply), _) => reply,
            (None, Some(handler)) => handler(self, poke),
            (None, None) => PokeReply::Ack,
        };

        match reply {
            PokeReply::Ack => Ok(()),
            PokeReply::Nack(reason) => Err(ApiError::Rejected(reason)),
            PokeReply::Hang => std::future::pending().await,
        }
    }

    async fn scry(&self, app: &str, path: &str) -> Result<Value> {
        if Self::take_failure(&self.failing_scries) {
            return Err(ApiError::Closed);
        }
        self.state()
            .scries
            .get(&(app.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("{app}{path}")))
    }

    async fn subscribe(&self, app: &str, path: &str) -> Result<TransportSubscription> {
        if Self::take_failure(&self.failing_subscribes) {
            return Err(ApiError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, events) = mpsc::channel(256);
        self.state().subscribers.insert(
            id,
            Subscriber {
                app: app.to_string(),
                path: path.to_string(),
                tx,
            },
        );
        Ok(TransportSubscription { id, events })
    }

    async fn unsubscribe(&self, id: u64) -> Result<()> {
        self.state().subscribers.remove(&id);
        Ok(())
    }
}

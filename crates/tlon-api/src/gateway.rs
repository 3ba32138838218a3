//! The API gateway: pokes with a bounded wait, scries, and self-healing
//! subscriptions.
//!
//! Every subscription runs in its own tokio task that forwards transport
//! events over an mpsc channel. When the ship kicks the subscription or the
//! stream is lost, the task re-subscribes with exponential backoff and
//! emits [`SubscriptionEvent::Reset`] so the consumer knows events may have
//! been missed. Dropping the [`Subscription`] handle unsubscribes.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tlon_shared::constants::DEFAULT_POKE_TIMEOUT_MS;
use tlon_shared::protocol::{decode_snapshot, Poke, ShipEvent};

use crate::backoff::Backoff;
use crate::error::{ApiError, Result};
use crate::transport::{ShipTransport, TransportEvent, TransportSubscription};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Positive acknowledgement of a poke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// Items delivered on a gateway [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Event(ShipEvent),
    /// The subscription was re-established; events may have been lost.
    Reset,
    /// Reconnecting failed for good. No further events follow.
    Closed,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub poke_timeout: Duration,
    pub reconnect: Backoff,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            poke_timeout: Duration::from_millis(DEFAULT_POKE_TIMEOUT_MS),
            reconnect: Backoff::default(),
        }
    }
}

#[derive(Clone)]
pub struct ApiGateway {
    transport: Arc<dyn ShipTransport>,
    config: GatewayConfig,
}

impl ApiGateway {
    pub fn new(transport: Arc<dyn ShipTransport>, config: GatewayConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Poke and wait for the ack. A missing answer after `poke_timeout` is
    /// [`ApiError::Timeout`]; a late ack is then ignored.
    pub async fn request(&self, poke: &Poke) -> Result<Ack> {
        debug!(app = %poke.app, mark = %poke.mark, "poke");
        match tokio::time::timeout(self.config.poke_timeout, self.transport.poke(poke)).await {
            Ok(Ok(())) => Ok(Ack),
            Ok(Err(e)) => {
                warn!(app = %poke.app, mark = %poke.mark, error = %e, "poke failed");
                Err(e)
            }
            Err(_) => {
                warn!(app = %poke.app, mark = %poke.mark, timeout = ?self.config.poke_timeout, "poke timed out");
                Err(ApiError::Timeout)
            }
        }
    }

    pub async fn scry(&self, app: &str, path: &str) -> Result<Value> {
        debug!(app, path, "scry");
        self.transport.scry(app, path).await
    }

    /// Scry and decode into a typed snapshot.
    pub async fn scry_as<T: DeserializeOwned>(&self, app: &str, path: &str) -> Result<T> {
        let value = self.scry(app, path).await?;
        Ok(decode_snapshot("scry", value)?)
    }

    /// Open a subscription. Fails only if the first subscribe fails.
    pub async fn subscribe(&self, app: &str, path: &str) -> Result<Subscription> {
        let initial = self.transport.subscribe(app, path).await?;
        info!(app, path, id = initial.id, "subscribed");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(run_subscription(
            self.transport.clone(),
            app.to_string(),
            path.to_string(),
            self.config.reconnect.clone(),
            initial,
            tx,
            cancel_rx,
        ));

        Ok(Subscription {
            app: app.to_string(),
            path: path.to_string(),
            rx,
            _cancel: cancel_tx,
        })
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    app: String,
    path: String,
    rx: mpsc::Receiver<SubscriptionEvent>,
    _cancel: oneshot::Sender<()>,
}

impl Subscription {
    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next event; `None` once the subscription is finished.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }
}

async fn run_subscription(
    transport: Arc<dyn ShipTransport>,
    app: String,
    path: String,
    backoff: Backoff,
    initial: TransportSubscription,
    out: mpsc::Sender<SubscriptionEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    let TransportSubscription { mut id, mut events } = initial;

    loop {
        let next = tokio::select! {
            _ = &mut cancel => None,
            event = events.recv() => Some(event),
        };

        match next {
            None => {
                debug!(app = %app, path = %path, id, "subscription dropped, unsubscribing");
                if let Err(e) = transport.unsubscribe(id).await {
                    debug!(id, error = %e, "unsubscribe failed");
                }
                return;
            }
            Some(Some(TransportEvent::Event(event))) => {
                if out.send(SubscriptionEvent::Event(event)).await.is_err() {
                    let _ = transport.unsubscribe(id).await;
                    return;
                }
            }
            Some(Some(TransportEvent::Quit)) | Some(None) => {
                warn!(app = %app, path = %path, id, "subscription lost, reconnecting");
                match resubscribe(transport.as_ref(), &app, &path, &backoff, &mut cancel).await {
                    Some(sub) => {
                        info!(app = %app, path = %path, id = sub.id, "resubscribed");
                        id = sub.id;
                        events = sub.events;
                        if out.send(SubscriptionEvent::Reset).await.is_err() {
                            let _ = transport.unsubscribe(id).await;
                            return;
                        }
                    }
                    None => {
                        let _ = out.send(SubscriptionEvent::Closed).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Re-subscribe with backoff. `None` when cancelled or out of attempts.
async fn resubscribe(
    transport: &dyn ShipTransport,
    app: &str,
    path: &str,
    backoff: &Backoff,
    cancel: &mut oneshot::Receiver<()>,
) -> Option<TransportSubscription> {
    for attempt in 0..backoff.max_attempts.max(1) {
        let delay = backoff.delay(attempt);
        tokio::select! {
            _ = &mut *cancel => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match transport.subscribe(app, path).await {
            Ok(sub) => return Some(sub),
            Err(e) => warn!(app, path, attempt, error = %e, "resubscribe failed"),
        }
    }
    warn!(app, path, "giving up on subscription");
    None
}

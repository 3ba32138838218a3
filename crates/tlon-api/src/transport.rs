//! The seam between the gateway and whatever actually reaches the ship.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use tlon_shared::protocol::{Poke, ShipEvent};

use crate::error::Result;

/// Raw item delivered on a transport-level subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Event(ShipEvent),
    /// The ship ended the subscription ("kick").
    Quit,
}

/// A transport-level subscription: its id and its event stream. The stream
/// ending without a `Quit` means the connection was lost.
pub struct TransportSubscription {
    pub id: u64,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait ShipTransport: Send + Sync + 'static {
    /// Send a poke and resolve once the ship acks (`Ok`) or nacks
    /// ([`ApiError::Rejected`](crate::ApiError::Rejected)).
    async fn poke(&self, poke: &Poke) -> Result<()>;

    /// Read a snapshot at `path` of `app`.
    async fn scry(&self, app: &str, path: &str) -> Result<Value>;

    async fn subscribe(&self, app: &str, path: &str) -> Result<TransportSubscription>;

    async fn unsubscribe(&self, id: u64) -> Result<()>;
}

//! Gateway to the ship: pokes with bounded waits, scries, and
//! subscriptions that heal themselves after a kick or a dropped stream.

pub mod backoff;
pub mod error;
pub mod eyre;
pub mod gateway;
pub mod memory;
pub mod transport;

pub use backoff::Backoff;
pub use error::{ApiError, Result};
pub use eyre::{EyreConfig, EyreTransport};
pub use gateway::{Ack, ApiGateway, GatewayConfig, Subscription, SubscriptionEvent};
pub use memory::{MemoryShip, PokeReply};
pub use transport::{ShipTransport, TransportEvent, TransportSubscription};

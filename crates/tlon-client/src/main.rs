use anyhow::Context;
use tracing::{info, warn};

use tlon_client::{logging, Client, ClientConfig, ClientEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = ClientConfig::from_env();
    info!(ship = %config.ship, url = %config.ship_url, "starting tlon-sync");

    let client = Client::connect(config).await.context("connecting to ship")?;
    client.start();

    let mut events = client.events();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::SyncFailed { scope, error }) => warn!(%scope, %error, "sync failed"),
                Ok(ClientEvent::MutationRolledBack { label, error }) => warn!(%label, %error, "change rolled back"),
                Ok(ClientEvent::ScopeState { scope, state }) => info!(%scope, ?state, "scope"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "event stream lagged"),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    client.state().sync.shutdown();
    Ok(())
}

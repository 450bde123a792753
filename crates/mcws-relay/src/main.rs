//! Relay binary.
//!
//! Usage: `mcws-relay [upstream-address] [listen-port]`
//!
//! Positional arguments override `MCWS_UPSTREAM` and the port of
//! `MCWS_LISTEN_ADDR`.

use std::sync::Arc;

use anyhow::Context;
use mcws_relay::{RelayConfig, serve};
use mcws_transport::{Listener, WsConnector};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = RelayConfig::from_env().context("Failed to load relay configuration")?;
    let mut args = std::env::args().skip(1);
    if let Some(upstream) = args.next() {
        config.upstream = upstream;
    }
    if let Some(port) = args.next() {
        let port = port
            .parse()
            .with_context(|| format!("Invalid listen port: {port}"))?;
        config.listen_addr.set_port(port);
    }

    let listener = Listener::bind(config.listener_config())
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen_addr))?;
    tracing::info!(
        "Enter '/connect <ip address>:{}' in game to establish a connection.",
        listener.local_addr().port()
    );
    tracing::info!("Connections will be relayed to {}", config.upstream);

    let registry = listener.registry();
    tokio::select! {
        () = serve(config, listener, Arc::new(WsConnector)) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            let closed = registry.close_all().await;
            tracing::info!(closed, "Shutting down");
        }
    }
    Ok(())
}

//! Accept loop pairing every game connection with an upstream connection.

use std::sync::Arc;

use mcws_core::Connector;
use mcws_transport::{AcceptedConnection, Listener};

use crate::{
    config::RelayConfig,
    relay::{Relay, RelayError},
};

/// Relay every connection accepted by `listener` until it stops.
pub async fn serve<C>(config: RelayConfig, mut listener: Listener, connector: Arc<C>)
where
    C: Connector + 'static,
{
    let config = Arc::new(config);
    while let Some(connection) = listener.accept().await {
        let config = Arc::clone(&config);
        let connector = Arc::clone(&connector);
        tokio::spawn(async move {
            let id = connection.id;
            if let Err(e) = relay_connection(&config, connection, connector.as_ref()).await {
                tracing::warn!(relay = id, "relay [{id}] ended: {e}");
            }
        });
    }
}

/// Dial upstream for one accepted game connection and run the relay.
///
/// # Errors
/// Returns error if the upstream connection cannot be opened (the game
/// connection is closed then) or the relay fails.
pub async fn relay_connection<C>(
    config: &RelayConfig,
    connection: AcceptedConnection,
    connector: &C,
) -> Result<(), RelayError>
where
    C: Connector + ?Sized,
{
    let AcceptedConnection {
        id,
        peer_addr,
        mut session,
        inbound,
        ..
    } = connection;
    tracing::info!(relay = id, %peer_addr, "<- [{id}] connected");

    let upstream = match connector.connect(&config.upstream).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let _ = session.disconnect(true);
            return Err(e.into());
        }
    };
    tracing::info!(relay = id, upstream = %config.upstream, "-> [{id}] connected");

    Relay::new(id, config, session, inbound, upstream).run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use async_trait::async_trait;
    use mcws_core::{Duplex, Inbound, TransportError, transport::memory_pair};
    use mcws_transport::{ListenerConfig, WsConnector};
    use tokio::sync::Mutex;

    use super::*;

    /// Hands out the relay's side of prepared in-memory pairs.
    struct MemoryConnector {
        ends: Mutex<Vec<Duplex>>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, _address: &str) -> Result<Duplex, TransportError> {
            self.ends
                .lock()
                .await
                .pop()
                .ok_or_else(|| TransportError::Connect("no upstream".to_string()))
        }
    }

    async fn listener() -> Listener {
        Listener::bind(ListenerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ListenerConfig::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_upstream_failure_closes_game() {
        let mut listener = listener().await;
        let mut game = WsConnector
            .connect(&listener.local_addr().to_string())
            .await
            .unwrap();
        let connection = listener.accept().await.unwrap();

        let connector = MemoryConnector {
            ends: Mutex::new(Vec::new()),
        };
        let result = relay_connection(&RelayConfig::default(), connection, &connector).await;
        assert!(matches!(result, Err(RelayError::Upstream(_))));

        let closed = tokio::time::timeout(Duration::from_secs(5), game.inbound.recv())
            .await
            .unwrap();
        assert!(matches!(closed, Some(Inbound::Closed)));
    }

    #[tokio::test]
    async fn test_serve_relays_each_connection() {
        let listener = listener().await;
        let addr = listener.local_addr();
        let (relay_end, mut upstream_end) = memory_pair();
        let connector = Arc::new(MemoryConnector {
            ends: Mutex::new(vec![relay_end]),
        });
        tokio::spawn(serve(RelayConfig::default(), listener, connector));

        let mut game = WsConnector.connect(&addr.to_string()).await.unwrap();
        game.outbound
            .send(mcws_core::WireMessage::Text(
                r#"{"header":{"messagePurpose":"event","version":1},"body":{"eventName":"Ready"}}"#
                    .to_string(),
            ))
            .unwrap();

        // Events are only published to subscribers; closing the game must
        // still tear down the upstream leg.
        game.outbound.close().unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match upstream_end.inbound.recv().await {
                    Some(Inbound::Closed) | None => return true,
                    Some(_) => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(closed);
    }
}

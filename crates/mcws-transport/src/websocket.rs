//! WebSocket transport: pumps a tungstenite stream through a [`Duplex`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mcws_core::{
    Connector, Duplex, Inbound, TransportError, WireMessage,
    transport::{Outbound, outbound_channel},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::{
    WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};

/// Drive `ws` from two tasks and expose it as a [`Duplex`].
///
/// The returned handle completes once the socket is closed and
/// [`Inbound::Closed`] has been delivered.
pub fn spawn_pumps<S>(ws: WebSocketStream<S>) -> (Duplex, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, mut outbound_rx) = outbound_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (mut sink, mut stream) = ws.split();

    // Spawn task to forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            let message = match item {
                Outbound::Message(WireMessage::Text(text)) => Message::Text(text.into()),
                Outbound::Message(WireMessage::Binary(data)) => Message::Binary(data),
                Outbound::Close => {
                    if let Err(e) = sink.close().await {
                        tracing::debug!("WebSocket close failed: {e}");
                    }
                    break;
                }
            };
            if let Err(e) = sink.send(message).await {
                tracing::debug!("WebSocket write failed: {e}");
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let item = match message {
                Ok(Message::Text(text)) => Inbound::Message(WireMessage::Text(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => Inbound::Message(WireMessage::Binary(data)),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "peer closed websocket");
                    break;
                }
                Ok(_) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
                Err(e) => {
                    tracing::warn!("WebSocket error: {e}");
                    let _ = inbound_tx.send(Inbound::Error(TransportError::WebSocket(e.to_string())));
                    break;
                }
            };
            if inbound_tx.send(item).is_err() {
                break;
            }
        }
        let _ = inbound_tx.send(Inbound::Closed);
        send_task.abort();
    });

    (Duplex { outbound, inbound }, recv_task)
}

/// `ws://` URL for `address`, leaving full URLs untouched.
#[must_use]
pub fn ws_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("ws://{address}")
    }
}

/// Opens client connections with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, address: &str) -> Result<Duplex, TransportError> {
        let url = ws_url(address);
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;
        tracing::debug!(%url, "websocket connected");
        let (duplex, _recv_task) = spawn_pumps(ws);
        Ok(duplex)
    }
}

//! Listener accepting game connections.
//!
//! Game clients older than 1.2 send a 12-character `Sec-WebSocket-Key`. Such
//! keys are padded to a standard-looking key for validation only; the accept
//! hash is always derived from the key exactly as sent.

use std::{borrow::Cow, collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use mcws_core::{Inbound, OutboundSender, encryption::ENCRYPTION_SUBPROTOCOL};
use mcws_session::ControllerSession;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        Error as WsError,
        handshake::{
            derive_accept_key,
            server::{ErrorResponse, Request, Response},
        },
        http::{
            HeaderValue, StatusCode,
            header::{SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL},
        },
    },
};

use crate::websocket::spawn_pumps;

const LEGACY_KEY_PREFIX: &str = "skipkeytest";
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listener error.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] WsError),
    #[error("WebSocket handshake timed out")]
    Timeout,
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// Maximum time a client may take to complete the upgrade.
    pub handshake_timeout: Duration,
    /// Subprotocol echoed back when the client offers it.
    pub subprotocol: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 19135)),
            handshake_timeout: Duration::from_secs(10),
            subprotocol: Some(ENCRYPTION_SUBPROTOCOL.to_string()),
        }
    }
}

/// Shape of a client's `Sec-WebSocket-Key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKey {
    Standard,
    /// 12-character key sent by pre-1.2 game clients.
    Legacy,
}

fn is_key_chars(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}

fn is_legacy_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 12 && bytes[11] == b'=' && is_key_chars(&bytes[..11])
}

fn is_standard_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 24 && &bytes[22..] == b"==" && is_key_chars(&bytes[..22])
}

/// Pad a legacy key into the standard 24-character form.
#[must_use]
pub fn normalize_key(key: &str) -> Cow<'_, str> {
    if is_legacy_key(key) {
        Cow::Owned(format!("{LEGACY_KEY_PREFIX}{key}="))
    } else {
        Cow::Borrowed(key)
    }
}

/// Classify a `Sec-WebSocket-Key`, or `None` if it is invalid even after padding.
#[must_use]
pub fn classify_key(key: &str) -> Option<ClientKey> {
    if !is_standard_key(&normalize_key(key)) {
        return None;
    }
    Some(if is_legacy_key(key) {
        ClientKey::Legacy
    } else {
        ClientKey::Standard
    })
}

fn error_response(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

fn offers_subprotocol(request: &Request, subprotocol: &str) -> bool {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|offered| offered.trim() == subprotocol)
}

/// What the upgrade request told us about the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Upgrade {
    key: ClientKey,
    subprotocol: bool,
}

async fn upgrade<S>(
    stream: S,
    subprotocol: Option<&str>,
) -> Result<(WebSocketStream<S>, Upgrade), ListenerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upgrade = Upgrade {
        key: ClientKey::Standard,
        subprotocol: false,
    };
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let key = request
            .headers()
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let Some(kind) = classify_key(key) else {
            tracing::warn!(key, "rejecting invalid Sec-WebSocket-Key");
            return Err(error_response(StatusCode::BAD_REQUEST, "invalid Sec-WebSocket-Key"));
        };
        let accept = HeaderValue::from_str(&derive_accept_key(key.as_bytes())).map_err(|_| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid accept key")
        })?;
        response.headers_mut().insert(SEC_WEBSOCKET_ACCEPT, accept);

        if let Some(subprotocol) = subprotocol.filter(|p| offers_subprotocol(request, p)) {
            if let Ok(value) = HeaderValue::from_str(subprotocol) {
                response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                upgrade.subprotocol = true;
            }
        }
        upgrade.key = kind;
        Ok(response)
    };

    let ws = accept_hdr_async(stream, callback).await?;
    Ok((ws, upgrade))
}

/// A game connection that completed the WebSocket upgrade.
pub struct AcceptedConnection {
    /// Registry id, counting from 1.
    pub id: u64,
    pub peer_addr: SocketAddr,
    /// Controller end of the connection.
    pub session: ControllerSession,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
    /// Client sent a pre-1.2 short key.
    pub legacy_key: bool,
    /// Client offered the encryption subprotocol.
    pub encryption_offered: bool,
}

struct RegisteredConnection {
    peer_addr: SocketAddr,
    outbound: OutboundSender,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    connections: HashMap<u64, RegisteredConnection>,
}

/// Live connections accepted by a [`Listener`].
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConnectionRegistry {
    async fn register(&self, peer_addr: SocketAddr, outbound: OutboundSender) -> u64 {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .connections
            .insert(id, RegisteredConnection { peer_addr, outbound });
        id
    }

    async fn remove(&self, id: u64) {
        self.inner.write().await.connections.remove(&id);
    }

    /// Number of open connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }

    /// Ids and peer addresses of open connections.
    pub async fn peers(&self) -> Vec<(u64, SocketAddr)> {
        let inner = self.inner.read().await;
        let mut peers: Vec<_> = inner
            .connections
            .iter()
            .map(|(id, conn)| (*id, conn.peer_addr))
            .collect();
        peers.sort_unstable();
        peers
    }

    /// Force-close every open connection. Returns how many were asked to close.
    pub async fn close_all(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .filter(|conn| conn.outbound.close().is_ok())
            .count()
    }
}

/// Accepts game connections and completes their WebSocket upgrade.
///
/// Upgrades run concurrently; [`Listener::accept`] yields connections in the
/// order their upgrade finished.
pub struct Listener {
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    accepted: mpsc::Receiver<AcceptedConnection>,
    accept_task: JoinHandle<()>,
}

impl Listener {
    /// Bind and start accepting.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind(config: ListenerConfig) -> Result<Self, ListenerError> {
        let tcp = TcpListener::bind(config.bind_addr).await?;
        let local_addr = tcp.local_addr()?;
        let registry = ConnectionRegistry::default();
        let (tx, accepted) = mpsc::channel(16);
        let accept_task = tokio::spawn(accept_loop(tcp, config, registry.clone(), tx));
        tracing::info!(%local_addr, "listening for game connections");
        Ok(Self {
            local_addr,
            registry,
            accepted,
            accept_task,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the live connection registry.
    #[must_use]
    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// Next upgraded connection, or `None` once the accept loop has stopped.
    pub async fn accept(&mut self) -> Option<AcceptedConnection> {
        self.accepted.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    tcp: TcpListener,
    config: ListenerConfig,
    registry: ConnectionRegistry,
    tx: mpsc::Sender<AcceptedConnection>,
) {
    loop {
        let (stream, peer_addr) = match tcp.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept failed: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        tokio::spawn(handshake(
            stream,
            peer_addr,
            config.clone(),
            registry.clone(),
            tx.clone(),
        ));
    }
}

async fn handshake(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: ListenerConfig,
    registry: ConnectionRegistry,
    tx: mpsc::Sender<AcceptedConnection>,
) {
    let result = tokio::time::timeout(
        config.handshake_timeout,
        upgrade(stream, config.subprotocol.as_deref()),
    )
    .await
    .unwrap_or(Err(ListenerError::Timeout));
    let (ws, upgrade) = match result {
        Ok(upgraded) => upgraded,
        Err(e) => {
            tracing::warn!(%peer_addr, "{e}");
            return;
        }
    };

    let (duplex, recv_task) = spawn_pumps(ws);
    let id = registry.register(peer_addr, duplex.outbound.clone()).await;
    let watcher = registry.clone();
    tokio::spawn(async move {
        let _ = recv_task.await;
        watcher.remove(id).await;
        tracing::debug!(id, "connection removed from registry");
    });

    let legacy_key = upgrade.key == ClientKey::Legacy;
    tracing::info!(id, %peer_addr, legacy_key, "game connected");
    let accepted = AcceptedConnection {
        id,
        peer_addr,
        session: ControllerSession::new(duplex.outbound),
        inbound: duplex.inbound,
        legacy_key,
        encryption_offered: upgrade.subprotocol,
    };
    if tx.send(accepted).await.is_err() {
        tracing::debug!(id, "listener gone, dropping connection");
    }
}

#[cfg(test)]
mod tests {
    use mcws_core::{Connector, WireMessage};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::websocket::WsConnector;

    async fn listener() -> Listener {
        Listener::bind(ListenerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ListenerConfig::default()
        })
        .await
        .unwrap()
    }

    async fn raw_upgrade(addr: SocketAddr, key: &str, protocol: Option<&str>) -> (String, TcpStream) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = format!(
            "GET / HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n"
        );
        if let Some(protocol) = protocol {
            request.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let mut buf = [0_u8; 1024];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
        }
        (String::from_utf8_lossy(&response).into_owned(), stream)
    }

    fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
        response.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    #[test]
    fn test_key_classification() {
        assert_eq!(classify_key("dGhlIHNhbXBsZSBub25jZQ=="), Some(ClientKey::Standard));
        assert_eq!(classify_key("abcdefghijk="), Some(ClientKey::Legacy));
        assert_eq!(classify_key("abc"), None);
        assert_eq!(classify_key("abcdefghij!="), None);
        assert_eq!(classify_key("ééééééé"), None);
        assert_eq!(classify_key(""), None);
    }

    #[test]
    fn test_legacy_key_padding() {
        assert_eq!(normalize_key("abcdefghijk="), "skipkeytestabcdefghijk==");
        assert_eq!(normalize_key("dGhlIHNhbXBsZSBub25jZQ=="), "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[tokio::test]
    async fn test_legacy_key_accepted_with_original_hash() {
        let mut listener = listener().await;
        let (response, _stream) = raw_upgrade(
            listener.local_addr(),
            "abcdefghijk=",
            Some(ENCRYPTION_SUBPROTOCOL),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 101"), "{response}");
        let expected = derive_accept_key(b"abcdefghijk=");
        assert_eq!(header(&response, "sec-websocket-accept"), Some(expected.as_str()));
        assert_eq!(header(&response, "sec-websocket-protocol"), Some(ENCRYPTION_SUBPROTOCOL));

        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.id, 1);
        assert!(accepted.legacy_key);
        assert!(accepted.encryption_offered);
        assert_eq!(listener.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let mut listener = listener().await;
        let (response, _stream) = raw_upgrade(listener.local_addr(), "not a key", None).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");

        let next = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_client_round_trip_and_registry() {
        let mut listener = listener().await;
        let registry = listener.registry();
        let mut client = WsConnector
            .connect(&listener.local_addr().to_string())
            .await
            .unwrap();
        let mut accepted = listener.accept().await.unwrap();
        assert!(!accepted.legacy_key);
        assert!(!accepted.encryption_offered);

        accepted.session.send_command_raw("r1", "say hi").unwrap();
        let Some(Inbound::Message(WireMessage::Text(text))) = client.inbound.recv().await else {
            panic!("expected text frame");
        };
        assert!(text.contains("say hi"));

        assert_eq!(registry.close_all().await, 1);
        assert!(matches!(client.inbound.recv().await, Some(Inbound::Closed)));

        for _ in 0..100 {
            if registry.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty().await);
    }
}

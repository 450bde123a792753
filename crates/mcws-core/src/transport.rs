//! Transport-agnostic duplex channel.
//!
//! A connection is seen as two channels: an outbound one accepting messages
//! and a close request, and an inbound one yielding messages, errors and a
//! final close notification. Socket implementations pump these channels; the
//! protocol engine never touches a socket directly.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// One transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Plain JSON frame.
    Text(String),
    /// Encrypted frame, or raw bytes from a peer.
    Binary(Bytes),
}

impl WireMessage {
    /// Raw payload bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(data) => data.to_vec(),
        }
    }
}

/// Request to the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(WireMessage),
    Close,
}

/// Notification from the socket reader.
#[derive(Debug)]
pub enum Inbound {
    Message(WireMessage),
    Error(TransportError),
    /// Socket closed, by either side. Always the last item.
    Closed,
}

/// Underlying socket failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Connect failed: {0}")]
    Connect(String),
}

/// Cloneable handle to a connection's outbound channel.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl OutboundSender {
    /// Queue a message. Buffering is left to the transport.
    ///
    /// # Errors
    /// Returns error if the writer has gone away.
    pub fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Message(message))
            .map_err(|_| TransportError::Closed)
    }

    /// Ask the transport to close the socket.
    ///
    /// # Errors
    /// Returns error if the writer has already gone away.
    pub fn close(&self) -> Result<(), TransportError> {
        self.tx.send(Outbound::Close).map_err(|_| TransportError::Closed)
    }

    /// Whether the writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create an outbound channel.
#[must_use]
pub fn outbound_channel() -> (OutboundSender, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutboundSender { tx }, rx)
}

/// Both halves of one connection as seen by the engine.
#[derive(Debug)]
pub struct Duplex {
    pub outbound: OutboundSender,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens outbound connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `address` (`host:port` or a full URL).
    async fn connect(&self, address: &str) -> Result<Duplex, TransportError>;
}

/// Two in-memory connected duplexes.
///
/// Closing either end closes both, like a socket. Requires a tokio runtime.
#[must_use]
pub fn memory_pair() -> (Duplex, Duplex) {
    let (a_out, mut a_out_rx) = outbound_channel();
    let (b_out, mut b_out_rx) = outbound_channel();
    let (a_in_tx, a_in) = mpsc::unbounded_channel();
    let (b_in_tx, b_in) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (item, to) = tokio::select! {
                item = a_out_rx.recv() => (item, &b_in_tx),
                item = b_out_rx.recv() => (item, &a_in_tx),
            };
            match item {
                Some(Outbound::Message(message)) => {
                    let _ = to.send(Inbound::Message(message));
                }
                Some(Outbound::Close) | None => break,
            }
        }
        let _ = a_in_tx.send(Inbound::Closed);
        let _ = b_in_tx.send(Inbound::Closed);
    });

    (
        Duplex {
            outbound: a_out,
            inbound: a_in,
        },
        Duplex {
            outbound: b_out,
            inbound: b_in,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_delivers_both_ways() {
        let (mut a, mut b) = memory_pair();
        a.outbound.send(WireMessage::Text("ping".to_string())).unwrap();
        b.outbound.send(WireMessage::Text("pong".to_string())).unwrap();

        assert!(matches!(
            b.inbound.recv().await,
            Some(Inbound::Message(WireMessage::Text(t))) if t == "ping"
        ));
        assert!(matches!(
            a.inbound.recv().await,
            Some(Inbound::Message(WireMessage::Text(t))) if t == "pong"
        ));
    }

    #[tokio::test]
    async fn test_memory_pair_close_reaches_both_ends() {
        let (mut a, mut b) = memory_pair();
        a.outbound.close().unwrap();
        assert!(matches!(a.inbound.recv().await, Some(Inbound::Closed)));
        assert!(matches!(b.inbound.recv().await, Some(Inbound::Closed)));
    }

    #[test]
    fn test_send_after_writer_dropped() {
        let (tx, rx) = outbound_channel();
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(
            tx.send(WireMessage::Text(String::new())),
            Err(TransportError::Closed)
        ));
    }
}

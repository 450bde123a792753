//! WebSocket plumbing for the Minecraft WebSocket protocol.
//!
//! Provides:
//! - `spawn_pumps` - Drive a tungstenite stream through a `Duplex`
//! - `WsConnector` - Client-side `Connector`
//! - `Listener` - Accept game connections, with the legacy key shim
//! - `ConnectionRegistry` - Live connections, for counting and shutdown

pub mod server;
pub mod websocket;

pub use server::{AcceptedConnection, ConnectionRegistry, Listener, ListenerConfig, ListenerError};
pub use websocket::{WsConnector, spawn_pumps, ws_url};

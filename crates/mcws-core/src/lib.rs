//! Core protocol types for the Minecraft WebSocket command protocol.
//!
//! This crate provides the building blocks shared by both connection roles:
//! - `Frame` - Header + body envelope, V1/V2 event placement
//! - `FrameCodec` - JSON codec that routes through the stream cipher
//! - `KeyExchangeInitiator` / `respond_to_key_exchange` - In-band ECDH handshake
//! - `AgentAction` - Fixed agent action table
//! - `Duplex` / `Connector` - Transport abstraction

pub mod action;
pub mod codec;
pub mod encryption;
pub mod frame;
pub mod transport;

pub use action::{AgentAction, UnknownAction};
pub use codec::{CodecError, FrameCodec};
pub use encryption::{HandshakeError, KeyExchangeInitiator, StreamCipher};
pub use frame::{EventFrame, Frame, Header, ProtocolVersion, Purpose};
pub use transport::{Connector, Duplex, Inbound, OutboundSender, TransportError, WireMessage};

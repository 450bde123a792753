//! Controller and executor roles of the Minecraft WebSocket protocol.
//!
//! Provides:
//! - `ControllerSession` - Issue commands, correlate responses, multiplex subscriptions
//! - `ExecutorClient` - Receive commands and subscriptions, publish events
//!
//! Both roles are driven by feeding inbound wire messages to `handle_message`
//! from a single task; outbound frames go straight to the connection's
//! outbound channel.

mod connection;
pub mod controller;
pub mod executor;

pub use connection::SessionError;
pub use controller::{
    CommandError, CommandResponse, ControllerEvent, ControllerSession, EncryptionState,
    PeerError, PendingCommand, PendingKeyExchange, Subscription, SubscriptionHandle,
};
pub use executor::{
    AgentCommandRequest, CommandRequest, ExecutorClient, ExecutorEvent, LegacyCommandRequest,
};

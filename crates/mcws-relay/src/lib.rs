//! Protocol relay between Minecraft game connections and an upstream controller.
//!
//! Each accepted game connection is paired with an outbound connection to the
//! upstream application. The relay forwards commands one way and responses,
//! errors and events the other, enforces the legacy command policy and applies
//! configured response patches.

pub mod config;
pub mod relay;
pub mod server;

pub use config::{ConfigError, LegacyPolicy, RelayConfig, ResponsePatch};
pub use relay::{ClosedBy, Relay, RelayError};
pub use server::serve;

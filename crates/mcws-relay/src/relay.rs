//! One relay: a game connection paired with an upstream connection.
//!
//! Log lines carry the relay number; `->` marks traffic from the upstream
//! controller towards the game, `<-` traffic coming from the game.

use std::collections::HashMap;

use mcws_core::{Duplex, Inbound, Purpose};
use mcws_session::{
    CommandResponse, ControllerEvent, ControllerSession, ExecutorClient, ExecutorEvent,
    LegacyCommandRequest, PeerError, SessionError,
};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::{LegacyPolicy, RelayConfig, ResponsePatch};

/// Status code sent back for rejected legacy commands.
const LEGACY_REJECT_STATUS: i64 = 2;
const LEGACY_REJECT_MESSAGE: &str = "Error commandLegacy";

/// Relay error.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Upstream connection failed: {0}")]
    Upstream(#[from] mcws_core::TransportError),
}

/// Which leg ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    /// The game connection closed first.
    Game,
    /// The upstream controller closed first.
    Upstream,
}

/// A game connection paired with an upstream connection.
pub struct Relay {
    id: u64,
    game: ControllerSession,
    game_inbound: UnboundedReceiver<Inbound>,
    upstream: ExecutorClient,
    upstream_inbound: UnboundedReceiver<Inbound>,
    legacy_policy: LegacyPolicy,
    patches: Vec<ResponsePatch>,
    /// Request id to command line, for requests whose response gets patched.
    tracked: HashMap<String, String>,
    game_version: Option<u32>,
    upstream_version: Option<u32>,
}

impl Relay {
    /// Pair `game` with the `upstream` duplex.
    #[must_use]
    pub fn new(
        id: u64,
        config: &RelayConfig,
        game: ControllerSession,
        game_inbound: UnboundedReceiver<Inbound>,
        upstream: Duplex,
    ) -> Self {
        Self {
            id,
            game,
            game_inbound,
            upstream: ExecutorClient::new(upstream.outbound, config.upstream_version),
            upstream_inbound: upstream.inbound,
            legacy_policy: config.legacy_policy,
            patches: config.patches.clone(),
            tracked: HashMap::new(),
            game_version: None,
            upstream_version: None,
        }
    }

    /// Connection number used in log lines.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Number of requests waiting for a patched response.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Forward traffic until either leg closes, then close the other one.
    ///
    /// # Errors
    /// Returns error if a leg fails in a way other than closing. Both legs
    /// are closed in that case too.
    pub async fn run(mut self) -> Result<ClosedBy, RelayError> {
        let result = self.pump().await;
        match &result {
            Ok(ClosedBy::Game) => {
                tracing::info!(relay = self.id, "<- [{}] disconnected from server", self.id);
                let _ = self.upstream.disconnect();
            }
            Ok(ClosedBy::Upstream) => {
                tracing::info!(relay = self.id, "-> [{}] disconnected from client", self.id);
                let _ = self.game.disconnect(true);
            }
            Err(e) => {
                tracing::warn!(relay = self.id, "relay [{}] failed: {e}", self.id);
                let _ = self.upstream.disconnect();
                let _ = self.game.disconnect(true);
            }
        }
        self.game.handle_closed();
        self.upstream.handle_closed();
        result
    }

    async fn pump(&mut self) -> Result<ClosedBy, RelayError> {
        loop {
            tokio::select! {
                item = self.game_inbound.recv() => match item {
                    Some(Inbound::Message(message)) => {
                        match self.game.handle_message(message) {
                            Ok(Some(event)) => self.on_game_event(event)?,
                            Ok(None) => {}
                            Err(e) => tracing::warn!(relay = self.id, "<- [{}] dropped message: {e}", self.id),
                        }
                        self.note_game_version();
                    }
                    Some(Inbound::Error(e)) => {
                        tracing::warn!(relay = self.id, "<- [{}] transport error: {e}", self.id);
                    }
                    Some(Inbound::Closed) | None => return Ok(ClosedBy::Game),
                },
                item = self.upstream_inbound.recv() => match item {
                    Some(Inbound::Message(message)) => {
                        match self.upstream.handle_message(message) {
                            Ok(Some(event)) => self.on_upstream_event(event)?,
                            Ok(None) => {}
                            Err(e) => tracing::warn!(relay = self.id, "-> [{}] dropped message: {e}", self.id),
                        }
                        self.note_upstream_version();
                    }
                    Some(Inbound::Error(e)) => {
                        tracing::warn!(relay = self.id, "-> [{}] transport error: {e}", self.id);
                    }
                    Some(Inbound::Closed) | None => return Ok(ClosedBy::Upstream),
                },
            }
        }
    }

    fn on_upstream_event(&mut self, event: ExecutorEvent) -> Result<(), RelayError> {
        let id = self.id;
        match event {
            ExecutorEvent::EncryptionEnabled { request_id } => {
                tracing::info!(relay = id, "-> [{id}] keyExchange: {request_id}");
                if let Err(e) = self.game.enable_encryption() {
                    tracing::warn!(relay = id, "<- [{id}] cannot start encryption: {e}");
                }
            }
            ExecutorEvent::Command(request) => {
                tracing::info!(
                    relay = id,
                    "-> [{id}] command: {} {}",
                    request.request_id,
                    request.command_line
                );
                if self.patches.iter().any(|p| p.command == request.command_line) {
                    self.tracked
                        .insert(request.request_id.clone(), request.command_line.clone());
                }
                self.game
                    .send_command_raw(&request.request_id, &request.command_line)?;
            }
            ExecutorEvent::CommandLegacy(request) => self.on_legacy_command(request)?,
            ExecutorEvent::CommandAgent(request) => {
                tracing::info!(
                    relay = id,
                    "-> [{id}] agent: {} {}",
                    request.request_id,
                    request.command_line
                );
                self.game
                    .send_command_agent_raw(&request.request_id, &request.command_line)?;
            }
            ExecutorEvent::Subscribe { event_name } => {
                tracing::info!(relay = id, "-> [{id}] subscribe: {event_name}");
                self.game.subscribe_raw(&event_name)?;
            }
            ExecutorEvent::Unsubscribe { event_name } => {
                tracing::info!(relay = id, "-> [{id}] unsubscribe: {event_name}");
                self.game.unsubscribe_raw(&event_name)?;
            }
            ExecutorEvent::Custom(frame) => {
                tracing::debug!(relay = id, "-> [{id}] ignoring {} frame", frame.purpose());
            }
        }
        Ok(())
    }

    fn on_legacy_command(&mut self, request: LegacyCommandRequest) -> Result<(), RelayError> {
        let id = self.id;
        tracing::info!(
            relay = id,
            "-> [{id}] commandLegacy: {} {}",
            request.request_id,
            request.name
        );
        match self.legacy_policy {
            LegacyPolicy::Reject => self.upstream.send_error(
                LEGACY_REJECT_STATUS,
                LEGACY_REJECT_MESSAGE,
                Some(&request.request_id),
            )?,
            LegacyPolicy::Forward => self.game.send_command_legacy_raw(
                &request.request_id,
                &request.name,
                &request.overload,
                request.input,
            )?,
        }
        Ok(())
    }

    fn on_game_event(&mut self, event: ControllerEvent) -> Result<(), RelayError> {
        let id = self.id;
        match event {
            ControllerEvent::Event(event) => {
                tracing::info!(relay = id, "<- [{id}] {}: {}", event.purpose, event.event_name);
                self.upstream.publish(event)?;
            }
            ControllerEvent::CommandResponse(response) => {
                tracing::info!(
                    relay = id,
                    "<- [{id}] commandResponse: {} {}",
                    response.request_id,
                    response.status_code().unwrap_or_default()
                );
                let body = self.patch(&response.request_id, response.body);
                self.upstream.respond_command(&response.request_id, body)?;
            }
            ControllerEvent::AgentResponse(response) => self.on_agent_response(response)?,
            ControllerEvent::Error(error) => self.on_game_error(error)?,
            ControllerEvent::EncryptionEnabled => {
                tracing::info!(relay = id, "<- [{id}] completeEncryption");
            }
            ControllerEvent::HandshakeFailed(e) => {
                tracing::warn!(relay = id, "<- [{id}] encryption failed: {e}");
            }
            ControllerEvent::Custom(frame) => {
                tracing::debug!(relay = id, "<- [{id}] ignoring {} frame", frame.purpose());
            }
        }
        Ok(())
    }

    fn on_agent_response(&mut self, response: CommandResponse) -> Result<(), RelayError> {
        let id = self.id;
        let action_name = response.action_name.as_deref().unwrap_or_default();
        tracing::info!(
            relay = id,
            "<- [{id}] agentResponse: {} {action_name}",
            response.request_id
        );
        match self
            .upstream
            .respond_command_agent(&response.request_id, action_name, response.body.clone())
        {
            Err(SessionError::UnknownAction(_)) => self.upstream.send_frame(
                Purpose::AgentAction,
                response.body,
                Some(&response.request_id),
            )?,
            other => other?,
        }
        Ok(())
    }

    fn on_game_error(&mut self, error: PeerError) -> Result<(), RelayError> {
        let id = self.id;
        tracing::info!(
            relay = id,
            "<- [{id}] error: {}",
            error.status_message.as_deref().unwrap_or_default()
        );
        if let Some(request_id) = &error.request_id {
            self.tracked.remove(request_id);
        }
        self.upstream
            .send_error_frame(error.request_id.as_deref(), error.body)?;
        Ok(())
    }

    /// Apply matching patches; the tracking entry is consumed by the first response.
    fn patch(&mut self, request_id: &str, mut body: Value) -> Value {
        let Some(command) = self.tracked.remove(request_id) else {
            return body;
        };
        if let Some(map) = body.as_object_mut() {
            for patch in self.patches.iter().filter(|p| p.command == command) {
                tracing::debug!(relay = self.id, %request_id, field = %patch.field, "patching response");
                map.insert(patch.field.clone(), patch.value.clone());
            }
        }
        body
    }

    fn note_game_version(&mut self) {
        let version = self.game.peer_version();
        if version.is_some() && version != self.game_version {
            self.game_version = version;
            tracing::info!(relay = self.id, "<- [{}] version: {}", self.id, version.unwrap_or_default());
        }
    }

    fn note_upstream_version(&mut self) {
        let version = self.upstream.peer_version();
        if version.is_some() && version != self.upstream_version {
            self.upstream_version = version;
            tracing::info!(relay = self.id, "-> [{}] version: {}", self.id, version.unwrap_or_default());
        }
    }
}

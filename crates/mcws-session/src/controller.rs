//! Controller role: issues commands and subscriptions, consumes responses and events.

use std::{collections::HashMap, fmt};

use mcws_core::{
    EventFrame, Frame, HandshakeError, KeyExchangeInitiator, OutboundSender, ProtocolVersion,
    Purpose, WireMessage,
    frame::{COMMAND_REQUEST_TYPE, is_failure_status},
};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::connection::{Connection, SessionError};

/// Command asking the game to close the socket from its side.
const CLOSE_COMMAND: &str = "closewebsocket";

/// Encryption progress of one connection. Only moves forward, except that a
/// failed exchange falls back to `Unencrypted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    /// Frames travel as clear text.
    Unencrypted,
    /// `enableencryption` sent, waiting for the peer's public key.
    KeyExchanging,
    /// Both directions run through the stream cipher.
    Encrypted,
}

/// Response to a command issued by this session.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    /// Id of the request this answers.
    pub request_id: String,
    /// `commandResponse`, or `action:agent` for agent commands.
    pub purpose: Purpose,
    /// `actionName` header of agent responses.
    pub action_name: Option<String>,
    pub body: Value,
}

impl CommandResponse {
    fn from_frame(frame: Frame) -> Self {
        Self {
            request_id: frame.header.request_id,
            purpose: frame.header.purpose,
            action_name: frame.header.action_name,
            body: frame.body,
        }
    }

    /// `statusCode` of the body, if present.
    #[must_use]
    pub fn status_code(&self) -> Option<i64> {
        self.body.get("statusCode").and_then(Value::as_i64)
    }

    /// `statusMessage` of the body, if present.
    #[must_use]
    pub fn status_message(&self) -> Option<&str> {
        self.body.get("statusMessage").and_then(Value::as_str)
    }
}

/// An `error` frame sent by the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerError {
    /// Request the error belongs to; `None` for the all-zero id.
    pub request_id: Option<String>,
    pub status_code: Option<i64>,
    pub status_message: Option<String>,
    /// Full error body as received.
    pub body: Value,
}

impl PeerError {
    fn from_frame(frame: Frame) -> Self {
        Self {
            request_id: frame.request_id().map(str::to_string),
            status_code: frame.status_code(),
            status_message: frame.status_message().map(str::to_string),
            body: frame.body,
        }
    }
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status {}: {}",
            self.status_code.unwrap_or_default(),
            self.status_message.as_deref().unwrap_or("<no message>")
        )
    }
}

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// The response carried a status code with the failure bit set.
    #[error("Command failed with status {status_code}: {}", .response.status_message().unwrap_or_default())]
    Failed {
        status_code: i64,
        response: CommandResponse,
    },
    /// The peer answered with an `error` frame.
    #[error("Peer error: {0}")]
    Peer(PeerError),
    #[error("Connection closed before a response arrived")]
    Closed,
}

/// Completion of a command sent with [`ControllerSession::send_command`].
#[derive(Debug)]
pub struct PendingCommand {
    request_id: String,
    rx: oneshot::Receiver<Result<CommandResponse, CommandError>>,
}

impl PendingCommand {
    /// Request id the command was sent under.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response.
    ///
    /// There is no built-in timeout; wrap in `tokio::time::timeout` as needed.
    ///
    /// # Errors
    /// Returns error on application failure or if the session goes away.
    pub async fn response(self) -> Result<CommandResponse, CommandError> {
        self.rx.await.unwrap_or(Err(CommandError::Closed))
    }
}

/// Completion of [`ControllerSession::enable_encryption`].
#[derive(Debug)]
pub struct PendingKeyExchange {
    request_id: String,
    rx: oneshot::Receiver<Result<(), HandshakeError>>,
}

impl PendingKeyExchange {
    /// Request id of the key exchange command.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait until both ends have switched to the cipher.
    ///
    /// # Errors
    /// Returns error if the exchange fails or the session goes away.
    pub async fn completed(self) -> Result<(), HandshakeError> {
        self.rx.await.unwrap_or(Err(HandshakeError::Closed))
    }
}

/// Token identifying one local listener. Pass it back to unsubscribe.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    event_name: String,
}

impl SubscriptionHandle {
    /// Event this handle listens to.
    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.event_name
    }
}

/// A local listener and the stream of events delivered to it.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<EventFrame>,
}

/// Notification produced by [`ControllerSession::handle_message`].
#[derive(Debug)]
pub enum ControllerEvent {
    /// Event nobody subscribed to locally.
    Event(EventFrame),
    /// Response with no pending request, e.g. to a raw send.
    CommandResponse(CommandResponse),
    /// Agent response with no pending request.
    AgentResponse(CommandResponse),
    /// `error` frame that matched no pending request.
    Error(PeerError),
    /// The key exchange finished and the cipher is installed.
    EncryptionEnabled,
    /// The key exchange failed; the connection stays in clear text.
    HandshakeFailed(HandshakeError),
    /// Frame with a purpose the controller does not handle.
    Custom(Frame),
}

enum Pending {
    Command(oneshot::Sender<Result<CommandResponse, CommandError>>),
    KeyExchange {
        initiator: KeyExchangeInitiator,
        done: oneshot::Sender<Result<(), HandshakeError>>,
    },
}

/// Controller end of one connection.
///
/// All state is owned here and mutated only through `&mut self`, so a
/// connection needs no locking as long as one task drives it.
pub struct ControllerSession {
    conn: Connection,
    encryption: EncryptionState,
    pending: HashMap<String, Pending>,
    listeners: HashMap<String, HashMap<u64, mpsc::UnboundedSender<EventFrame>>>,
    next_listener: u64,
    /// Frames sent while a key exchange is in flight.
    held: Vec<Frame>,
}

impl ControllerSession {
    /// Create a V1 session writing to `outbound`.
    #[must_use]
    pub fn new(outbound: OutboundSender) -> Self {
        Self::with_version(outbound, ProtocolVersion::V1)
    }

    /// Create a session stamping `version` on outgoing frames.
    #[must_use]
    pub fn with_version(outbound: OutboundSender, version: ProtocolVersion) -> Self {
        Self {
            conn: Connection::new(outbound, version),
            encryption: EncryptionState::Unencrypted,
            pending: HashMap::new(),
            listeners: HashMap::new(),
            next_listener: 0,
            held: Vec::new(),
        }
    }

    /// Current step of the key exchange.
    #[must_use]
    pub const fn encryption_state(&self) -> EncryptionState {
        self.encryption
    }

    /// Whether outgoing frames are encrypted.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.conn.is_encrypted()
    }

    /// Raw `version` header of the last frame received.
    #[must_use]
    pub const fn peer_version(&self) -> Option<u32> {
        self.conn.peer_version()
    }

    /// Number of requests still waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `request_id` is still waiting for a response.
    #[must_use]
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Number of frames held back until the key exchange ends.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Number of local listeners for `event_name`.
    #[must_use]
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners.get(event_name).map_or(0, HashMap::len)
    }

    /// Send an arbitrary frame with the controller header.
    ///
    /// While a key exchange is in flight the peer may already decrypt, so
    /// frames are held and sent in order once the exchange ends either way.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_frame(
        &mut self,
        purpose: Purpose,
        body: Value,
        request_id: Option<&str>,
    ) -> Result<(), SessionError> {
        let frame = Frame::new(purpose, body, request_id, self.conn.version())
            .with_message_type(COMMAND_REQUEST_TYPE);
        if self.encryption == EncryptionState::KeyExchanging {
            self.held.push(frame);
            return Ok(());
        }
        self.conn.send(&frame)
    }

    fn release_held(&mut self) {
        for frame in std::mem::take(&mut self.held) {
            if let Err(e) = self.conn.send(&frame) {
                tracing::warn!("dropping held frames: {e}");
                break;
            }
        }
    }

    /// Send a command under a caller-chosen request id, without tracking it.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_command_raw(&mut self, request_id: &str, command_line: &str) -> Result<(), SessionError> {
        self.send_frame(
            Purpose::CommandRequest,
            json!({
                "version": 1,
                "commandLine": command_line,
                "origin": { "type": "player" },
            }),
            Some(request_id),
        )
    }

    /// Send a command and track its response.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_command(&mut self, command_line: &str) -> Result<PendingCommand, SessionError> {
        self.track(|session, request_id| session.send_command_raw(request_id, command_line))
    }

    /// Send a command given as separate arguments.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_command_args<I, S>(&mut self, args: I) -> Result<PendingCommand, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let command_line = args
            .into_iter()
            .map(|arg| arg.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.send_command(&command_line)
    }

    /// Send a structured legacy command without tracking it.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_command_legacy_raw(
        &mut self,
        request_id: &str,
        name: &str,
        overload: &str,
        input: Value,
    ) -> Result<(), SessionError> {
        self.send_frame(
            Purpose::CommandRequest,
            json!({
                "version": 1,
                "name": name,
                "overload": overload,
                "input": input,
                "origin": { "type": "player" },
            }),
            Some(request_id),
        )
    }

    /// Send a structured legacy command and track its response.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_command_legacy(
        &mut self,
        name: &str,
        overload: &str,
        input: Value,
    ) -> Result<PendingCommand, SessionError> {
        self.track(|session, request_id| {
            session.send_command_legacy_raw(request_id, name, overload, input)
        })
    }

    /// Send an agent command without tracking it.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_command_agent_raw(
        &mut self,
        request_id: &str,
        command_line: &str,
    ) -> Result<(), SessionError> {
        self.send_frame(
            Purpose::AgentAction,
            json!({ "version": 1, "commandLine": command_line }),
            Some(request_id),
        )
    }

    /// Send an agent command and track its response.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_command_agent(&mut self, command_line: &str) -> Result<PendingCommand, SessionError> {
        self.track(|session, request_id| session.send_command_agent_raw(request_id, command_line))
    }

    fn track(
        &mut self,
        send: impl FnOnce(&mut Self, &str) -> Result<(), SessionError>,
    ) -> Result<PendingCommand, SessionError> {
        let request_id = Uuid::new_v4().to_string();
        send(self, &request_id)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), Pending::Command(tx));
        Ok(PendingCommand { request_id, rx })
    }

    /// Send a wire `subscribe`, bypassing local listener bookkeeping.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn subscribe_raw(&mut self, event_name: &str) -> Result<(), SessionError> {
        self.send_frame(Purpose::Subscribe, json!({ "eventName": event_name }), None)
    }

    /// Send a wire `unsubscribe`, bypassing local listener bookkeeping.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn unsubscribe_raw(&mut self, event_name: &str) -> Result<(), SessionError> {
        self.send_frame(Purpose::Unsubscribe, json!({ "eventName": event_name }), None)
    }

    /// Add a local listener. Only the first listener of a name goes on the wire.
    ///
    /// # Errors
    /// Returns error if the wire subscribe cannot be sent; nothing is registered then.
    pub fn subscribe(&mut self, event_name: &str) -> Result<Subscription, SessionError> {
        if self.listener_count(event_name) == 0 {
            self.subscribe_raw(event_name)?;
        }
        let (tx, events) = mpsc::unbounded_channel();
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners
            .entry(event_name.to_string())
            .or_default()
            .insert(id, tx);
        Ok(Subscription {
            handle: SubscriptionHandle {
                id,
                event_name: event_name.to_string(),
            },
            events,
        })
    }

    /// Remove a local listener. Removing the last one goes on the wire.
    ///
    /// Returns `false` if the handle was not registered.
    ///
    /// # Errors
    /// Returns error if the wire unsubscribe cannot be sent.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<bool, SessionError> {
        let Some(listeners) = self.listeners.get_mut(&handle.event_name) else {
            return Ok(false);
        };
        if listeners.remove(&handle.id).is_none() {
            return Ok(false);
        }
        if listeners.is_empty() {
            self.listeners.remove(&handle.event_name);
            self.unsubscribe_raw(&handle.event_name)?;
        }
        Ok(true)
    }

    /// Start the in-band key exchange.
    ///
    /// # Errors
    /// Returns [`HandshakeError::AlreadyInProgress`] if an exchange is running
    /// or finished; nothing is sent in that case.
    pub fn enable_encryption(&mut self) -> Result<PendingKeyExchange, SessionError> {
        if self.encryption != EncryptionState::Unencrypted {
            return Err(HandshakeError::AlreadyInProgress.into());
        }
        let initiator = KeyExchangeInitiator::new()?;
        let request_id = Uuid::new_v4().to_string();
        self.send_command_raw(&request_id, &initiator.command_line())?;

        let (done, rx) = oneshot::channel();
        self.pending
            .insert(request_id.clone(), Pending::KeyExchange { initiator, done });
        self.encryption = EncryptionState::KeyExchanging;
        tracing::debug!(%request_id, "key exchange started");
        Ok(PendingKeyExchange { request_id, rx })
    }

    /// Close the connection.
    ///
    /// With `force` the socket is closed right away; otherwise the game is
    /// asked to close it and the caller waits for the close notification.
    ///
    /// # Errors
    /// Returns error if the transport is already gone.
    pub fn disconnect(&mut self, force: bool) -> Result<(), SessionError> {
        if force {
            self.conn.close()
        } else {
            self.send_command(CLOSE_COMMAND).map(drop)
        }
    }

    /// Process one inbound message.
    ///
    /// # Errors
    /// Returns error if the message is not a well-formed frame. Only that
    /// message is lost.
    pub fn handle_message(
        &mut self,
        message: WireMessage,
    ) -> Result<Option<ControllerEvent>, SessionError> {
        let frame = self.conn.decode(message)?;
        tracing::trace!(
            purpose = %frame.purpose(),
            request_id = %frame.header.request_id,
            "controller received frame"
        );
        let event = match frame.purpose() {
            Purpose::Event | Purpose::Chat => self.dispatch_event(frame),
            Purpose::CommandResponse | Purpose::AgentAction => self.resolve_response(frame),
            Purpose::Error => self.resolve_error(frame),
            _ => Some(ControllerEvent::Custom(frame)),
        };
        Ok(event)
    }

    /// Drop all pending requests and listeners after the transport closed.
    pub fn handle_closed(&mut self) {
        self.pending.clear();
        self.listeners.clear();
        self.held.clear();
        if self.encryption == EncryptionState::KeyExchanging {
            self.encryption = EncryptionState::Unencrypted;
        }
    }

    /// Deliver to local listeners, pruning those whose receiver is gone.
    /// When the last one goes the wire subscription is dropped too.
    fn dispatch_event(&mut self, frame: Frame) -> Option<ControllerEvent> {
        let event = match frame.into_event() {
            Ok(event) => event,
            Err(frame) => return Some(ControllerEvent::Custom(frame)),
        };
        let Some(listeners) = self.listeners.get_mut(&event.event_name) else {
            return Some(ControllerEvent::Event(event));
        };
        listeners.retain(|_, listener| listener.send(event.clone()).is_ok());
        if !listeners.is_empty() {
            return None;
        }
        self.listeners.remove(&event.event_name);
        tracing::debug!(event_name = %event.event_name, "all listeners dropped, unsubscribing");
        if let Err(e) = self.unsubscribe_raw(&event.event_name) {
            tracing::warn!(event_name = %event.event_name, "unsubscribe failed: {e}");
        }
        Some(ControllerEvent::Event(event))
    }

    fn resolve_response(&mut self, frame: Frame) -> Option<ControllerEvent> {
        let response = CommandResponse::from_frame(frame);
        match self.pending.remove(&response.request_id) {
            Some(Pending::Command(done)) => {
                let outcome = match response.status_code() {
                    Some(status_code) if is_failure_status(status_code) => {
                        Err(CommandError::Failed {
                            status_code,
                            response,
                        })
                    }
                    _ => Ok(response),
                };
                let _ = done.send(outcome);
                None
            }
            Some(Pending::KeyExchange { initiator, done }) => {
                Some(self.finish_key_exchange(initiator, done, &response))
            }
            None if response.purpose == Purpose::AgentAction => {
                Some(ControllerEvent::AgentResponse(response))
            }
            None => Some(ControllerEvent::CommandResponse(response)),
        }
    }

    fn resolve_error(&mut self, frame: Frame) -> Option<ControllerEvent> {
        let error = PeerError::from_frame(frame);
        let pending = error
            .request_id
            .as_deref()
            .and_then(|request_id| self.pending.remove(request_id));
        match pending {
            Some(Pending::Command(done)) => {
                let _ = done.send(Err(CommandError::Peer(error)));
                None
            }
            Some(Pending::KeyExchange { done, .. }) => {
                let reason = HandshakeError::Rejected(error.status_code.unwrap_or_default());
                Some(self.fail_key_exchange(done, reason))
            }
            None => Some(ControllerEvent::Error(error)),
        }
    }

    fn finish_key_exchange(
        &mut self,
        initiator: KeyExchangeInitiator,
        done: oneshot::Sender<Result<(), HandshakeError>>,
        response: &CommandResponse,
    ) -> ControllerEvent {
        let result = match response.status_code() {
            Some(status_code) if is_failure_status(status_code) => {
                Err(HandshakeError::Rejected(status_code))
            }
            _ => response
                .body
                .get("publicKey")
                .and_then(Value::as_str)
                .ok_or(HandshakeError::MissingPublicKey)
                .and_then(|public_key| initiator.complete(public_key)),
        };
        match result {
            Ok(cipher) => {
                self.conn.install_cipher(cipher);
                self.encryption = EncryptionState::Encrypted;
                tracing::debug!(request_id = %response.request_id, "encryption enabled");
                self.release_held();
                let _ = done.send(Ok(()));
                ControllerEvent::EncryptionEnabled
            }
            Err(error) => self.fail_key_exchange(done, error),
        }
    }

    fn fail_key_exchange(
        &mut self,
        done: oneshot::Sender<Result<(), HandshakeError>>,
        error: HandshakeError,
    ) -> ControllerEvent {
        self.encryption = EncryptionState::Unencrypted;
        tracing::warn!("key exchange failed: {error}");
        self.release_held();
        let _ = done.send(Err(error.clone()));
        ControllerEvent::HandshakeFailed(error)
    }
}

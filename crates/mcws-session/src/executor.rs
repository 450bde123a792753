//! Executor role: the game end of a connection.
//!
//! Receives commands and subscription requests, answers them and publishes
//! events to whatever the controller is listening to.

use std::collections::HashSet;

use mcws_core::{
    AgentAction, EventFrame, Frame, HandshakeError, OutboundSender, ProtocolVersion, Purpose,
    WireMessage,
    encryption::{KeyExchangeResponse, is_key_exchange, respond_to_key_exchange},
};
use serde_json::{Value, json};

use crate::connection::{Connection, SessionError};

/// A `commandRequest` carrying a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Id the response must be sent under.
    pub request_id: String,
    /// Command text without a leading slash.
    pub command_line: String,
}

/// A structured command in the legacy `name`/`overload`/`input` form.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyCommandRequest {
    /// Id the response must be sent under.
    pub request_id: String,
    /// Command name, e.g. `give`.
    pub name: String,
    /// Name of the overload the input matches.
    pub overload: String,
    /// Arguments keyed by parameter name.
    pub input: Value,
}

impl LegacyCommandRequest {
    fn from_frame(frame: Frame) -> Self {
        let name = frame.body_str("name").unwrap_or_default().to_string();
        let overload = frame.body_str("overload").unwrap_or_default().to_string();
        let mut body = frame.body;
        Self {
            request_id: frame.header.request_id,
            name,
            overload,
            input: body.get_mut("input").map(Value::take).unwrap_or_default(),
        }
    }
}

/// An `action:agent` request carrying a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommandRequest {
    /// Id the agent response must be sent under.
    pub request_id: String,
    /// Agent command text, e.g. `agent move forward`.
    pub command_line: String,
}

/// Notification produced by [`ExecutorClient::handle_message`].
#[derive(Debug)]
pub enum ExecutorEvent {
    /// Command line to run; answer with [`ExecutorClient::respond_command`].
    Command(CommandRequest),
    /// Structured command, also used for agent frames without a command line.
    CommandLegacy(LegacyCommandRequest),
    /// Agent command; answer with [`ExecutorClient::respond_command_agent`].
    CommandAgent(AgentCommandRequest),
    /// First subscription to an event name.
    Subscribe { event_name: String },
    /// Last subscription to an event name was dropped.
    Unsubscribe { event_name: String },
    /// A key exchange was answered and the cipher is now active.
    EncryptionEnabled { request_id: String },
    /// Frame with a purpose the executor does not handle.
    Custom(Frame),
}

/// Executor end of one connection.
pub struct ExecutorClient {
    conn: Connection,
    listening: HashSet<String>,
}

impl ExecutorClient {
    /// Create a client stamping `version` on outgoing frames.
    #[must_use]
    pub fn new(outbound: OutboundSender, version: ProtocolVersion) -> Self {
        Self {
            conn: Connection::new(outbound, version),
            listening: HashSet::new(),
        }
    }

    /// Version stamped on outgoing frames; decides the event shape.
    #[must_use]
    pub const fn version(&self) -> ProtocolVersion {
        self.conn.version()
    }

    /// Whether a key exchange has been answered on this connection.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.conn.is_encrypted()
    }

    /// Raw `version` header of the last frame received.
    #[must_use]
    pub const fn peer_version(&self) -> Option<u32> {
        self.conn.peer_version()
    }

    /// Whether the controller subscribed to `event_name`.
    #[must_use]
    pub fn is_listening(&self, event_name: &str) -> bool {
        self.listening.contains(event_name)
    }

    /// Event names the controller is subscribed to.
    pub fn listening(&self) -> impl Iterator<Item = &str> {
        self.listening.iter().map(String::as_str)
    }

    /// Send an arbitrary frame.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_frame(
        &mut self,
        purpose: Purpose,
        body: Value,
        request_id: Option<&str>,
    ) -> Result<(), SessionError> {
        let frame = Frame::new(purpose, body, request_id, self.conn.version());
        self.conn.send(&frame)
    }

    /// Answer a command.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn respond_command(&mut self, request_id: &str, body: Value) -> Result<(), SessionError> {
        self.send_frame(Purpose::CommandResponse, body, Some(request_id))
    }

    /// Answer an agent command, stamping the action name and code.
    ///
    /// # Errors
    /// Returns [`SessionError::UnknownAction`] for a name outside the action
    /// table; nothing is sent in that case.
    pub fn respond_command_agent(
        &mut self,
        request_id: &str,
        action_name: &str,
        body: Value,
    ) -> Result<(), SessionError> {
        let action: AgentAction = action_name.parse()?;
        let frame = Frame::new(Purpose::AgentAction, body, Some(request_id), self.conn.version())
            .with_action(action.name(), action.code());
        self.conn.send(&frame)
    }

    /// Send an `error` frame.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_error(
        &mut self,
        status_code: i64,
        status_message: &str,
        request_id: Option<&str>,
    ) -> Result<(), SessionError> {
        self.send_error_frame(
            request_id,
            json!({ "statusCode": status_code, "statusMessage": status_message }),
        )
    }

    /// Send an `error` frame with a caller-built body.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_error_frame(&mut self, request_id: Option<&str>, body: Value) -> Result<(), SessionError> {
        self.send_frame(Purpose::Error, body, request_id)
    }

    /// Send an event whether or not the controller listens to it.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn send_event(
        &mut self,
        purpose: Purpose,
        event_name: &str,
        body: Value,
    ) -> Result<(), SessionError> {
        let frame = Frame::event(purpose, event_name, body, self.conn.version());
        self.conn.send(&frame)
    }

    /// Publish an `event` frame if the controller listens to `event_name`.
    ///
    /// Returns whether anything was sent.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn publish_event(&mut self, event_name: &str, body: Value) -> Result<bool, SessionError> {
        if !self.is_listening(event_name) {
            return Ok(false);
        }
        self.send_event(Purpose::Event, event_name, body)?;
        Ok(true)
    }

    /// Publish a decoded event, keeping its purpose and re-encoding it for
    /// this connection's version.
    ///
    /// # Errors
    /// Returns error if encoding or the transport fails.
    pub fn publish(&mut self, event: EventFrame) -> Result<bool, SessionError> {
        if !self.is_listening(&event.event_name) {
            return Ok(false);
        }
        self.send_event(event.purpose, &event.event_name, event.body)?;
        Ok(true)
    }

    /// Close the socket.
    ///
    /// # Errors
    /// Returns error if the transport is already gone.
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        self.conn.close()
    }

    /// Forget subscriptions after the transport closed.
    pub fn handle_closed(&mut self) {
        self.listening.clear();
    }

    /// Process one inbound message.
    ///
    /// Key exchange commands are answered here and never surface as commands.
    ///
    /// # Errors
    /// Returns error if the message is not a well-formed frame, or if a key
    /// exchange fails. A failed exchange has already been answered with a
    /// failure response.
    pub fn handle_message(
        &mut self,
        message: WireMessage,
    ) -> Result<Option<ExecutorEvent>, SessionError> {
        let frame = self.conn.decode(message)?;
        tracing::trace!(
            purpose = %frame.purpose(),
            request_id = %frame.header.request_id,
            "executor received frame"
        );
        match frame.purpose() {
            Purpose::CommandRequest => self.handle_command(frame).map(Some),
            Purpose::AgentAction => Ok(Some(Self::handle_agent(frame))),
            Purpose::Subscribe | Purpose::Unsubscribe => Ok(self.handle_subscription(frame)),
            _ => Ok(Some(ExecutorEvent::Custom(frame))),
        }
    }

    fn handle_command(&mut self, frame: Frame) -> Result<ExecutorEvent, SessionError> {
        let Some(command_line) = frame.body_str("commandLine") else {
            return Ok(ExecutorEvent::CommandLegacy(LegacyCommandRequest::from_frame(frame)));
        };
        let request_id = frame.header.request_id.clone();
        if is_key_exchange(command_line) {
            return self.accept_key_exchange(request_id, command_line);
        }
        Ok(ExecutorEvent::Command(CommandRequest {
            request_id,
            command_line: command_line.to_string(),
        }))
    }

    fn handle_agent(frame: Frame) -> ExecutorEvent {
        match frame.body_str("commandLine") {
            Some(command_line) => ExecutorEvent::CommandAgent(AgentCommandRequest {
                request_id: frame.header.request_id.clone(),
                command_line: command_line.to_string(),
            }),
            None => ExecutorEvent::CommandLegacy(LegacyCommandRequest::from_frame(frame)),
        }
    }

    fn handle_subscription(&mut self, frame: Frame) -> Option<ExecutorEvent> {
        let Some(event_name) = frame.body_str("eventName").map(str::to_string) else {
            tracing::warn!(purpose = %frame.purpose(), "subscription without eventName");
            return Some(ExecutorEvent::Custom(frame));
        };
        if frame.purpose() == &Purpose::Subscribe {
            self.listening
                .insert(event_name.clone())
                .then_some(ExecutorEvent::Subscribe { event_name })
        } else {
            self.listening
                .remove(&event_name)
                .then_some(ExecutorEvent::Unsubscribe { event_name })
        }
    }

    fn accept_key_exchange(
        &mut self,
        request_id: String,
        command_line: &str,
    ) -> Result<ExecutorEvent, SessionError> {
        let result = if self.conn.is_encrypted() {
            Err(HandshakeError::AlreadyInProgress)
        } else {
            respond_to_key_exchange(command_line)
        };
        match result {
            Ok(KeyExchangeResponse { public_key, cipher }) => {
                // The answer travels in the clear; the cipher applies from the next frame.
                self.respond_command(
                    &request_id,
                    json!({ "publicKey": public_key, "statusCode": 0 }),
                )?;
                self.conn.install_cipher(cipher);
                tracing::debug!(%request_id, "encryption enabled");
                Ok(ExecutorEvent::EncryptionEnabled { request_id })
            }
            Err(error) => {
                tracing::warn!(%request_id, "rejecting key exchange: {error}");
                self.respond_command(
                    &request_id,
                    json!({
                        "statusCode": i64::from(i32::MIN),
                        "statusMessage": error.to_string(),
                    }),
                )?;
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mcws_core::{
        KeyExchangeInitiator,
        frame::is_failure_status,
        transport::{Outbound, outbound_channel},
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    fn client(version: ProtocolVersion) -> (ExecutorClient, UnboundedReceiver<Outbound>) {
        let (tx, rx) = outbound_channel();
        (ExecutorClient::new(tx, version), rx)
    }

    fn sent(rx: &mut UnboundedReceiver<Outbound>) -> Frame {
        match rx.try_recv().expect("nothing sent") {
            Outbound::Message(WireMessage::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected outbound item: {other:?}"),
        }
    }

    fn incoming(purpose: Purpose, request_id: Option<&str>, body: Value) -> WireMessage {
        let frame = Frame::new(purpose, body, request_id, ProtocolVersion::V1)
            .with_message_type("commandRequest");
        WireMessage::Text(serde_json::to_string(&frame).unwrap())
    }

    #[test]
    fn test_command_request() {
        let (mut client, _rx) = client(ProtocolVersion::V1);
        let event = client
            .handle_message(incoming(
                Purpose::CommandRequest,
                Some("r1"),
                json!({"version": 1, "commandLine": "say hi", "origin": {"type": "player"}}),
            ))
            .unwrap();
        match event {
            Some(ExecutorEvent::Command(request)) => {
                assert_eq!(request.request_id, "r1");
                assert_eq!(request.command_line, "say hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_legacy_command_request() {
        let (mut client, _rx) = client(ProtocolVersion::V1);
        let event = client
            .handle_message(incoming(
                Purpose::CommandRequest,
                Some("r2"),
                json!({"version": 1, "name": "give", "overload": "default", "input": {"item": "apple"}}),
            ))
            .unwrap();
        match event {
            Some(ExecutorEvent::CommandLegacy(request)) => {
                assert_eq!(request.request_id, "r2");
                assert_eq!(request.name, "give");
                assert_eq!(request.overload, "default");
                assert_eq!(request.input, json!({"item": "apple"}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_agent_requests() {
        let (mut client, _rx) = client(ProtocolVersion::V1);
        let event = client
            .handle_message(incoming(
                Purpose::AgentAction,
                Some("a1"),
                json!({"version": 1, "commandLine": "agent turn left"}),
            ))
            .unwrap();
        assert!(matches!(
            event,
            Some(ExecutorEvent::CommandAgent(AgentCommandRequest { ref command_line, .. }))
                if command_line == "agent turn left"
        ));

        let event = client
            .handle_message(incoming(Purpose::AgentAction, Some("a2"), json!({"name": "agent"})))
            .unwrap();
        assert!(matches!(event, Some(ExecutorEvent::CommandLegacy(_))));
    }

    #[test]
    fn test_subscription_transitions() {
        let (mut client, _rx) = client(ProtocolVersion::V1);
        let subscribe = || incoming(Purpose::Subscribe, None, json!({"eventName": "PlayerMessage"}));
        let unsubscribe = || incoming(Purpose::Unsubscribe, None, json!({"eventName": "PlayerMessage"}));

        assert!(matches!(
            client.handle_message(subscribe()).unwrap(),
            Some(ExecutorEvent::Subscribe { ref event_name }) if event_name == "PlayerMessage"
        ));
        assert!(client.handle_message(subscribe()).unwrap().is_none());
        assert!(client.is_listening("PlayerMessage"));
        assert_eq!(client.listening().count(), 1);

        assert!(matches!(
            client.handle_message(unsubscribe()).unwrap(),
            Some(ExecutorEvent::Unsubscribe { .. })
        ));
        assert!(client.handle_message(unsubscribe()).unwrap().is_none());
        assert!(!client.is_listening("PlayerMessage"));
    }

    #[test]
    fn test_publish_only_when_listening() {
        let (mut client, mut rx) = client(ProtocolVersion::V2);
        assert!(!client.publish_event("PlayerMessage", json!({"message": "hi"})).unwrap());
        assert!(rx.try_recv().is_err());

        client
            .handle_message(incoming(Purpose::Subscribe, None, json!({"eventName": "PlayerMessage"})))
            .unwrap();
        assert!(client.publish_event("PlayerMessage", json!({"message": "hi"})).unwrap());

        let frame = sent(&mut rx);
        assert_eq!(frame.purpose(), &Purpose::Event);
        assert_eq!(frame.header.version, ProtocolVersion::V2.wire());
        assert_eq!(frame.header.event_name.as_deref(), Some("PlayerMessage"));
        assert_eq!(frame.body, json!({"message": "hi"}));
        assert!(frame.header.message_type.is_none());
    }

    #[test]
    fn test_publish_reencodes_for_own_version() {
        let (mut client, mut rx) = client(ProtocolVersion::V1);
        client
            .handle_message(incoming(Purpose::Subscribe, None, json!({"eventName": "PlayerMessage"})))
            .unwrap();

        let event = EventFrame {
            purpose: Purpose::Chat,
            event_name: "PlayerMessage".to_string(),
            version: ProtocolVersion::V2,
            body: json!({"message": "hi"}),
        };
        assert!(client.publish(event).unwrap());

        let frame = sent(&mut rx);
        assert_eq!(frame.purpose(), &Purpose::Chat);
        assert!(frame.header.event_name.is_none());
        assert_eq!(frame.body, json!({"message": "hi", "eventName": "PlayerMessage"}));
    }

    #[test]
    fn test_agent_response_carries_action_code() {
        let (mut client, mut rx) = client(ProtocolVersion::V1);
        client
            .respond_command_agent("a1", "inspect", json!({"statusCode": 0}))
            .unwrap();
        let frame = sent(&mut rx);
        assert_eq!(frame.purpose(), &Purpose::AgentAction);
        assert_eq!(frame.header.action_name.as_deref(), Some("inspect"));
        assert_eq!(frame.header.action, Some(8));

        assert!(matches!(
            client.respond_command_agent("a2", "fly", json!({})),
            Err(SessionError::UnknownAction(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_frame_shape() {
        let (mut client, mut rx) = client(ProtocolVersion::V1);
        client.send_error(2, "Error commandLegacy", Some("r9")).unwrap();
        let frame = sent(&mut rx);
        assert_eq!(frame.purpose(), &Purpose::Error);
        assert_eq!(frame.request_id(), Some("r9"));
        assert_eq!(frame.body, json!({"statusCode": 2, "statusMessage": "Error commandLegacy"}));

        client.send_error(3, "boom", None).unwrap();
        assert_eq!(sent(&mut rx).request_id(), None);
    }

    #[test]
    fn test_key_exchange_is_intercepted() {
        let (mut client, mut rx) = client(ProtocolVersion::V1);
        let initiator = KeyExchangeInitiator::new().unwrap();
        let event = client
            .handle_message(incoming(
                Purpose::CommandRequest,
                Some("k1"),
                json!({"version": 1, "commandLine": initiator.command_line()}),
            ))
            .unwrap();
        assert!(matches!(
            event,
            Some(ExecutorEvent::EncryptionEnabled { ref request_id }) if request_id == "k1"
        ));
        assert!(client.is_encrypted());

        let answer = sent(&mut rx);
        assert_eq!(answer.purpose(), &Purpose::CommandResponse);
        assert_eq!(answer.status_code(), Some(0));
        let public_key = answer.body_str("publicKey").unwrap();
        assert!(initiator.complete(public_key).is_ok());
    }

    #[test]
    fn test_malformed_key_exchange_is_answered_with_failure() {
        let (mut client, mut rx) = client(ProtocolVersion::V1);
        let result = client.handle_message(incoming(
            Purpose::CommandRequest,
            Some("k2"),
            json!({"version": 1, "commandLine": "enableencryption \"nope\" \"AAAA\""}),
        ));
        assert!(matches!(result, Err(SessionError::Handshake(_))));
        assert!(!client.is_encrypted());

        let answer = sent(&mut rx);
        assert_eq!(answer.request_id(), Some("k2"));
        assert!(answer.status_code().is_some_and(is_failure_status));
    }
}

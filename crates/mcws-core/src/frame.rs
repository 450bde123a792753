//! Frame envelope shared by both connection roles.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request id carried by frames that correlate with nothing.
pub const NIL_REQUEST_ID: &str = "00000000-0000-0000-0000-000000000000";

/// `messageType` stamped on every controller-issued header.
pub const COMMAND_REQUEST_TYPE: &str = "commandRequest";

/// Bit of `statusCode` that marks an application-level failure.
pub const FAILURE_BIT: u32 = 1 << 31;

const V1_WIRE: u32 = 1;
const V2_WIRE: u32 = 16_842_752;

/// Wire generation of a connection.
///
/// Only the shape of event frames depends on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Legacy framing: `eventName` lives in the body.
    #[default]
    V1,
    /// Current framing: `eventName` lives in the header.
    V2,
}

impl ProtocolVersion {
    /// Numeric value written into the `version` header field.
    #[must_use]
    pub const fn wire(self) -> u32 {
        match self {
            Self::V1 => V1_WIRE,
            Self::V2 => V2_WIRE,
        }
    }

    /// Classify a received `version` header value.
    #[must_use]
    pub const fn from_wire(version: u32) -> Self {
        if version >= V2_WIRE { Self::V2 } else { Self::V1 }
    }
}

/// Header discriminator selecting how a frame is handled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Purpose {
    /// `subscribe`: start publishing an event.
    Subscribe,
    /// `unsubscribe`: stop publishing an event.
    Unsubscribe,
    /// `commandRequest`: run a command line or a legacy structured command.
    CommandRequest,
    /// `action:agent`: agent command, and the agent's response to it.
    AgentAction,
    /// `commandResponse`: answer to a command request.
    CommandResponse,
    /// `error`: application-level failure, usually tied to a request.
    Error,
    /// `event`: published game event.
    Event,
    /// `chat`: published chat message, shaped like an event.
    Chat,
    /// Anything this engine does not know about, kept verbatim.
    Custom(String),
}

impl Purpose {
    /// Wire spelling of the purpose.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::CommandRequest => "commandRequest",
            Self::AgentAction => "action:agent",
            Self::CommandResponse => "commandResponse",
            Self::Error => "error",
            Self::Event => "event",
            Self::Chat => "chat",
            Self::Custom(name) => name,
        }
    }

    /// Whether frames with this purpose carry a published event.
    #[must_use]
    pub const fn is_event(&self) -> bool {
        matches!(self, Self::Event | Self::Chat)
    }
}

impl From<String> for Purpose {
    fn from(value: String) -> Self {
        match value.as_str() {
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "commandRequest" => Self::CommandRequest,
            "action:agent" => Self::AgentAction,
            "commandResponse" => Self::CommandResponse,
            "error" => Self::Error,
            "event" => Self::Event,
            "chat" => Self::Chat,
            _ => Self::Custom(value),
        }
    }
}

impl From<Purpose> for String {
    fn from(value: Purpose) -> Self {
        match value {
            Purpose::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_version() -> u32 {
    V1_WIRE
}

fn nil_request_id() -> String {
    NIL_REQUEST_ID.to_string()
}

/// Frame header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "nil_request_id")]
    pub request_id: String,
    #[serde(rename = "messagePurpose")]
    pub purpose: Purpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<u8>,
}

/// One header + body message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub header: Header,
    #[serde(default)]
    pub body: Value,
}

impl Frame {
    /// Build a frame with a bare header.
    ///
    /// A missing request id is replaced by [`NIL_REQUEST_ID`].
    #[must_use]
    pub fn new(
        purpose: Purpose,
        body: Value,
        request_id: Option<&str>,
        version: ProtocolVersion,
    ) -> Self {
        Self {
            header: Header {
                version: version.wire(),
                request_id: request_id.map_or_else(nil_request_id, str::to_string),
                purpose,
                message_type: None,
                event_name: None,
                action_name: None,
                action: None,
            },
            body,
        }
    }

    /// Build an event frame, placing `event_name` where `version` expects it.
    #[must_use]
    pub fn event(
        purpose: Purpose,
        event_name: &str,
        body: Value,
        version: ProtocolVersion,
    ) -> Self {
        match version {
            ProtocolVersion::V2 => {
                let mut frame = Self::new(purpose, body, None, version);
                frame.header.event_name = Some(event_name.to_string());
                frame
            }
            ProtocolVersion::V1 => {
                let mut map = match body {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                map.insert("eventName".to_string(), Value::String(event_name.to_string()));
                Self::new(purpose, Value::Object(map), None, version)
            }
        }
    }

    /// Stamp `messageType`.
    #[must_use]
    pub fn with_message_type(mut self, message_type: &str) -> Self {
        self.header.message_type = Some(message_type.to_string());
        self
    }

    /// Stamp the agent action name and code.
    #[must_use]
    pub fn with_action(mut self, action_name: &str, action: u8) -> Self {
        self.header.action_name = Some(action_name.to_string());
        self.header.action = Some(action);
        self
    }

    /// Purpose of this frame.
    #[must_use]
    pub const fn purpose(&self) -> &Purpose {
        &self.header.purpose
    }

    /// Wire generation the sender used.
    #[must_use]
    pub const fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_wire(self.header.version)
    }

    /// Correlation id, or `None` for the nil sentinel.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        let id = self.header.request_id.as_str();
        (id != NIL_REQUEST_ID).then_some(id)
    }

    /// Read a string field of the body.
    #[must_use]
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// `statusCode` of the body, if present.
    #[must_use]
    pub fn status_code(&self) -> Option<i64> {
        self.body.get("statusCode").and_then(Value::as_i64)
    }

    /// `statusMessage` of the body, if present.
    #[must_use]
    pub fn status_message(&self) -> Option<&str> {
        self.body_str("statusMessage")
    }

    /// Extract the published event, stripping `eventName` from V1 bodies.
    ///
    /// # Errors
    /// Returns the frame unchanged if it is not an event or has no event name.
    pub fn into_event(self) -> Result<EventFrame, Self> {
        let version = self.protocol_version();
        let has_name = match version {
            ProtocolVersion::V2 => self.header.event_name.is_some(),
            ProtocolVersion::V1 => self.body_str("eventName").is_some(),
        };
        if !self.header.purpose.is_event() || !has_name {
            return Err(self);
        }
        let Self { header, mut body } = self;
        let event_name = match version {
            ProtocolVersion::V2 => header.event_name.unwrap_or_default(),
            ProtocolVersion::V1 => body
                .as_object_mut()
                .and_then(|map| map.remove("eventName"))
                .and_then(|name| name.as_str().map(str::to_string))
                .unwrap_or_default(),
        };
        Ok(EventFrame {
            purpose: header.purpose,
            event_name,
            version,
            body,
        })
    }
}

/// A published event, independent of its wire placement.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    /// `event` or `chat`.
    pub purpose: Purpose,
    /// Name the event is published and subscribed under.
    pub event_name: String,
    /// Shape the event arrived in, or is sent in.
    pub version: ProtocolVersion,
    /// Pure payload, without `eventName`.
    pub body: Value,
}

/// Whether a numeric status code reports failure.
///
/// Codes are 32-bit on the wire and may arrive sign-extended, so both the
/// `i32` and the `u32` reading are accepted. Anything outside those ranges is
/// not a status code and never counts as a failure.
#[must_use]
pub fn is_failure_status(code: i64) -> bool {
    match i32::try_from(code) {
        Ok(signed) => signed < 0,
        Err(_) => u32::try_from(code).is_ok_and(|unsigned| unsigned & FAILURE_BIT != 0),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_purpose_wire_names() {
        for purpose in [
            Purpose::Subscribe,
            Purpose::Unsubscribe,
            Purpose::CommandRequest,
            Purpose::AgentAction,
            Purpose::CommandResponse,
            Purpose::Error,
            Purpose::Event,
            Purpose::Chat,
        ] {
            assert_eq!(Purpose::from(purpose.as_str().to_string()), purpose);
        }
        assert_eq!(
            Purpose::from("ws:encrypt".to_string()),
            Purpose::Custom("ws:encrypt".to_string())
        );
    }

    #[test]
    fn test_version_classification() {
        assert_eq!(ProtocolVersion::from_wire(1), ProtocolVersion::V1);
        assert_eq!(ProtocolVersion::from_wire(16_842_752), ProtocolVersion::V2);
        assert_eq!(ProtocolVersion::from_wire(16_973_824), ProtocolVersion::V2);
    }

    #[test]
    fn test_header_defaults() {
        let frame: Frame =
            serde_json::from_str(r#"{"header":{"messagePurpose":"commandResponse"},"body":{}}"#)
                .unwrap();
        assert_eq!(frame.header.version, 1);
        assert_eq!(frame.header.request_id, NIL_REQUEST_ID);
        assert_eq!(frame.request_id(), None);
    }

    #[test]
    fn test_v2_event_keeps_body_pure() {
        let frame = Frame::event(
            Purpose::Event,
            "PlayerMessage",
            json!({"message": "hi"}),
            ProtocolVersion::V2,
        );
        assert_eq!(frame.header.event_name.as_deref(), Some("PlayerMessage"));
        assert!(frame.body.get("eventName").is_none());

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["header"]["eventName"], "PlayerMessage");
    }

    #[test]
    fn test_v1_event_puts_name_in_body() {
        let frame = Frame::event(
            Purpose::Event,
            "PlayerMessage",
            json!({"message": "hi"}),
            ProtocolVersion::V1,
        );
        assert!(frame.header.event_name.is_none());
        assert_eq!(frame.body["eventName"], "PlayerMessage");

        let json = serde_json::to_value(&frame).unwrap();
        assert!(json["header"].get("eventName").is_none());
    }

    #[test]
    fn test_into_event_is_placement_independent() {
        for version in [ProtocolVersion::V1, ProtocolVersion::V2] {
            let frame = Frame::event(Purpose::Chat, "BlockBroken", json!({"count": 3}), version);
            let text = serde_json::to_string(&frame).unwrap();
            let decoded: Frame = serde_json::from_str(&text).unwrap();
            let event = decoded.into_event().unwrap();
            assert_eq!(event.event_name, "BlockBroken");
            assert_eq!(event.purpose, Purpose::Chat);
            assert_eq!(event.version, version);
            assert_eq!(event.body, json!({"count": 3}));
        }
    }

    #[test]
    fn test_into_event_rejects_non_events() {
        let frame = Frame::new(Purpose::CommandResponse, json!({}), Some("r1"), ProtocolVersion::V2);
        let frame = frame.into_event().unwrap_err();
        assert_eq!(frame.request_id(), Some("r1"));

        let nameless = Frame::new(Purpose::Event, json!({}), None, ProtocolVersion::V1);
        assert!(nameless.into_event().is_err());
    }

    #[test]
    fn test_failure_bit() {
        assert!(!is_failure_status(0));
        assert!(!is_failure_status(2));
        assert!(is_failure_status(-2_147_483_648));
        assert!(is_failure_status(-2_147_483_646));
        assert!(is_failure_status(0x8000_0001));
        assert!(is_failure_status(0xFFFF_FFFF));
    }

    #[test]
    fn test_out_of_range_status_is_not_failure() {
        assert!(!is_failure_status(0x1_8000_0000));
        assert!(!is_failure_status(0x1_0000_0000));
        assert!(!is_failure_status(-0x8000_0001));
        assert!(!is_failure_status(i64::MIN));
        assert!(!is_failure_status(i64::MAX));
    }
}

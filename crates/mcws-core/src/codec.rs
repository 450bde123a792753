//! Frame codec with transparent per-hop encryption.

use bytes::Bytes;
use thiserror::Error;

use crate::{Frame, StreamCipher, transport::WireMessage};

/// Failure to turn one wire message into a frame or back.
///
/// Scoped to that message; the connection stays usable.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decrypted payload is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Serializes frames as JSON text, or cipher-stream bytes once encrypted.
#[derive(Debug, Default)]
pub struct FrameCodec {
    cipher: Option<StreamCipher>,
}

impl FrameCodec {
    /// Plain-text codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every following message through `cipher`.
    pub fn install_cipher(&mut self, cipher: StreamCipher) {
        self.cipher = Some(cipher);
    }

    /// Whether a cipher is installed.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encode a frame for the wire.
    ///
    /// # Errors
    /// Returns error if the frame cannot be serialized.
    pub fn encode(&mut self, frame: &Frame) -> Result<WireMessage, CodecError> {
        let text = serde_json::to_string(frame)?;
        match &mut self.cipher {
            Some(cipher) => {
                let mut data = text.into_bytes();
                cipher.encrypt(&mut data);
                Ok(WireMessage::Binary(Bytes::from(data)))
            }
            None => Ok(WireMessage::Text(text)),
        }
    }

    /// Decode a wire message.
    ///
    /// # Errors
    /// Returns error if the payload is not a well-formed frame.
    pub fn decode(&mut self, message: WireMessage) -> Result<Frame, CodecError> {
        let text = match &mut self.cipher {
            Some(cipher) => {
                let mut data = message.into_bytes();
                cipher.decrypt(&mut data);
                String::from_utf8(data)?
            }
            None => match message {
                WireMessage::Text(text) => text,
                WireMessage::Binary(data) => String::from_utf8(data.to_vec())?,
            },
        };
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        KeyExchangeInitiator, ProtocolVersion, Purpose, encryption::respond_to_key_exchange,
    };

    fn encrypted_pair() -> (FrameCodec, FrameCodec) {
        let initiator = KeyExchangeInitiator::new().unwrap();
        let response = respond_to_key_exchange(&initiator.command_line()).unwrap();
        let mut controller = FrameCodec::new();
        controller.install_cipher(initiator.complete(&response.public_key).unwrap());
        let mut executor = FrameCodec::new();
        executor.install_cipher(response.cipher);
        (controller, executor)
    }

    #[test]
    fn test_plain_frames_are_text() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(
            Purpose::CommandRequest,
            json!({"commandLine": "say hi"}),
            Some("r1"),
            ProtocolVersion::V1,
        );
        let encoded = codec.encode(&frame).unwrap();
        let WireMessage::Text(text) = &encoded else {
            panic!("expected text");
        };
        assert!(text.contains("\"messagePurpose\":\"commandRequest\""));
        assert!(text.contains("\"requestId\":\"r1\""));
        assert_eq!(codec.decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_malformed_payload_is_recoverable() {
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(WireMessage::Text("{not json".to_string())),
            Err(CodecError::Json(_))
        ));
        let frame = Frame::new(Purpose::Subscribe, json!({"eventName": "x"}), None, ProtocolVersion::V1);
        let encoded = codec.encode(&frame).unwrap();
        assert_eq!(codec.decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_encrypted_frames_in_order() {
        let (mut controller, mut executor) = encrypted_pair();
        let frames: Vec<Frame> = (0..5)
            .map(|i| {
                Frame::new(
                    Purpose::CommandRequest,
                    json!({"commandLine": format!("say {i}")}),
                    Some(&format!("r{i}")),
                    ProtocolVersion::V2,
                )
            })
            .collect();

        let wire: Vec<WireMessage> = frames.iter().map(|f| controller.encode(f).unwrap()).collect();
        assert!(wire.iter().all(|m| matches!(m, WireMessage::Binary(_))));
        for (message, frame) in wire.into_iter().zip(&frames) {
            assert_eq!(&executor.decode(message).unwrap(), frame);
        }
    }

    #[test]
    fn test_encrypted_frames_out_of_order_fail() {
        let (mut controller, mut executor) = encrypted_pair();
        let first = Frame::new(Purpose::Subscribe, json!({"eventName": "a"}), None, ProtocolVersion::V2);
        let second = Frame::new(Purpose::Subscribe, json!({"eventName": "b"}), None, ProtocolVersion::V2);
        let _first = controller.encode(&first).unwrap();
        let second_wire = controller.encode(&second).unwrap();

        // Either the JSON breaks or the content is wrong.
        if let Ok(decoded) = executor.decode(second_wire) {
            assert_ne!(decoded, second);
        }
    }
}

//! Per-connection codec, outbound channel and version bookkeeping.

use mcws_core::{
    CodecError, Frame, FrameCodec, HandshakeError, OutboundSender, ProtocolVersion, StreamCipher,
    TransportError, UnknownAction, WireMessage,
};

/// Error raised by a session operation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    UnknownAction(#[from] UnknownAction),
}

pub(crate) struct Connection {
    codec: FrameCodec,
    outbound: OutboundSender,
    version: ProtocolVersion,
    peer_version: Option<u32>,
}

impl Connection {
    pub(crate) fn new(outbound: OutboundSender, version: ProtocolVersion) -> Self {
        Self {
            codec: FrameCodec::new(),
            outbound,
            version,
            peer_version: None,
        }
    }

    pub(crate) const fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub(crate) const fn peer_version(&self) -> Option<u32> {
        self.peer_version
    }

    pub(crate) const fn is_encrypted(&self) -> bool {
        self.codec.is_encrypted()
    }

    pub(crate) fn install_cipher(&mut self, cipher: StreamCipher) {
        self.codec.install_cipher(cipher);
    }

    pub(crate) fn send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let message = self.codec.encode(frame)?;
        self.outbound.send(message)?;
        Ok(())
    }

    pub(crate) fn decode(&mut self, message: WireMessage) -> Result<Frame, CodecError> {
        let frame = self.codec.decode(message)?;
        self.peer_version = Some(frame.header.version);
        Ok(frame)
    }

    pub(crate) fn close(&self) -> Result<(), SessionError> {
        self.outbound.close()?;
        Ok(())
    }
}

//! In-band key exchange and the per-hop stream cipher.
//!
//! The controller side starts the exchange by sending
//! `enableencryption "<publicKey>" "<salt>"` as an ordinary command. The
//! executor answers with its own public key; both ends then derive
//! `key = SHA-256(salt || ecdh_secret)` and `iv = key[..16]` and switch to
//! AES-256-CFB8. The cipher state runs across messages, so frames must be
//! decrypted in the order they were encrypted.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, generic_array::GenericArray};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use p384::{PublicKey, ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256Cfb8Enc = cfb8::Encryptor<aes::Aes256>;
type Aes256Cfb8Dec = cfb8::Decryptor<aes::Aes256>;

/// Command name that starts a key exchange.
pub const KEY_EXCHANGE_COMMAND: &str = "enableencryption";

/// Subprotocol identifier advertised by encryption-capable peers.
pub const ENCRYPTION_SUBPROTOCOL: &str = "com.microsoft.minecraft.wsencrypt";

/// DER prefix turning a raw secp384r1 point into a SubjectPublicKeyInfo.
const SPKI_HEADER: [u8; 23] = [
    0x30, 0x76, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05, 0x2b,
    0x81, 0x04, 0x00, 0x22, 0x03, 0x62, 0x00,
];

/// Uncompressed SEC1 point length for P-384.
const POINT_LEN: usize = 97;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;

/// Key exchange failure. Only the attempt is lost, never the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("key exchange already in progress")]
    AlreadyInProgress,
    #[error("malformed key exchange command: {0}")]
    MalformedCommand(String),
    #[error("key exchange response carries no public key")]
    MissingPublicKey,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported public key encoding ({0} bytes)")]
    UnsupportedKeyFormat(usize),
    #[error("public key is not a valid P-384 point")]
    InvalidPoint,
    #[error("salt must be 16 bytes, got {0}")]
    InvalidSalt(usize),
    #[error("cipher setup failed: {0}")]
    Cipher(String),
    #[error("peer rejected key exchange with status {0}")]
    Rejected(i64),
    #[error("connection closed during key exchange")]
    Closed,
}

/// Wrap a raw P-384 point in the fixed SubjectPublicKeyInfo header.
///
/// # Errors
/// Returns error unless `point` is an uncompressed P-384 point.
pub fn wrap_public_key(point: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    if point.len() != POINT_LEN || point[0] != 0x04 {
        return Err(HandshakeError::UnsupportedKeyFormat(point.len()));
    }
    let mut spki = Vec::with_capacity(SPKI_HEADER.len() + POINT_LEN);
    spki.extend_from_slice(&SPKI_HEADER);
    spki.extend_from_slice(point);
    Ok(spki)
}

/// Strip the SubjectPublicKeyInfo header from a received key.
///
/// # Errors
/// Returns error if the header or length does not match P-384 exactly.
pub fn unwrap_public_key(spki: &[u8]) -> Result<&[u8], HandshakeError> {
    if spki.len() != SPKI_HEADER.len() + POINT_LEN {
        return Err(HandshakeError::UnsupportedKeyFormat(spki.len()));
    }
    spki.strip_prefix(SPKI_HEADER.as_slice())
        .ok_or(HandshakeError::UnsupportedKeyFormat(spki.len()))
}

fn decode_public_key(encoded: &str) -> Result<PublicKey, HandshakeError> {
    let spki = BASE64.decode(encoded)?;
    let point = unwrap_public_key(&spki)?;
    PublicKey::from_sec1_bytes(point).map_err(|_| HandshakeError::InvalidPoint)
}

fn encode_public_key(secret: &EphemeralSecret) -> Result<String, HandshakeError> {
    let point = secret.public_key().to_encoded_point(false);
    Ok(BASE64.encode(wrap_public_key(point.as_bytes())?))
}

/// Whether a command line is a key exchange request.
#[must_use]
pub fn is_key_exchange(command_line: &str) -> bool {
    command_line
        .strip_prefix(KEY_EXCHANGE_COMMAND)
        .is_some_and(|rest| rest.starts_with(' '))
}

/// Running AES-256-CFB8 cipher/decipher pair for one hop.
pub struct StreamCipher {
    encryptor: Aes256Cfb8Enc,
    decryptor: Aes256Cfb8Dec,
}

impl StreamCipher {
    fn derive(secret: &[u8], salt: &[u8]) -> Result<Self, HandshakeError> {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(secret);
        let key = hasher.finalize();
        let iv = &key[..IV_LEN];
        let encryptor = Aes256Cfb8Enc::new_from_slices(&key, iv)
            .map_err(|e| HandshakeError::Cipher(e.to_string()))?;
        let decryptor = Aes256Cfb8Dec::new_from_slices(&key, iv)
            .map_err(|e| HandshakeError::Cipher(e.to_string()))?;
        Ok(Self {
            encryptor,
            decryptor,
        })
    }

    /// Encrypt in place, advancing the outgoing stream.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            self.encryptor
                .encrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(byte)));
        }
    }

    /// Decrypt in place, advancing the incoming stream.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            self.decryptor
                .decrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(byte)));
        }
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamCipher { .. }")
    }
}

/// Controller half of the exchange: owns the salt and sends first.
pub struct KeyExchangeInitiator {
    secret: EphemeralSecret,
    public_key: String,
    salt: [u8; SALT_LEN],
}

impl KeyExchangeInitiator {
    /// Generate an ephemeral key pair and salt.
    ///
    /// # Errors
    /// Returns error if the generated key cannot be wrapped.
    pub fn new() -> Result<Self, HandshakeError> {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_key = encode_public_key(&secret)?;
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Ok(Self {
            secret,
            public_key,
            salt,
        })
    }

    /// Base64 wrapped public key.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Base64 salt.
    #[must_use]
    pub fn salt(&self) -> String {
        BASE64.encode(self.salt)
    }

    /// Command line to send to the executor.
    #[must_use]
    pub fn command_line(&self) -> String {
        let public_key = serde_json::Value::String(self.public_key.clone());
        let salt = serde_json::Value::String(self.salt());
        format!("{KEY_EXCHANGE_COMMAND} {public_key} {salt}")
    }

    /// Finish with the executor's public key.
    ///
    /// # Errors
    /// Returns error if the peer key is malformed.
    pub fn complete(self, peer_public_key: &str) -> Result<StreamCipher, HandshakeError> {
        let peer = decode_public_key(peer_public_key)?;
        let shared = self.secret.diffie_hellman(&peer);
        StreamCipher::derive(shared.raw_secret_bytes().as_slice(), &self.salt)
    }
}

impl std::fmt::Debug for KeyExchangeInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchangeInitiator")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Executor reply to a key exchange command.
#[derive(Debug)]
pub struct KeyExchangeResponse {
    /// Base64 wrapped public key to send back.
    pub public_key: String,
    /// Cipher to install once the reply has gone out.
    pub cipher: StreamCipher,
}

/// Answer a key exchange command as the executor.
///
/// # Errors
/// Returns error if the command arguments or the peer key are malformed.
pub fn respond_to_key_exchange(command_line: &str) -> Result<KeyExchangeResponse, HandshakeError> {
    let mut args = command_line.split(' ');
    if args.next() != Some(KEY_EXCHANGE_COMMAND) {
        return Err(HandshakeError::MalformedCommand(command_line.to_string()));
    }
    let (Some(public_key), Some(salt)) = (args.next(), args.next()) else {
        return Err(HandshakeError::MalformedCommand(command_line.to_string()));
    };
    let public_key: String = serde_json::from_str(public_key)
        .map_err(|e| HandshakeError::MalformedCommand(e.to_string()))?;
    let salt: String =
        serde_json::from_str(salt).map_err(|e| HandshakeError::MalformedCommand(e.to_string()))?;
    let salt = BASE64.decode(salt)?;
    if salt.len() != SALT_LEN {
        return Err(HandshakeError::InvalidSalt(salt.len()));
    }

    let peer = decode_public_key(&public_key)?;
    let secret = EphemeralSecret::random(&mut OsRng);
    let own_public_key = encode_public_key(&secret)?;
    let shared = secret.diffie_hellman(&peer);
    let cipher = StreamCipher::derive(shared.raw_secret_bytes().as_slice(), &salt)?;

    Ok(KeyExchangeResponse {
        public_key: own_public_key,
        cipher,
    })
}

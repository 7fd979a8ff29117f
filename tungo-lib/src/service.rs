//! In-band control packets carried over the encrypted channel.
//!
//! A decrypted record is a service packet when its first byte equals the
//! service version; plaintext IP packets begin with version nibble 4 or
//! 6, so the two spaces never collide.

use thiserror::Error;

pub const SERVICE_VERSION: u8 = 1;
pub const SERVICE_HEADER_LEN: usize = 3;
pub const REKEY_KEY_LEN: usize = 32;

const TYPE_REKEY_INIT: u8 = 1;
const TYPE_REKEY_ACK: u8 = 2;
const TYPE_SESSION_RESET: u8 = 3;
const TYPE_KEEP_ALIVE: u8 = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServiceError {
    #[error("truncated service packet: {0} bytes")]
    Truncated(usize),

    #[error("unknown service packet type: {0}")]
    UnknownType(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServicePacket {
    /// Start of a rekey: the sender's ephemeral X25519 public key.
    RekeyInit([u8; REKEY_KEY_LEN]),
    /// Rekey acknowledgment carrying the responder's ephemeral key.
    RekeyAck([u8; REKEY_KEY_LEN]),
    /// The peer is tearing the session down; re-establish to continue.
    SessionReset,
    /// Liveness signal, never forwarded to the TUN device.
    KeepAlive,
}

impl ServicePacket {
    /// Whether a decrypted record is a service packet rather than an IP
    /// packet.
    pub fn is_service(plaintext: &[u8]) -> bool {
        plaintext.first() == Some(&SERVICE_VERSION)
    }

    pub fn encode(&self) -> Vec<u8> {
        let (packet_type, key) = match self {
            ServicePacket::RekeyInit(key) => (TYPE_REKEY_INIT, Some(key)),
            ServicePacket::RekeyAck(key) => (TYPE_REKEY_ACK, Some(key)),
            ServicePacket::SessionReset => (TYPE_SESSION_RESET, None),
            ServicePacket::KeepAlive => (TYPE_KEEP_ALIVE, None),
        };
        let mut buf = Vec::with_capacity(SERVICE_HEADER_LEN + REKEY_KEY_LEN);
        buf.extend_from_slice(&[SERVICE_VERSION, packet_type, 0]);
        if let Some(key) = key {
            buf.extend_from_slice(key);
        }
        buf
    }

    /// Decode a service packet. Returns `None` when the record is not a
    /// service packet at all (the caller forwards it as an IP packet).
    pub fn decode(plaintext: &[u8]) -> Result<Option<Self>, ServiceError> {
        if !Self::is_service(plaintext) {
            return Ok(None);
        }
        if plaintext.len() < SERVICE_HEADER_LEN {
            return Err(ServiceError::Truncated(plaintext.len()));
        }
        let packet = match plaintext[1] {
            TYPE_REKEY_INIT => ServicePacket::RekeyInit(read_key(plaintext)?),
            TYPE_REKEY_ACK => ServicePacket::RekeyAck(read_key(plaintext)?),
            TYPE_SESSION_RESET => ServicePacket::SessionReset,
            TYPE_KEEP_ALIVE => ServicePacket::KeepAlive,
            other => return Err(ServiceError::UnknownType(other)),
        };
        Ok(Some(packet))
    }
}

fn read_key(plaintext: &[u8]) -> Result<[u8; REKEY_KEY_LEN], ServiceError> {
    if plaintext.len() < SERVICE_HEADER_LEN + REKEY_KEY_LEN {
        return Err(ServiceError::Truncated(plaintext.len()));
    }
    let mut key = [0u8; REKEY_KEY_LEN];
    key.copy_from_slice(&plaintext[SERVICE_HEADER_LEN..SERVICE_HEADER_LEN + REKEY_KEY_LEN]);
    Ok(key)
}

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use zeroize::Zeroizing;

use crate::error::{Result, TunnelError};

use super::Config;

/// Key material a listening server needs: its Noise static, the Ed25519
/// identity it signs handshakes with, and the client static it admits.
pub struct ServerIdentity {
    pub noise_private: Zeroizing<[u8; 32]>,
    pub signing_key: SigningKey,
    pub client_public: [u8; 32],
}

/// Key material a connecting client needs: its Noise static, the
/// server's Noise static, and the server's published Ed25519 key.
pub struct ClientIdentity {
    pub noise_private: Zeroizing<[u8; 32]>,
    pub server_public: [u8; 32],
    pub server_verifying: VerifyingKey,
}

impl Config {
    pub fn server_identity(&self) -> Result<ServerIdentity> {
        let noise_private = Zeroizing::new(decode_key32(
            "x25519_private_key",
            self.x25519_private_key.as_deref(),
        )?);
        let signing_key = SigningKey::from_bytes(&decode_key32(
            "ed25519_private_key",
            self.ed25519_private_key.as_deref(),
        )?);
        let client_public = decode_key32(
            "x25519_client_public_key",
            self.x25519_client_public_key.as_deref(),
        )?;
        Ok(ServerIdentity { noise_private, signing_key, client_public })
    }

    pub fn client_identity(&self) -> Result<ClientIdentity> {
        // generated client bundles historically used the long key name
        let private = self
            .x25519_private_key
            .as_deref()
            .or(self.x25519_client_private_key.as_deref());
        let noise_private = Zeroizing::new(decode_key32("x25519_private_key", private)?);
        let server_public = decode_key32(
            "x25519_server_public_key",
            self.x25519_server_public_key.as_deref(),
        )?;
        let verifying_bytes =
            decode_key32("ed25519_public_key", self.ed25519_public_key.as_deref())?;
        let server_verifying = VerifyingKey::from_bytes(&verifying_bytes)
            .map_err(|e| TunnelError::Config(format!("ed25519_public_key: {e}")))?;
        Ok(ClientIdentity { noise_private, server_public, server_verifying })
    }
}

fn decode_key32(name: &str, value: Option<&str>) -> Result<[u8; 32]> {
    let value = value
        .ok_or_else(|| TunnelError::Config(format!("missing required key material: {name}")))?;
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|e| TunnelError::Config(format!("{name} is not valid base64: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| TunnelError::Config(format!("{name} must decode to 32 bytes, got {}", bytes.len())))
}

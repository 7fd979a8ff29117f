//! Noise IK handshake binding a framed transport to a fresh session.
//!
//! Two messages: the initiator (client) knows the server's static X25519
//! key and sends its requested VPN address in the first payload; the
//! responder answers with the assigned address plus an Ed25519 signature
//! over the transcript hash as seen after the first message, proving the
//! listening endpoint also holds the published identity key. Epoch-0
//! direction keys come from the raw split of the finished handshake.
//!
//! The handshake core is transport-free: the stream path drives it
//! through framed records, the UDP acceptor feeds it raw datagrams.

use std::net::IpAddr;

use ed25519_dalek::{Signature, Signer, Verifier};
use snow::HandshakeState;
use zeroize::Zeroizing;

use crate::config::{ClientIdentity, ServerIdentity};
use crate::crypto::SessionSecrets;
use crate::error::{Result, TunnelError};
use crate::transport::{LinkReader, LinkWriter};

pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

const SIGNATURE_LEN: usize = 64;
const MAX_HANDSHAKE_MSG: usize = 1024;

pub struct HandshakeOutcome {
    pub secrets: SessionSecrets,
    pub internal_ip: IpAddr,
}

fn handshake_error(context: &str, err: impl std::fmt::Display) -> TunnelError {
    TunnelError::Handshake(format!("{context}: {err}"))
}

fn noise_params() -> Result<snow::params::NoiseParams> {
    NOISE_PATTERN
        .parse()
        .map_err(|e| handshake_error("noise parameters", e))
}

fn split_secrets(mut state: HandshakeState, is_server: bool) -> Result<SessionSecrets> {
    let id: [u8; 32] = state
        .get_handshake_hash()
        .try_into()
        .map_err(|_| TunnelError::Handshake("unexpected transcript hash length".into()))?;
    let (i_to_r, r_to_i) = state.dangerously_get_raw_split();
    Ok(SessionSecrets {
        id,
        key_c2s: Zeroizing::new(i_to_r),
        key_s2c: Zeroizing::new(r_to_i),
        is_server,
    })
}

fn ip_from_octets(octets: &[u8]) -> Result<IpAddr> {
    match octets.len() {
        4 => {
            let bytes: [u8; 4] = octets.try_into().map_err(|_| {
                TunnelError::Handshake("malformed IPv4 payload".into())
            })?;
            Ok(IpAddr::from(bytes))
        }
        16 => {
            let bytes: [u8; 16] = octets.try_into().map_err(|_| {
                TunnelError::Handshake("malformed IPv6 payload".into())
            })?;
            Ok(IpAddr::from(bytes))
        }
        other => Err(TunnelError::Handshake(format!(
            "address payload of {other} bytes"
        ))),
    }
}

fn ip_octets(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Client half, sans IO: produces the first message, then consumes the
/// server's reply.
pub struct ClientHandshake {
    state: HandshakeState,
    transcript_after_init: Vec<u8>,
    server_verifying: ed25519_dalek::VerifyingKey,
}

pub fn initiate(
    identity: &ClientIdentity,
    requested_ip: IpAddr,
) -> Result<(ClientHandshake, Vec<u8>)> {
    let mut state = snow::Builder::new(noise_params()?)
        .local_private_key(identity.noise_private.as_ref())
        .remote_public_key(&identity.server_public)
        .build_initiator()
        .map_err(|e| handshake_error("initiator build", e))?;

    let mut msg = vec![0u8; MAX_HANDSHAKE_MSG];
    let n = state
        .write_message(&ip_octets(requested_ip), &mut msg)
        .map_err(|e| handshake_error("initiation", e))?;
    msg.truncate(n);

    let transcript_after_init = state.get_handshake_hash().to_vec();
    Ok((
        ClientHandshake {
            state,
            transcript_after_init,
            server_verifying: identity.server_verifying,
        },
        msg,
    ))
}

impl ClientHandshake {
    pub fn finalize(mut self, reply: &[u8]) -> Result<HandshakeOutcome> {
        let mut payload = vec![0u8; MAX_HANDSHAKE_MSG];
        let n = self
            .state
            .read_message(reply, &mut payload)
            .map_err(|e| handshake_error("server reply", e))?;
        let payload = &payload[..n];

        if payload.len() < SIGNATURE_LEN + 4 {
            return Err(TunnelError::Handshake("short server payload".into()));
        }
        let (octets, sig_bytes) = payload.split_at(payload.len() - SIGNATURE_LEN);
        let sig_bytes: [u8; SIGNATURE_LEN] = sig_bytes
            .try_into()
            .map_err(|_| TunnelError::Handshake("malformed signature".into()))?;
        self.server_verifying
            .verify(&self.transcript_after_init, &Signature::from_bytes(&sig_bytes))
            .map_err(|e| handshake_error("identity signature", e))?;

        let internal_ip = ip_from_octets(octets)?;
        if !self.state.is_handshake_finished() {
            return Err(TunnelError::Handshake("handshake incomplete".into()));
        }
        Ok(HandshakeOutcome {
            secrets: split_secrets(self.state, false)?,
            internal_ip,
        })
    }
}

/// Server half, sans IO: consumes the initiation, emits the reply.
/// Rejects initiators whose static key is not the admitted client.
pub fn respond(
    identity: &ServerIdentity,
    initiation: &[u8],
) -> Result<(Vec<u8>, HandshakeOutcome)> {
    let mut state = snow::Builder::new(noise_params()?)
        .local_private_key(identity.noise_private.as_ref())
        .build_responder()
        .map_err(|e| handshake_error("responder build", e))?;

    let mut payload = vec![0u8; MAX_HANDSHAKE_MSG];
    let n = state
        .read_message(initiation, &mut payload)
        .map_err(|e| handshake_error("initiation", e))?;
    let requested_ip = ip_from_octets(&payload[..n])?;

    match state.get_remote_static() {
        Some(remote) if remote == identity.client_public => {}
        _ => return Err(TunnelError::Handshake("unknown client static key".into())),
    }

    let signature = identity.signing_key.sign(state.get_handshake_hash());

    let mut reply_payload = ip_octets(requested_ip);
    reply_payload.extend_from_slice(&signature.to_bytes());

    let mut reply = vec![0u8; MAX_HANDSHAKE_MSG];
    let n = state
        .write_message(&reply_payload, &mut reply)
        .map_err(|e| handshake_error("reply", e))?;
    reply.truncate(n);

    if !state.is_handshake_finished() {
        return Err(TunnelError::Handshake("handshake incomplete".into()));
    }
    Ok((
        reply,
        HandshakeOutcome {
            secrets: split_secrets(state, true)?,
            internal_ip: requested_ip,
        },
    ))
}

/// Drive the client handshake over an established link.
pub async fn client_side_handshake(
    reader: &mut LinkReader,
    writer: &mut LinkWriter,
    identity: &ClientIdentity,
    requested_ip: IpAddr,
) -> Result<HandshakeOutcome> {
    let (pending, initiation) = initiate(identity, requested_ip)?;
    writer.send(&initiation).await?;

    let mut buf = [0u8; MAX_HANDSHAKE_MSG];
    let n = reader.recv(&mut buf).await?;
    pending.finalize(&buf[..n])
}

/// Drive the server handshake over an established link; returns the
/// client's internal address alongside the session secrets.
pub async fn server_side_handshake(
    reader: &mut LinkReader,
    writer: &mut LinkWriter,
    identity: &ServerIdentity,
) -> Result<HandshakeOutcome> {
    let mut buf = [0u8; MAX_HANDSHAKE_MSG];
    let n = reader.recv(&mut buf).await?;
    let (reply, outcome) = respond(identity, &buf[..n])?;
    writer.send(&reply).await?;
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::KEY_LEN;
    use ed25519_dalek::SigningKey;
    use x25519_dalek::{PublicKey, StaticSecret};

    /// Deterministic matching identity pair for tests.
    pub(crate) fn identities() -> (ServerIdentity, ClientIdentity) {
        let server_noise = StaticSecret::from([0x40u8; KEY_LEN]);
        let client_noise = StaticSecret::from([0x41u8; KEY_LEN]);
        let signing = SigningKey::from_bytes(&[0x42u8; 32]);

        let server = ServerIdentity {
            noise_private: Zeroizing::new(server_noise.to_bytes()),
            signing_key: signing.clone(),
            client_public: PublicKey::from(&client_noise).to_bytes(),
        };
        let client = ClientIdentity {
            noise_private: Zeroizing::new(client_noise.to_bytes()),
            server_public: PublicKey::from(&server_noise).to_bytes(),
            server_verifying: signing.verifying_key(),
        };
        (server, client)
    }
}

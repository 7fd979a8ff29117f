use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use zeroize::Zeroizing;

use super::slot::KeySlot;
use super::{
    CryptoError, KeySlots, NonceMode, SessionSecrets, EXPLICIT_NONCE_LEN, KEY_LEN, TAG_LEN,
};

/// Per-session AEAD state: the active slot plus the transition slots.
///
/// `previous` survives a promotion until the active slot authenticates
/// its first packet, so in-flight records from the old epoch still
/// decrypt. `pending_recv` is installed by the rekey machinery one epoch
/// ahead of active and becomes active on promotion.
pub struct TunnelCipher {
    id: [u8; 32],
    is_server: bool,
    mode: NonceMode,
    active: KeySlot,
    previous: Option<KeySlot>,
    pending_recv: Option<KeySlot>,
}

impl TunnelCipher {
    pub fn new(secrets: SessionSecrets, mode: NonceMode) -> Self {
        let (send_key, recv_key) = if secrets.is_server {
            (secrets.key_s2c, secrets.key_c2s)
        } else {
            (secrets.key_c2s, secrets.key_s2c)
        };
        Self {
            id: secrets.id,
            is_server: secrets.is_server,
            mode,
            active: KeySlot::new(0, send_key, recv_key, mode),
            previous: None,
            pending_recv: None,
        }
    }

    pub fn session_id(&self) -> &[u8; 32] {
        &self.id
    }

    pub fn send_epoch(&self) -> u16 {
        self.active.epoch
    }

    /// Ciphertext overhead of one record in the session's mode.
    pub fn overhead(&self) -> usize {
        match self.mode {
            NonceMode::Stream => TAG_LEN,
            NonceMode::Datagram { .. } => EXPLICIT_NONCE_LEN + TAG_LEN,
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.mode {
            NonceMode::Stream => self.active.seal_stream(plaintext),
            NonceMode::Datagram { .. } => self.active.seal_datagram(plaintext),
        }
    }

    /// Decrypt one record, trying `active`, then `previous`, then
    /// `pending_recv`. Failed trials leave no side effects; the first
    /// success under the active slot retires `previous`.
    pub fn decrypt(&mut self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.mode {
            NonceMode::Stream => self.decrypt_stream(record),
            NonceMode::Datagram { .. } => self.decrypt_datagram(record),
        }
    }

    fn decrypt_stream(&mut self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < TAG_LEN {
            return Err(CryptoError::DecryptFailed);
        }
        if let Ok(plaintext) = self.active.open_stream(record) {
            self.previous = None;
            return Ok(plaintext);
        }
        if let Some(previous) = self.previous.as_mut() {
            if let Ok(plaintext) = previous.open_stream(record) {
                return Ok(plaintext);
            }
        }
        if let Some(pending) = self.pending_recv.as_mut() {
            if let Ok(plaintext) = pending.open_stream(record) {
                return Ok(plaintext);
            }
        }
        Err(CryptoError::DecryptFailed)
    }

    fn decrypt_datagram(&mut self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < EXPLICIT_NONCE_LEN + TAG_LEN {
            return Err(CryptoError::DecryptFailed);
        }
        let mut explicit = [0u8; EXPLICIT_NONCE_LEN];
        explicit.copy_from_slice(&record[..EXPLICIT_NONCE_LEN]);
        let ciphertext = &record[EXPLICIT_NONCE_LEN..];

        match self.active.open_datagram(explicit, ciphertext) {
            Ok(plaintext) => {
                self.previous = None;
                return Ok(plaintext);
            }
            // replay verdicts are authenticated; do not fall through to
            // older slots where the same counter might still be fresh
            Err(err @ (CryptoError::ReplayDetected | CryptoError::StaleNonce)) => return Err(err),
            Err(_) => {}
        }
        if let Some(previous) = self.previous.as_mut() {
            match previous.open_datagram(explicit, ciphertext) {
                Ok(plaintext) => return Ok(plaintext),
                Err(err @ (CryptoError::ReplayDetected | CryptoError::StaleNonce)) => {
                    return Err(err)
                }
                Err(_) => {}
            }
        }
        if let Some(pending) = self.pending_recv.as_mut() {
            match pending.open_datagram(explicit, ciphertext) {
                Ok(plaintext) => return Ok(plaintext),
                Err(err @ (CryptoError::ReplayDetected | CryptoError::StaleNonce)) => {
                    return Err(err)
                }
                Err(_) => {}
            }
        }
        Err(CryptoError::DecryptFailed)
    }

    /// Install the next epoch's slot for receive. Direction keys are
    /// oriented here: the server sends on S→C, the client on C→S.
    pub fn install_pending(&mut self, new_c2s: &[u8; KEY_LEN], new_s2c: &[u8; KEY_LEN]) -> u16 {
        let epoch = self.active.epoch.saturating_add(1);
        let (send_key, recv_key) = if self.is_server {
            (Zeroizing::new(*new_s2c), Zeroizing::new(*new_c2s))
        } else {
            (Zeroizing::new(*new_c2s), Zeroizing::new(*new_s2c))
        };
        self.pending_recv = Some(KeySlot::new(epoch, send_key, recv_key, self.mode));
        epoch
    }

    /// Promote the pending slot to active. The old active slot is kept
    /// as `previous` until the new one sees traffic.
    pub fn set_send_epoch(&mut self, epoch: u16) -> bool {
        if epoch == self.active.epoch {
            return true;
        }
        match self.pending_recv.take() {
            Some(pending) if pending.epoch == epoch => {
                self.previous = Some(std::mem::replace(&mut self.active, pending));
                true
            }
            other => {
                self.pending_recv = other;
                false
            }
        }
    }

    pub fn remove_epoch(&mut self, epoch: u16) -> bool {
        if self.pending_recv.as_ref().is_some_and(|s| s.epoch == epoch) {
            self.pending_recv = None;
            return true;
        }
        if self.previous.as_ref().is_some_and(|s| s.epoch == epoch) {
            self.previous = None;
            return true;
        }
        false
    }

    pub fn current_c2s_key(&self) -> [u8; KEY_LEN] {
        if self.is_server {
            *self.active.recv_key()
        } else {
            *self.active.send_key()
        }
    }

    pub fn current_s2c_key(&self) -> [u8; KEY_LEN] {
        if self.is_server {
            *self.active.send_key()
        } else {
            *self.active.recv_key()
        }
    }
}

/// Shared handle to a session cipher. Critical sections are short and
/// never held across await points.
#[derive(Clone)]
pub struct SharedCipher(Arc<Mutex<TunnelCipher>>);

impl SharedCipher {
    pub fn new(cipher: TunnelCipher) -> Self {
        Self(Arc::new(Mutex::new(cipher)))
    }

    pub fn lock(&self) -> MutexGuard<'_, TunnelCipher> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeySlots for SharedCipher {
    fn install_pending(&self, new_c2s: &[u8; KEY_LEN], new_s2c: &[u8; KEY_LEN]) -> u16 {
        self.lock().install_pending(new_c2s, new_s2c)
    }

    fn set_send_epoch(&self, epoch: u16) -> bool {
        self.lock().set_send_epoch(epoch)
    }

    fn remove_epoch(&self, epoch: u16) -> bool {
        self.lock().remove_epoch(epoch)
    }

    fn current_c2s_key(&self) -> [u8; KEY_LEN] {
        self.lock().current_c2s_key()
    }

    fn current_s2c_key(&self) -> [u8; KEY_LEN] {
        self.lock().current_s2c_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DEFAULT_NONCE_RING_SIZE;

    fn secrets(is_server: bool) -> SessionSecrets {
        SessionSecrets {
            id: [7u8; 32],
            key_c2s: Zeroizing::new([1u8; KEY_LEN]),
            key_s2c: Zeroizing::new([2u8; KEY_LEN]),
            is_server,
        }
    }

    fn stream_pair() -> (TunnelCipher, TunnelCipher) {
        (
            TunnelCipher::new(secrets(false), NonceMode::Stream),
            TunnelCipher::new(secrets(true), NonceMode::Stream),
        )
    }

    fn datagram_pair() -> (TunnelCipher, TunnelCipher) {
        let mode = NonceMode::Datagram { ring_size: DEFAULT_NONCE_RING_SIZE };
        (
            TunnelCipher::new(secrets(false), mode),
            TunnelCipher::new(secrets(true), mode),
        )
    }

    #[test]
    fn stream_round_trip_both_directions() {
        let (mut client, mut server) = stream_pair();

        let up = client.encrypt(b"up-packet").unwrap();
        assert_eq!(server.decrypt(&up).unwrap(), b"up-packet");

        let down = server.encrypt(b"down-packet").unwrap();
        assert_eq!(client.decrypt(&down).unwrap(), b"down-packet");
    }

    #[test]
    fn stream_records_must_arrive_in_order() {
        let (mut client, mut server) = stream_pair();

        let first = client.encrypt(b"first").unwrap();
        let second = client.encrypt(b"second").unwrap();

        // receiving out of order desynchronizes the implicit counter
        assert_eq!(server.decrypt(&second), Err(CryptoError::DecryptFailed));
        assert_eq!(server.decrypt(&first).unwrap(), b"first");
        assert_eq!(server.decrypt(&second).unwrap(), b"second");
    }

    #[test]
    fn datagram_round_trip_tolerates_reorder() {
        let (mut client, mut server) = datagram_pair();

        let a = client.encrypt(b"aaa").unwrap();
        let b = client.encrypt(b"bbb").unwrap();
        assert_eq!(server.decrypt(&b).unwrap(), b"bbb");
        assert_eq!(server.decrypt(&a).unwrap(), b"aaa");
    }

    #[test]
    fn datagram_replay_is_rejected() {
        let (mut client, mut server) = datagram_pair();

        let record = client.encrypt(b"once").unwrap();
        assert_eq!(server.decrypt(&record).unwrap(), b"once");
        assert_eq!(server.decrypt(&record), Err(CryptoError::ReplayDetected));
    }

    #[test]
    fn tampered_record_fails_without_side_effects() {
        let (mut client, mut server) = stream_pair();

        let mut record = client.encrypt(b"payload").unwrap();
        record[0] ^= 0x01;
        assert_eq!(server.decrypt(&record), Err(CryptoError::DecryptFailed));

        // counters did not advance: the untampered record still decrypts
        record[0] ^= 0x01;
        assert_eq!(server.decrypt(&record).unwrap(), b"payload");
    }

    #[test]
    fn epoch_mismatch_fails_decrypt() {
        let (mut client, mut server) = stream_pair();

        // move only the client to epoch 1
        let epoch = client.install_pending(&[9u8; KEY_LEN], &[8u8; KEY_LEN]);
        assert!(client.set_send_epoch(epoch));

        let record = client.encrypt(b"new-epoch").unwrap();
        assert_eq!(server.decrypt(&record), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn pending_slot_receives_next_epoch() {
        let (mut client, mut server) = stream_pair();

        let new_c2s = [9u8; KEY_LEN];
        let new_s2c = [8u8; KEY_LEN];
        let client_epoch = client.install_pending(&new_c2s, &new_s2c);
        let server_epoch = server.install_pending(&new_c2s, &new_s2c);
        assert_eq!(client_epoch, server_epoch);

        // client switches to sending on the new epoch; the server has
        // only installed it as pending_recv and still decrypts
        assert!(client.set_send_epoch(client_epoch));
        let record = client.encrypt(b"rolled").unwrap();
        assert_eq!(server.decrypt(&record).unwrap(), b"rolled");
    }

    #[test]
    fn previous_slot_survives_promotion_until_first_use() {
        let (mut client, mut server) = stream_pair();

        let new_c2s = [9u8; KEY_LEN];
        let new_s2c = [8u8; KEY_LEN];

        // server encrypts on the old epoch before the client promotes
        let straggler = server.encrypt(b"old-epoch").unwrap();

        let epoch = client.install_pending(&new_c2s, &new_s2c);
        server.install_pending(&new_c2s, &new_s2c);
        assert!(client.set_send_epoch(epoch));
        assert!(server.set_send_epoch(epoch));

        // the straggler still decrypts via the previous slot
        assert_eq!(client.decrypt(&straggler).unwrap(), b"old-epoch");

        // once the new epoch sees traffic, previous is retired
        let fresh = server.encrypt(b"new-epoch").unwrap();
        assert_eq!(client.decrypt(&fresh).unwrap(), b"new-epoch");
        let late = {
            // a second old-epoch record can no longer decrypt
            let (_, mut old_server) = stream_pair();
            old_server.encrypt(b"too-late").unwrap();
            old_server.encrypt(b"too-late").unwrap()
        };
        assert!(client.decrypt(&late).is_err());
    }

    #[test]
    fn remove_epoch_reports_existence() {
        let (mut client, _) = stream_pair();
        let epoch = client.install_pending(&[9u8; KEY_LEN], &[8u8; KEY_LEN]);
        assert!(client.remove_epoch(epoch));
        assert!(!client.remove_epoch(epoch));
    }

    #[test]
    fn direction_keys_are_oriented_by_role() {
        let (client, server) = stream_pair();
        assert_eq!(client.current_c2s_key(), [1u8; KEY_LEN]);
        assert_eq!(client.current_s2c_key(), [2u8; KEY_LEN]);
        assert_eq!(server.current_c2s_key(), [1u8; KEY_LEN]);
        assert_eq!(server.current_s2c_key(), [2u8; KEY_LEN]);
    }

    #[test]
    fn max_plaintext_round_trip() {
        let (mut client, mut server) = stream_pair();
        let packet = vec![0x5Au8; 1500];
        let record = client.encrypt(&packet).unwrap();
        assert_eq!(record.len(), packet.len() + client.overhead());
        assert_eq!(server.decrypt(&record).unwrap(), packet);
    }
}

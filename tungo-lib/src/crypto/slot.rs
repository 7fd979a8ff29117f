use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use zeroize::Zeroizing;

use super::replay::NonceRing;
use super::{CryptoError, NonceMode, DEFAULT_REORDER_WINDOW, EXPLICIT_NONCE_LEN, KEY_LEN, NONCE_LEN};

/// One epoch's worth of key material and per-direction counters.
pub(crate) struct KeySlot {
    pub(crate) epoch: u16,
    send_key: Zeroizing<[u8; KEY_LEN]>,
    recv_key: Zeroizing<[u8; KEY_LEN]>,
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
    pub(crate) send_counter: u64,
    recv: RecvWindow,
}

/// Receive-side ordering state. Stream slots track the next expected
/// counter; datagram slots remember accepted counters in a ring.
enum RecvWindow {
    Stream { next: u64 },
    Datagram(NonceRing),
}

impl KeySlot {
    pub(crate) fn new(
        epoch: u16,
        send_key: Zeroizing<[u8; KEY_LEN]>,
        recv_key: Zeroizing<[u8; KEY_LEN]>,
        mode: NonceMode,
    ) -> Self {
        let send_cipher = ChaCha20Poly1305::new(Key::from_slice(send_key.as_ref()));
        let recv_cipher = ChaCha20Poly1305::new(Key::from_slice(recv_key.as_ref()));
        let recv = match mode {
            NonceMode::Stream => RecvWindow::Stream { next: 0 },
            NonceMode::Datagram { ring_size } => {
                RecvWindow::Datagram(NonceRing::new(ring_size, DEFAULT_REORDER_WINDOW))
            }
        };
        Self { epoch, send_key, recv_key, send_cipher, recv_cipher, send_counter: 0, recv }
    }

    pub(crate) fn send_key(&self) -> &[u8; KEY_LEN] {
        &self.send_key
    }

    pub(crate) fn recv_key(&self) -> &[u8; KEY_LEN] {
        &self.recv_key
    }

    fn epoch_aad(&self) -> [u8; 2] {
        self.epoch.to_be_bytes()
    }

    /// Nonce for a stream record: epoch followed by the 64-bit counter
    /// left-zero-padded to 10 bytes. Never transmitted.
    fn stream_nonce(&self, counter: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..2].copy_from_slice(&self.epoch.to_be_bytes());
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Nonce for a datagram record: epoch, the 8-byte explicit counter
    /// as carried on the wire, then two bytes of padding.
    fn datagram_nonce(&self, explicit: [u8; EXPLICIT_NONCE_LEN]) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..2].copy_from_slice(&self.epoch.to_be_bytes());
        nonce[2..10].copy_from_slice(&explicit);
        nonce
    }

    fn next_counter(&mut self) -> Result<u64, CryptoError> {
        if self.send_counter == u64::MAX {
            return Err(CryptoError::CounterExhausted);
        }
        let counter = self.send_counter;
        self.send_counter += 1;
        Ok(counter)
    }

    pub(crate) fn seal_stream(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.next_counter()?;
        let nonce = self.stream_nonce(counter);
        self.send_cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: plaintext, aad: &self.epoch_aad() },
            )
            .map_err(|_| CryptoError::CounterExhausted)
    }

    pub(crate) fn seal_datagram(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.next_counter()?;
        let explicit = counter.to_be_bytes();
        let nonce = self.datagram_nonce(explicit);
        let ciphertext = self
            .send_cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: plaintext, aad: &self.epoch_aad() },
            )
            .map_err(|_| CryptoError::CounterExhausted)?;

        let mut record = Vec::with_capacity(EXPLICIT_NONCE_LEN + ciphertext.len());
        record.extend_from_slice(&explicit);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Authenticate one stream record against this slot's expected
    /// counter. The counter only advances on success, so a failed trial
    /// against the wrong slot leaves no trace.
    pub(crate) fn open_stream(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let RecvWindow::Stream { next } = &self.recv else {
            return Err(CryptoError::DecryptFailed);
        };
        let next = *next;
        let nonce = self.stream_nonce(next);
        let plaintext = self
            .recv_cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: ciphertext, aad: &self.epoch_aad() },
            )
            .map_err(|_| CryptoError::DecryptFailed)?;
        self.recv = RecvWindow::Stream { next: next + 1 };
        Ok(plaintext)
    }

    /// Authenticate one datagram record, then run the replay check.
    /// Replay bookkeeping happens only after authentication so a forged
    /// counter cannot poison the ring.
    pub(crate) fn open_datagram(
        &mut self,
        explicit: [u8; EXPLICIT_NONCE_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.datagram_nonce(explicit);
        let plaintext = self
            .recv_cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: ciphertext, aad: &self.epoch_aad() },
            )
            .map_err(|_| CryptoError::DecryptFailed)?;

        let RecvWindow::Datagram(ring) = &mut self.recv else {
            return Err(CryptoError::DecryptFailed);
        };
        ring.accept(u64::from_be_bytes(explicit))?;
        Ok(plaintext)
    }
}

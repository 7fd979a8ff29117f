use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::KEY_LEN;

pub const REKEY_LABEL_C2S: &[u8] = b"tungo-rekey-c2s";
pub const REKEY_LABEL_S2C: &[u8] = b"tungo-rekey-s2c";

/// Freshly derived direction keys for the next epoch.
pub struct DirectionKeys {
    pub c2s: Zeroizing<[u8; KEY_LEN]>,
    pub s2c: Zeroizing<[u8; KEY_LEN]>,
}

/// Derive the next epoch's direction keys from an X25519 shared secret.
///
/// Each direction expands under its own label, salted by the key it
/// replaces, so compromise of one direction's chain does not reach the
/// other and both peers must agree on the current keys to converge.
pub fn derive_rekey_pair(
    shared: &[u8; KEY_LEN],
    current_c2s: &[u8; KEY_LEN],
    current_s2c: &[u8; KEY_LEN],
) -> DirectionKeys {
    let mut c2s = Zeroizing::new([0u8; KEY_LEN]);
    let mut s2c = Zeroizing::new([0u8; KEY_LEN]);

    // expand cannot fail for a 32-byte output
    let hk = Hkdf::<Sha256>::new(Some(current_c2s), shared);
    hk.expand(REKEY_LABEL_C2S, c2s.as_mut())
        .expect("32-byte HKDF expansion");
    let hk = Hkdf::<Sha256>::new(Some(current_s2c), shared);
    hk.expand(REKEY_LABEL_S2C, s2c.as_mut())
        .expect("32-byte HKDF expansion");

    DirectionKeys { c2s, s2c }
}

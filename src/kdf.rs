//! Password key derivation for Agile encryption (MS-OFFCRYPTO 2.3.4.11 - 2.3.4.13).
//!
//! The expensive part is the spin-count hash chain. It runs once per call and its output is
//! reused for every purpose-block derivation that follows.

use crate::algorithm::HashAlgorithm;
use crate::CryptoError;

use tracing::debug;
use zeroize::Zeroizing;

/// Byte used to extend a hash that is shorter than the key or IV it has to fill.
const FIT_PADDING_BYTE: u8 = 0x36;

/// Fixed block keys that separate the keys derived from one password hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Purpose {
    VerifierHashInput,
    VerifierHashValue,
    KeyValue,
    IntegrityKey,
    IntegrityValue,
}

impl Purpose {
    pub fn block(self) -> &'static [u8; 8] {
        match self {
            Purpose::VerifierHashInput => &[0xFE, 0xA7, 0xD2, 0x76, 0x3B, 0x4B, 0x9E, 0x79],
            Purpose::VerifierHashValue => &[0xD7, 0xAA, 0x0F, 0x6D, 0x30, 0x61, 0x34, 0x4E],
            Purpose::KeyValue => &[0x14, 0x6E, 0x0B, 0xE7, 0xAB, 0xAC, 0xD0, 0xD6],
            Purpose::IntegrityKey => &[0x5F, 0xB2, 0xAD, 0x01, 0x0C, 0xB9, 0xE1, 0xF6],
            Purpose::IntegrityValue => &[0xA0, 0x67, 0x7F, 0x02, 0xB2, 0x2C, 0x84, 0x33],
        }
    }
}

/// Output of the spin-count hash chain for one password and salt.
pub(crate) struct PasswordHash {
    hash: HashAlgorithm,
    value: Zeroizing<Vec<u8>>,
}

impl PasswordHash {
    /// `H0 = Hash(salt || UTF16LE(password))`, then `Hn = Hash(LE32(n - 1) || Hn-1)` for
    /// `spin_count` rounds. `cancel` is polled before every round.
    pub fn compute(
        password: &str,
        salt: &[u8],
        hash: HashAlgorithm,
        spin_count: u32,
        cancel: &dyn Fn() -> bool,
    ) -> Result<Self, CryptoError> {
        let password = password_to_utf16le(password);
        let digest_len = hash.digest_len();

        let mut value = Zeroizing::new(vec![0u8; digest_len]);
        hash.digest_into(&[salt, &password], &mut value);

        // LE32(i) || H, rewritten in place every round
        let mut round = Zeroizing::new(vec![0u8; 4 + digest_len]);
        for i in 0..spin_count {
            if cancel() {
                debug!(iteration = i, spin_count, "password hash cancelled");
                return Err(CryptoError::CancellationRequested);
            }
            round[..4].copy_from_slice(&i.to_le_bytes());
            round[4..].copy_from_slice(&value);
            hash.digest_into(&[&round], &mut value);
        }

        Ok(PasswordHash { hash, value })
    }

    /// `fit(Hash(Hspin || purpose block), key_bytes)`
    pub fn derive_key(&self, purpose: Purpose, key_bytes: usize) -> Zeroizing<Vec<u8>> {
        let final_hash = self.hash.digest(&[&self.value, purpose.block()]);
        fit_to_length(&final_hash, key_bytes)
    }

    #[cfg(test)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }
}

/// Truncate `bytes` to `len`, or extend it with the 0x36 padding byte up to `len`.
pub(crate) fn fit_to_length(bytes: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![FIT_PADDING_BYTE; len]);
    let keep = bytes.len().min(len);
    out[..keep].copy_from_slice(&bytes[..keep]);
    out
}

/// IV for a block key (a purpose block, or the LE32 index of a package segment):
/// `fit(Hash(key data salt || block key), block size)`.
pub(crate) fn derive_iv(
    hash: HashAlgorithm,
    salt: &[u8],
    block_key: &[u8],
    block_bytes: usize,
) -> Zeroizing<Vec<u8>> {
    fit_to_length(&hash.digest(&[salt, block_key]), block_bytes)
}

pub(crate) fn password_to_utf16le(password: &str) -> Zeroizing<Vec<u8>> {
    let units: Zeroizing<Vec<u16>> =
        Zeroizing::new(password.encode_utf16().map(u16::to_le).collect());
    Zeroizing::new(bytemuck::cast_slice::<u16, u8>(&units).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn no_cancel() -> bool {
        false
    }

    #[test]
    fn password_is_utf16le_without_terminator() {
        assert_eq!(*password_to_utf16le("Ab"), vec![0x41, 0x00, 0x62, 0x00]);
        assert_eq!(*password_to_utf16le("ä"), vec![0xE4, 0x00]);
        // outside the BMP: surrogate pair
        assert_eq!(*password_to_utf16le("😀"), vec![0x3D, 0xD8, 0x00, 0xDE]);
        assert!(password_to_utf16le("").is_empty());
    }

    #[test]
    fn fit_truncates_long_hashes() {
        let fitted = fit_to_length(&[1, 2, 3, 4, 5], 3);
        assert_eq!(*fitted, vec![1, 2, 3]);
    }

    #[test]
    fn fit_pads_short_hashes_with_0x36() {
        let fitted = fit_to_length(&[0xAA; 20], 32);
        assert_eq!(&fitted[..20], &[0xAA; 20]);
        assert_eq!(&fitted[20..], &[0x36; 12]);
    }

    // Reference values computed independently from the MS-OFFCRYPTO algorithm description.
    #[test]
    fn sha512_chain_matches_reference() {
        let salt: Vec<u8> = (0u8..16).collect();
        let h = PasswordHash::compute("testPassword", &salt, HashAlgorithm::Sha512, 1000, &no_cancel)
            .unwrap();
        assert_eq!(
            hex(h.as_bytes()),
            "8e4af20c5e446d64348f830171549f5c8962301256259e28d74388416124b1aa\
             24dcce60ea0230d37f0804c741933c3997fdef8bd95db1637d2ac291f8c34eb7"
        );

        let key = h.derive_key(Purpose::KeyValue, 32);
        assert_eq!(
            hex(&key),
            "b097624e4413c93d35f67e2e80a6b5792d89df1005cfceb18482014a39c741b8"
        );
    }

    #[test]
    fn sha1_key_longer_than_hash_is_padded() {
        let h = PasswordHash::compute("Test123", &[0u8; 16], HashAlgorithm::Sha1, 100_000, &no_cancel)
            .unwrap();
        assert_eq!(hex(h.as_bytes()), "a43f176b0ac7282157d43aefb33b3d34bed50ced");

        let key256 = h.derive_key(Purpose::VerifierHashInput, 32);
        assert_eq!(
            hex(&key256),
            "2a8c49f0ce46a802b13438b5efd39fc1e853e8c2363636363636363636363636"
        );
        let key128 = h.derive_key(Purpose::VerifierHashInput, 16);
        assert_eq!(hex(&key128), "2a8c49f0ce46a802b13438b5efd39fc1");
    }

    #[test]
    fn derivation_is_deterministic_and_purpose_separated() {
        let salt = [9u8; 16];
        let a = PasswordHash::compute("pw", &salt, HashAlgorithm::Sha256, 50, &no_cancel).unwrap();
        let b = PasswordHash::compute("pw", &salt, HashAlgorithm::Sha256, 50, &no_cancel).unwrap();

        assert_eq!(
            *a.derive_key(Purpose::KeyValue, 32),
            *b.derive_key(Purpose::KeyValue, 32)
        );
        assert_ne!(
            *a.derive_key(Purpose::KeyValue, 32),
            *a.derive_key(Purpose::VerifierHashInput, 32)
        );

        let other_salt =
            PasswordHash::compute("pw", &[8u8; 16], HashAlgorithm::Sha256, 50, &no_cancel).unwrap();
        assert_ne!(a.as_bytes(), other_salt.as_bytes());
    }

    #[test]
    fn segment_ivs_match_reference() {
        let iv = derive_iv(HashAlgorithm::Sha1, &[0u8; 16], &0u32.to_le_bytes(), 16);
        assert_eq!(hex(&iv), "6768033e216468247bd031a0a2d9876d");

        let salt: Vec<u8> = (0u8..16).collect();
        let iv = derive_iv(HashAlgorithm::Sha512, &salt, &3u32.to_le_bytes(), 16);
        assert_eq!(hex(&iv), "cd9b3e667fda620779cae9ed9a62e573");
    }

    #[test]
    fn cancellation_stops_the_chain_early() {
        let polls = Cell::new(0u32);
        let cancel = || {
            polls.set(polls.get() + 1);
            polls.get() > 10
        };

        let result = PasswordHash::compute("pw", &[0u8; 16], HashAlgorithm::Sha512, 100_000, &cancel);
        assert!(matches!(result, Err(CryptoError::CancellationRequested)));
        assert_eq!(polls.get(), 11);
    }
}

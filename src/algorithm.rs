use crate::{validate, CryptoError};

use aes::cipher::{
    block_padding::NoPadding, BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
};
use aes::{Aes128, Aes192, Aes256};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use zeroize::Zeroizing;

pub(crate) const AES_BLOCK_BYTES: usize = 16;

/// Symmetric cipher named by a descriptor's `cipherAlgorithm`/`keyBits` pair. Only AES in CBC
/// chaining mode is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    Aes128,
    Aes192,
    Aes256,
}

impl CipherAlgorithm {
    pub fn from_descriptor(name: &str, key_bits: u32) -> Result<Self, CryptoError> {
        validate!(
            name == "AES",
            CryptoError::UnsupportedCipher {
                field: "cipherAlgorithm",
                value: name.to_owned(),
            }
        )?;

        match key_bits {
            128 => Ok(CipherAlgorithm::Aes128),
            192 => Ok(CipherAlgorithm::Aes192),
            256 => Ok(CipherAlgorithm::Aes256),
            other => Err(CryptoError::UnsupportedCipher {
                field: "keyBits",
                value: other.to_string(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        "AES"
    }

    pub fn key_bits(self) -> u32 {
        match self {
            CipherAlgorithm::Aes128 => 128,
            CipherAlgorithm::Aes192 => 192,
            CipherAlgorithm::Aes256 => 256,
        }
    }

    pub fn key_bytes(self) -> usize {
        self.key_bits() as usize / 8
    }

    pub fn block_bytes(self) -> usize {
        AES_BLOCK_BYTES
    }

    /// Encrypt `buf` in place. `buf` must be a whole number of blocks.
    pub(crate) fn encrypt_cbc(self, key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
        match self {
            CipherAlgorithm::Aes128 => cbc_encrypt::<Aes128>(key, iv, buf),
            CipherAlgorithm::Aes192 => cbc_encrypt::<Aes192>(key, iv, buf),
            CipherAlgorithm::Aes256 => cbc_encrypt::<Aes256>(key, iv, buf),
        }
    }

    /// Decrypt `buf` in place. `buf` must be a whole number of blocks.
    pub(crate) fn decrypt_cbc(self, key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
        match self {
            CipherAlgorithm::Aes128 => cbc_decrypt::<Aes128>(key, iv, buf),
            CipherAlgorithm::Aes192 => cbc_decrypt::<Aes192>(key, iv, buf),
            CipherAlgorithm::Aes256 => cbc_decrypt::<Aes256>(key, iv, buf),
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}-CBC", self.name(), self.key_bits())
    }
}

/// Hash named by a descriptor's `hashAlgorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_descriptor(name: &str) -> Result<Self, CryptoError> {
        match name {
            "SHA1" | "SHA-1" => Ok(HashAlgorithm::Sha1),
            "SHA256" | "SHA-256" => Ok(HashAlgorithm::Sha256),
            "SHA384" | "SHA-384" => Ok(HashAlgorithm::Sha384),
            "SHA512" | "SHA-512" => Ok(HashAlgorithm::Sha512),
            other => Err(CryptoError::UnsupportedCipher {
                field: "hashAlgorithm",
                value: other.to_owned(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hash the concatenation of `parts` into `out`, which must be `digest_len()` bytes.
    pub(crate) fn digest_into(self, parts: &[&[u8]], out: &mut [u8]) {
        match self {
            HashAlgorithm::Sha1 => digest_parts_into::<Sha1>(parts, out),
            HashAlgorithm::Sha256 => digest_parts_into::<Sha256>(parts, out),
            HashAlgorithm::Sha384 => digest_parts_into::<Sha384>(parts, out),
            HashAlgorithm::Sha512 => digest_parts_into::<Sha512>(parts, out),
        }
    }

    pub(crate) fn digest(self, parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(vec![0u8; self.digest_len()]);
        self.digest_into(parts, &mut out);
        out
    }

    pub(crate) fn hmac(self, key: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        match self {
            HashAlgorithm::Sha1 => mac_bytes::<Hmac<Sha1>>(key, data),
            HashAlgorithm::Sha256 => mac_bytes::<Hmac<Sha256>>(key, data),
            HashAlgorithm::Sha384 => mac_bytes::<Hmac<Sha384>>(key, data),
            HashAlgorithm::Sha512 => mac_bytes::<Hmac<Sha512>>(key, data),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn digest_parts_into<D: Digest>(parts: &[&[u8]], out: &mut [u8]) {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    out.copy_from_slice(&hasher.finalize());
}

fn mac_bytes<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidInput("HMAC key length"))?;
    mac.update(data);

    Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let len = buf.len();
    cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidInput("cipher key or IV length"))?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| CryptoError::InvalidInput("plaintext is not block aligned"))?;

    Ok(())
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let len = buf.len();
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidInput("cipher key or IV length"))?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| crate::corrupt(len, "ciphertext is not block aligned"))?;

    Ok(())
}

/// Copy `bytes` into a buffer zero-padded up to the next block boundary.
pub(crate) fn pad_to_block(bytes: &[u8], block_bytes: usize) -> Zeroizing<Vec<u8>> {
    let padded_len = bytes.len().div_ceil(block_bytes) * block_bytes;
    let mut out = Zeroizing::new(vec![0u8; padded_len]);
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    OsRng.fill_bytes(&mut out);
    out
}

pub(crate) fn random_secret(len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_lookup_rejects_unknown_identifiers() {
        assert_eq!(
            CipherAlgorithm::from_descriptor("AES", 192).unwrap(),
            CipherAlgorithm::Aes192
        );
        assert!(matches!(
            CipherAlgorithm::from_descriptor("RC2", 128),
            Err(CryptoError::UnsupportedCipher { field: "cipherAlgorithm", .. })
        ));
        assert!(matches!(
            CipherAlgorithm::from_descriptor("AES", 512),
            Err(CryptoError::UnsupportedCipher { field: "keyBits", .. })
        ));
    }

    #[test]
    fn hash_lookup_rejects_md5() {
        assert_eq!(
            HashAlgorithm::from_descriptor("SHA384").unwrap(),
            HashAlgorithm::Sha384
        );
        match HashAlgorithm::from_descriptor("MD5") {
            Err(CryptoError::UnsupportedCipher { field, value }) => {
                assert_eq!(field, "hashAlgorithm");
                assert_eq!(value, "MD5");
            }
            other => panic!("expected UnsupportedCipher, got {other:?}"),
        }
    }

    #[test]
    fn digest_of_parts_matches_digest_of_concatenation() {
        for hash in [
            HashAlgorithm::Sha1,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            let joined = hash.digest(&[b"testmultiple" as &[u8]]);
            let split = hash.digest(&[b"test" as &[u8], b"multiple"]);
            assert_eq!(*joined, *split);
            assert_eq!(joined.len(), hash.digest_len());
        }
    }

    #[test]
    fn cbc_round_trip_for_every_key_size() {
        let iv = [7u8; 16];
        for cipher in [
            CipherAlgorithm::Aes128,
            CipherAlgorithm::Aes192,
            CipherAlgorithm::Aes256,
        ] {
            let key = vec![0x42u8; cipher.key_bytes()];
            let mut buf = *b"datadatadatadatadatadatadatadata";
            cipher.encrypt_cbc(&key, &iv, &mut buf).unwrap();
            assert_ne!(&buf, b"datadatadatadatadatadatadatadata");
            cipher.decrypt_cbc(&key, &iv, &mut buf).unwrap();
            assert_eq!(&buf, b"datadatadatadatadatadatadatadata");
        }
    }

    #[test]
    fn aes256_cbc_matches_known_ciphertext() {
        let mut buf = *b"datadatadatadatadatadatadatadata";
        CipherAlgorithm::Aes256
            .encrypt_cbc(
                b"keykeykeykeykeykeykeykeykeykeyke",
                b"iviviviviviviviv",
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            buf,
            [
                0x28, 0xDD, 0x94, 0xE0, 0xA2, 0x4E, 0x70, 0x90, 0x2D, 0xED, 0x70, 0x60, 0x2F, 0xCE,
                0xE7, 0xBD, 0x45, 0x1B, 0x3E, 0xD5, 0x63, 0x58, 0xAA, 0xDC, 0xD0, 0xF6, 0x6A, 0x59,
                0xF2, 0x28, 0xA5, 0x73,
            ]
        );
    }

    #[test]
    fn misaligned_ciphertext_is_rejected() {
        let mut buf = [0u8; 17];
        assert!(CipherAlgorithm::Aes128
            .decrypt_cbc(&[0u8; 16], &[0u8; 16], &mut buf)
            .is_err());
    }

    #[test]
    fn pad_to_block_zero_fills() {
        let padded = pad_to_block(&[1u8; 20], 16);
        assert_eq!(padded.len(), 32);
        assert!(padded[20..].iter().all(|b| *b == 0));
        assert_eq!(pad_to_block(&[1u8; 32], 16).len(), 32);
        assert!(pad_to_block(&[], 16).is_empty());
    }
}

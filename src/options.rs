use crate::algorithm::{CipherAlgorithm, HashAlgorithm};
use crate::{validate, CryptoError};

const MAX_SPIN_COUNT: u32 = 10_000_000;

/// Parameters for producing a new encrypted container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptOptions {
    /// Hash-chain iterations, 1 to 10,000,000.
    pub spin_count: u32,
    pub cipher: CipherAlgorithm,
    pub hash: HashAlgorithm,
    /// Write a `dataIntegrity` HMAC over the encrypted package.
    pub data_integrity: bool,
    /// Use this salt for both the key data and the password key encryptor instead of fresh
    /// random salts. Makes derived keys reproducible.
    pub salt: Option<[u8; 16]>,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        EncryptOptions {
            spin_count: 100_000,
            cipher: CipherAlgorithm::Aes256,
            hash: HashAlgorithm::Sha512,
            data_integrity: true,
            salt: None,
        }
    }
}

impl EncryptOptions {
    pub fn validate(&self) -> Result<(), CryptoError> {
        validate!(
            (1..=MAX_SPIN_COUNT).contains(&self.spin_count),
            CryptoError::InvalidInput("spin count must be between 1 and 10000000")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_office_defaults() {
        let options = EncryptOptions::default();
        assert_eq!(options.spin_count, 100_000);
        assert_eq!(options.cipher, CipherAlgorithm::Aes256);
        assert_eq!(options.hash, HashAlgorithm::Sha512);
        assert!(options.data_integrity);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn spin_count_bounds() {
        let mut options = EncryptOptions {
            spin_count: 0,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(CryptoError::InvalidInput(_))));

        options.spin_count = 1;
        assert!(options.validate().is_ok());

        options.spin_count = MAX_SPIN_COUNT + 1;
        assert!(options.validate().is_err());
    }
}

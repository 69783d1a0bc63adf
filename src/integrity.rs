//! `dataIntegrity`: an HMAC over the whole `EncryptedPackage` stream, size prefix included,
//! with its key and value stored encrypted under the package key.

use crate::algorithm::{pad_to_block, random_secret};
use crate::descriptor::{DataIntegrity, KeyData};
use crate::kdf::{derive_iv, Purpose};
use crate::CryptoError;

use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::Zeroizing;

fn purpose_iv(key_data: &KeyData, purpose: Purpose) -> Zeroizing<Vec<u8>> {
    derive_iv(
        key_data.hash,
        &key_data.salt,
        purpose.block(),
        key_data.cipher.block_bytes(),
    )
}

fn decrypt_field(
    key_data: &KeyData,
    package_key: &[u8],
    purpose: Purpose,
    encrypted: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let iv = purpose_iv(key_data, purpose);
    let mut field = Zeroizing::new(encrypted.to_vec());
    key_data.cipher.decrypt_cbc(package_key, &iv, &mut field)?;
    field.truncate(key_data.hash.digest_len());

    Ok(field)
}

fn encrypt_field(
    key_data: &KeyData,
    package_key: &[u8],
    purpose: Purpose,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let iv = purpose_iv(key_data, purpose);
    let mut field = pad_to_block(plaintext, key_data.cipher.block_bytes());
    key_data.cipher.encrypt_cbc(package_key, &iv, &mut field)?;

    Ok(field.to_vec())
}

/// Fails with [`CryptoError::IntegrityViolation`] unless the stored HMAC matches
/// `encrypted_package`.
pub(crate) fn verify(
    key_data: &KeyData,
    integrity: &DataIntegrity,
    package_key: &[u8],
    encrypted_package: &[u8],
) -> Result<(), CryptoError> {
    let hmac_key = decrypt_field(
        key_data,
        package_key,
        Purpose::IntegrityKey,
        &integrity.encrypted_hmac_key,
    )?;
    let expected = decrypt_field(
        key_data,
        package_key,
        Purpose::IntegrityValue,
        &integrity.encrypted_hmac_value,
    )?;

    let actual = key_data.hash.hmac(&hmac_key, encrypted_package)?;
    if bool::from(actual.ct_eq(&expected)) {
        Ok(())
    } else {
        warn!(
            package_len = encrypted_package.len(),
            "EncryptedPackage HMAC mismatch"
        );
        Err(CryptoError::IntegrityViolation)
    }
}

pub(crate) fn produce(
    key_data: &KeyData,
    package_key: &[u8],
    encrypted_package: &[u8],
) -> Result<DataIntegrity, CryptoError> {
    let hmac_key = random_secret(key_data.hash.digest_len());
    let hmac_value = key_data.hash.hmac(&hmac_key, encrypted_package)?;

    Ok(DataIntegrity {
        encrypted_hmac_key: encrypt_field(key_data, package_key, Purpose::IntegrityKey, &hmac_key)?,
        encrypted_hmac_value: encrypt_field(
            key_data,
            package_key,
            Purpose::IntegrityValue,
            &hmac_value,
        )?,
    })
}

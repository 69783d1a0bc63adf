use crate::algorithm::{pad_to_block, random_secret, CipherAlgorithm, HashAlgorithm};
use crate::descriptor::{EncryptionDescriptor, PasswordKeyEncryptor};
use crate::kdf::{PasswordHash, Purpose};
use crate::CryptoError;

use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

/// Check `password` and recover the package key, truncated to `keyData`'s key length.
pub(crate) fn unlock(
    descriptor: &EncryptionDescriptor,
    password: &str,
    cancel: &dyn Fn() -> bool,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let encryptor = &descriptor.password_key;
    let password_hash = PasswordHash::compute(
        password,
        &encryptor.salt,
        encryptor.hash,
        encryptor.spin_count,
        cancel,
    )?;

    if !verifier_matches(encryptor, &password_hash)? {
        debug!("password verifier mismatch");
        return Err(CryptoError::InvalidPassword);
    }

    let mut key_value = Zeroizing::new(encryptor.encrypted_key_value.clone());
    decrypt_with_purpose(encryptor, &password_hash, Purpose::KeyValue, &mut key_value)?;
    key_value.truncate(descriptor.key_data.cipher.key_bytes());

    Ok(key_value)
}

pub(crate) fn verify(
    descriptor: &EncryptionDescriptor,
    password: &str,
    cancel: &dyn Fn() -> bool,
) -> Result<bool, CryptoError> {
    let encryptor = &descriptor.password_key;
    let password_hash = PasswordHash::compute(
        password,
        &encryptor.salt,
        encryptor.hash,
        encryptor.spin_count,
        cancel,
    )?;

    verifier_matches(encryptor, &password_hash)
}

fn verifier_matches(
    encryptor: &PasswordKeyEncryptor,
    password_hash: &PasswordHash,
) -> Result<bool, CryptoError> {
    let mut hash_input = Zeroizing::new(encryptor.encrypted_verifier_hash_input.clone());
    decrypt_with_purpose(encryptor, password_hash, Purpose::VerifierHashInput, &mut hash_input)?;

    let mut hash_value = Zeroizing::new(encryptor.encrypted_verifier_hash_value.clone());
    decrypt_with_purpose(encryptor, password_hash, Purpose::VerifierHashValue, &mut hash_value)?;

    // the verifier is saltSize bytes; both blobs carry block padding
    let verifier = &hash_input[..encryptor.salt.len()];
    let computed = encryptor.hash.digest(&[verifier]);
    let expected = &hash_value[..computed.len()];

    Ok(computed.ct_eq(expected).into())
}

fn decrypt_with_purpose(
    encryptor: &PasswordKeyEncryptor,
    password_hash: &PasswordHash,
    purpose: Purpose,
    buf: &mut [u8],
) -> Result<(), CryptoError> {
    let key = password_hash.derive_key(purpose, encryptor.cipher.key_bytes());
    encryptor.cipher.decrypt_cbc(&key, &encryptor.salt, buf)
}

fn encrypt_with_purpose(
    cipher: CipherAlgorithm,
    salt: &[u8],
    password_hash: &PasswordHash,
    purpose: Purpose,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = password_hash.derive_key(purpose, cipher.key_bytes());
    let mut buf = pad_to_block(plaintext, cipher.block_bytes());
    cipher.encrypt_cbc(&key, salt, &mut buf)?;

    Ok(buf.to_vec())
}

/// Build the password key encryptor for a fresh package key: a random verifier, its hash and
/// the package key, each encrypted under its own purpose key with the salt as IV.
pub(crate) fn produce(
    cipher: CipherAlgorithm,
    hash: HashAlgorithm,
    salt: Vec<u8>,
    spin_count: u32,
    password_hash: &PasswordHash,
    package_key: &[u8],
) -> Result<PasswordKeyEncryptor, CryptoError> {
    let verifier = random_secret(salt.len());
    let verifier_hash = hash.digest(&[&verifier]);

    let encrypted_verifier_hash_input = encrypt_with_purpose(
        cipher,
        &salt,
        password_hash,
        Purpose::VerifierHashInput,
        &verifier,
    )?;
    let encrypted_verifier_hash_value = encrypt_with_purpose(
        cipher,
        &salt,
        password_hash,
        Purpose::VerifierHashValue,
        &verifier_hash,
    )?;
    let encrypted_key_value =
        encrypt_with_purpose(cipher, &salt, password_hash, Purpose::KeyValue, package_key)?;

    Ok(PasswordKeyEncryptor {
        cipher,
        hash,
        salt,
        spin_count,
        encrypted_verifier_hash_input,
        encrypted_verifier_hash_value,
        encrypted_key_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{KeyData, AGILE_FLAGS, AGILE_VERSION_MAJOR, AGILE_VERSION_MINOR};

    const SPIN: u32 = 10;

    fn descriptor_for(
        password: &str,
        cipher: CipherAlgorithm,
        hash: HashAlgorithm,
        package_key: &[u8],
    ) -> EncryptionDescriptor {
        let salt = vec![0x5Au8; 16];
        let password_hash = PasswordHash::compute(password, &salt, hash, SPIN, &|| false).unwrap();
        let password_key =
            produce(cipher, hash, salt.clone(), SPIN, &password_hash, package_key).unwrap();

        EncryptionDescriptor {
            version_major: AGILE_VERSION_MAJOR,
            version_minor: AGILE_VERSION_MINOR,
            flags: AGILE_FLAGS,
            key_data: KeyData { cipher, hash, salt },
            password_key,
            data_integrity: None,
        }
    }

    #[test]
    fn correct_password_recovers_package_key() {
        let package_key = [0x11u8; 32];
        let descriptor =
            descriptor_for("s3cret", CipherAlgorithm::Aes256, HashAlgorithm::Sha512, &package_key);

        let key = unlock(&descriptor, "s3cret", &|| false).unwrap();
        assert_eq!(*key, package_key.to_vec());
        assert!(verify(&descriptor, "s3cret", &|| false).unwrap());
    }

    #[test]
    fn wrong_password_is_rejected_without_key() {
        let descriptor =
            descriptor_for("s3cret", CipherAlgorithm::Aes128, HashAlgorithm::Sha1, &[0x22u8; 16]);

        assert!(matches!(
            unlock(&descriptor, "S3cret", &|| false),
            Err(CryptoError::InvalidPassword)
        ));
        assert!(!verify(&descriptor, "", &|| false).unwrap());
    }

    #[test]
    fn aes192_key_is_padded_then_truncated() {
        let package_key: Vec<u8> = (0u8..24).collect();
        let descriptor =
            descriptor_for("pw", CipherAlgorithm::Aes192, HashAlgorithm::Sha256, &package_key);

        // 24 key bytes occupy two cipher blocks
        assert_eq!(descriptor.password_key.encrypted_key_value.len(), 32);
        assert_eq!(*unlock(&descriptor, "pw", &|| false).unwrap(), package_key);
    }

    #[test]
    fn sha1_verifier_hash_is_block_padded() {
        let descriptor =
            descriptor_for("pw", CipherAlgorithm::Aes128, HashAlgorithm::Sha1, &[0x33u8; 16]);
        assert_eq!(descriptor.password_key.encrypted_verifier_hash_input.len(), 16);
        assert_eq!(descriptor.password_key.encrypted_verifier_hash_value.len(), 32);
    }

    #[test]
    fn damaged_verifier_reads_as_wrong_password() {
        let mut descriptor =
            descriptor_for("pw", CipherAlgorithm::Aes256, HashAlgorithm::Sha256, &[0x44u8; 32]);
        descriptor.password_key.encrypted_verifier_hash_value[0] ^= 1;

        assert!(matches!(
            unlock(&descriptor, "pw", &|| false),
            Err(CryptoError::InvalidPassword)
        ));
    }

    #[test]
    fn fresh_verifiers_differ() {
        let a = descriptor_for("pw", CipherAlgorithm::Aes128, HashAlgorithm::Sha1, &[0u8; 16]);
        let b = descriptor_for("pw", CipherAlgorithm::Aes128, HashAlgorithm::Sha1, &[0u8; 16]);
        assert_ne!(
            a.password_key.encrypted_verifier_hash_input,
            b.password_key.encrypted_verifier_hash_input
        );
        // same password, salt and key: the key blob is deterministic
        assert_eq!(
            a.password_key.encrypted_key_value,
            b.password_key.encrypted_key_value
        );
    }
}

use crate::algorithm::{random_bytes, random_secret};
use crate::dataspaces;
use crate::descriptor::{
    EncryptionDescriptor, KeyData, AGILE_FLAGS, AGILE_VERSION_MAJOR, AGILE_VERSION_MINOR,
};
use crate::integrity;
use crate::kdf::PasswordHash;
use crate::ole::{OleFile, OleWriter};
use crate::options::EncryptOptions;
use crate::segment;
use crate::verifier;
use crate::{corrupt, CryptoError};

use tracing::debug;

pub(crate) const ENCRYPTION_INFO: &str = "EncryptionInfo";
pub(crate) const ENCRYPTED_PACKAGE: &str = "EncryptedPackage";

/// The two streams an encrypted OOXML container carries, outside of any compound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedStreams {
    pub encryption_info: Vec<u8>,
    pub encrypted_package: Vec<u8>,
}

impl EncryptedStreams {
    /// Pull `EncryptionInfo` and `EncryptedPackage` out of a compound file.
    pub fn from_container(raw: Vec<u8>) -> Result<Self, CryptoError> {
        let mut olefile = OleFile::new(raw)?;
        olefile.init()?;

        if !olefile.has_stream(&[ENCRYPTION_INFO]) {
            return Err(corrupt(0, "EncryptionInfo stream is missing"));
        }
        if !olefile.has_stream(&[ENCRYPTED_PACKAGE]) {
            return Err(corrupt(0, "EncryptedPackage stream is missing"));
        }

        Ok(EncryptedStreams {
            encryption_info: olefile.open_stream(&[ENCRYPTION_INFO])?,
            encrypted_package: olefile.open_stream(&[ENCRYPTED_PACKAGE])?,
        })
    }

    /// Wrap the streams in a compound file together with the `\x06DataSpaces` storage.
    pub fn into_container(self) -> Result<Vec<u8>, CryptoError> {
        let mut writer = OleWriter::new();
        dataspaces::add_to(&mut writer)?;
        writer.add_stream(&[ENCRYPTION_INFO], self.encryption_info)?;
        writer.add_stream(&[ENCRYPTED_PACKAGE], self.encrypted_package)?;
        writer.finish()
    }
}

pub(crate) fn decrypt(
    streams: &EncryptedStreams,
    password: &str,
    cancel: &dyn Fn() -> bool,
) -> Result<Vec<u8>, CryptoError> {
    decrypt_parts(
        &streams.encryption_info,
        &streams.encrypted_package,
        password,
        cancel,
    )
}

/// Parse, unlock, check integrity, then decrypt. The HMAC is checked before any segment is
/// decrypted, so a tampered package never yields plaintext.
pub(crate) fn decrypt_parts(
    encryption_info: &[u8],
    encrypted_package: &[u8],
    password: &str,
    cancel: &dyn Fn() -> bool,
) -> Result<Vec<u8>, CryptoError> {
    let descriptor = EncryptionDescriptor::parse(encryption_info)?;
    debug!(
        cipher = %descriptor.key_data.cipher,
        hash = %descriptor.key_data.hash,
        spin_count = descriptor.spin_count(),
        data_integrity = descriptor.data_integrity.is_some(),
        package_len = encrypted_package.len(),
        "decrypting agile package"
    );

    let package_key = verifier::unlock(&descriptor, password, cancel)?;

    match &descriptor.data_integrity {
        Some(data_integrity) => integrity::verify(
            &descriptor.key_data,
            data_integrity,
            &package_key,
            encrypted_package,
        )?,
        None => debug!("descriptor has no dataIntegrity, skipping HMAC check"),
    }

    segment::decrypt_package(&descriptor.key_data, &package_key, encrypted_package)
}

pub(crate) fn encrypt(
    plaintext: &[u8],
    password: &str,
    options: &EncryptOptions,
    cancel: &dyn Fn() -> bool,
) -> Result<EncryptedStreams, CryptoError> {
    options.validate()?;

    let block = options.cipher.block_bytes();
    let (key_salt, password_salt) = match options.salt {
        Some(salt) => (salt.to_vec(), salt.to_vec()),
        None => (random_bytes(block), random_bytes(block)),
    };
    let key_data = KeyData {
        cipher: options.cipher,
        hash: options.hash,
        salt: key_salt,
    };
    let package_key = random_secret(options.cipher.key_bytes());

    debug!(
        cipher = %options.cipher,
        hash = %options.hash,
        spin_count = options.spin_count,
        plaintext_len = plaintext.len(),
        "encrypting agile package"
    );

    let password_hash = PasswordHash::compute(
        password,
        &password_salt,
        options.hash,
        options.spin_count,
        cancel,
    )?;
    let password_key = verifier::produce(
        options.cipher,
        options.hash,
        password_salt,
        options.spin_count,
        &password_hash,
        &package_key,
    )?;

    let encrypted_package = segment::encrypt_package(&key_data, &package_key, plaintext)?;
    let data_integrity = if options.data_integrity {
        Some(integrity::produce(&key_data, &package_key, &encrypted_package)?)
    } else {
        None
    };

    let descriptor = EncryptionDescriptor {
        version_major: AGILE_VERSION_MAJOR,
        version_minor: AGILE_VERSION_MINOR,
        flags: AGILE_FLAGS,
        key_data,
        password_key,
        data_integrity,
    };

    Ok(EncryptedStreams {
        encryption_info: descriptor.to_bytes()?,
        encrypted_package,
    })
}

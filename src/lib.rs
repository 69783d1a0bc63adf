//! Agile Encryption (MS-OFFCRYPTO 2.3.4) for password-protected OOXML files.
//!
//! An encrypted `.docx`/`.xlsx`/`.pptx` is not a zip archive but an OLE compound file holding an
//! `EncryptionInfo` stream (a small binary header followed by an XML descriptor) and an
//! `EncryptedPackage` stream (an 8-byte length prefix followed by AES-CBC ciphertext, processed
//! in 4096-byte segments). This crate reads and writes that wrapper.
//!
//! ```no_run
//! use ooxml_agile::{decrypt_from_file, encrypt_to_bytes, EncryptOptions};
//!
//! let plaintext = decrypt_from_file("report.xlsx", "hunter2").unwrap();
//! let container = encrypt_to_bytes(&plaintext, "correct horse", &EncryptOptions::default()).unwrap();
//! ```
//!
//! Legacy "Standard" (RC4/CryptoAPI) encryption is detected and rejected with
//! [`CryptoError::UnsupportedScheme`].

mod algorithm;
mod crypto;
mod cursor;
mod dataspaces;
mod descriptor;
mod integrity;
mod kdf;
mod ole;
mod options;
mod segment;
mod verifier;

pub use algorithm::{CipherAlgorithm, HashAlgorithm};
pub use crypto::EncryptedStreams;
pub use descriptor::{DataIntegrity, EncryptionDescriptor, KeyData, PasswordKeyEncryptor};
pub use options::EncryptOptions;
pub use segment::SEGMENT_LENGTH;

use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    /// Malformed or truncated structural data. `offset` is relative to the structure named in
    /// `context` (the container for OLE errors, the stream for descriptor/package errors).
    #[error("container is corrupt at byte {offset}: {context}")]
    ContainerCorrupt { offset: u64, context: &'static str },
    #[error("unsupported encryption scheme (version {major}.{minor}); only Agile encryption is supported")]
    UnsupportedScheme { major: u16, minor: u16 },
    #[error("unsupported {field}: {value}")]
    UnsupportedCipher { field: &'static str, value: String },
    #[error("invalid password")]
    InvalidPassword,
    #[error("package integrity check failed")]
    IntegrityViolation,
    #[error("operation cancelled")]
    CancellationRequested,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

macro_rules! validate {
    ($cond:expr, $err:expr) => {
        if $cond {
            Ok(())
        } else {
            Err($err)
        }
    };
}
pub(crate) use validate;

pub(crate) fn corrupt(offset: impl TryInto<u64>, context: &'static str) -> CryptoError {
    CryptoError::ContainerCorrupt {
        offset: offset.try_into().unwrap_or(u64::MAX),
        context,
    }
}

fn never_cancel() -> bool {
    false
}

pub fn decrypt_from_file<P: AsRef<Path>>(path: P, password: &str) -> Result<Vec<u8>, CryptoError> {
    decrypt_from_bytes(fs::read(path)?, password)
}

// takes ownership of raw
pub fn decrypt_from_bytes(raw: Vec<u8>, password: &str) -> Result<Vec<u8>, CryptoError> {
    decrypt_with_cancel(raw, password, &never_cancel)
}

/// Like [`decrypt_from_bytes`], but polls `cancel` between spin-count iterations and aborts with
/// [`CryptoError::CancellationRequested`] once it returns `true`.
pub fn decrypt_with_cancel(
    raw: Vec<u8>,
    password: &str,
    cancel: &dyn Fn() -> bool,
) -> Result<Vec<u8>, CryptoError> {
    let streams = EncryptedStreams::from_container(raw)?;
    crypto::decrypt(&streams, password, cancel)
}

/// Decrypt already-extracted `EncryptionInfo` and `EncryptedPackage` stream contents.
pub fn decrypt_streams(
    encryption_info: &[u8],
    encrypted_package: &[u8],
    password: &str,
) -> Result<Vec<u8>, CryptoError> {
    crypto::decrypt_parts(encryption_info, encrypted_package, password, &never_cancel)
}

pub fn encrypt_to_bytes(
    plaintext: &[u8],
    password: &str,
    options: &EncryptOptions,
) -> Result<Vec<u8>, CryptoError> {
    encrypt_with_cancel(plaintext, password, options, &never_cancel)
}

pub fn encrypt_with_cancel(
    plaintext: &[u8],
    password: &str,
    options: &EncryptOptions,
    cancel: &dyn Fn() -> bool,
) -> Result<Vec<u8>, CryptoError> {
    crypto::encrypt(plaintext, password, options, cancel)?.into_container()
}

pub fn encrypt_to_file<P: AsRef<Path>>(
    plaintext: &[u8],
    path: P,
    password: &str,
    options: &EncryptOptions,
) -> Result<(), CryptoError> {
    let container = encrypt_to_bytes(plaintext, password, options)?;
    fs::write(path, container)?;
    Ok(())
}

/// Encrypt into bare stream contents, without wrapping them in a compound file.
pub fn encrypt_streams(
    plaintext: &[u8],
    password: &str,
    options: &EncryptOptions,
) -> Result<EncryptedStreams, CryptoError> {
    crypto::encrypt(plaintext, password, options, &never_cancel)
}

/// Parse the encryption descriptor of a container without a password.
pub fn inspect(raw: Vec<u8>) -> Result<EncryptionDescriptor, CryptoError> {
    let streams = EncryptedStreams::from_container(raw)?;
    EncryptionDescriptor::parse(&streams.encryption_info)
}

/// Returns true if `raw` is a compound file carrying both `EncryptionInfo` and
/// `EncryptedPackage` streams.
pub fn is_encrypted(raw: &[u8]) -> bool {
    if !ole::has_magic(raw) {
        return false;
    }
    ole::OleFile::new(raw)
        .and_then(|mut olefile| {
            olefile.init()?;
            Ok(olefile.has_stream(&[crypto::ENCRYPTION_INFO])
                && olefile.has_stream(&[crypto::ENCRYPTED_PACKAGE]))
        })
        .unwrap_or(false)
}

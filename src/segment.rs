use crate::algorithm::pad_to_block;
use crate::cursor::ByteCursor;
use crate::descriptor::KeyData;
use crate::kdf::derive_iv;
use crate::{corrupt, CryptoError};

use rayon::prelude::*;
use tracing::debug;
use zeroize::Zeroizing;

/// Plaintext bytes per independently IV'd package segment.
pub const SEGMENT_LENGTH: usize = 4096;

/// Size of the little-endian plaintext length that prefixes the `EncryptedPackage` stream.
pub(crate) const PACKAGE_HEADER_LENGTH: usize = 8;

pub(crate) fn segment_iv(key_data: &KeyData, index: u32) -> Zeroizing<Vec<u8>> {
    derive_iv(
        key_data.hash,
        &key_data.salt,
        &index.to_le_bytes(),
        key_data.cipher.block_bytes(),
    )
}

/// Decrypt one segment in place. Segments only depend on their own index.
pub(crate) fn decrypt_segment(
    key_data: &KeyData,
    package_key: &[u8],
    index: u32,
    segment: &mut [u8],
) -> Result<(), CryptoError> {
    let iv = segment_iv(key_data, index);
    key_data.cipher.decrypt_cbc(package_key, &iv, segment)
}

fn encrypt_segment(
    key_data: &KeyData,
    package_key: &[u8],
    index: u32,
    segment: &mut [u8],
) -> Result<(), CryptoError> {
    let iv = segment_iv(key_data, index);
    key_data.cipher.encrypt_cbc(package_key, &iv, segment)
}

fn segment_index(index: usize) -> Result<u32, CryptoError> {
    u32::try_from(index).map_err(|_| CryptoError::InvalidInput("package has too many segments"))
}

/// Decrypt an `EncryptedPackage` stream and truncate to its recorded length.
///
/// Ciphertext past the last block that holds recorded plaintext is ignored.
pub(crate) fn decrypt_package(
    key_data: &KeyData,
    package_key: &[u8],
    encrypted_package: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut cursor = ByteCursor::new(encrypted_package);
    let recorded = cursor.read_u64("EncryptedPackage size")?;
    let ciphertext = cursor.remaining();

    let block = key_data.cipher.block_bytes();
    let plaintext_len = usize::try_from(recorded)
        .map_err(|_| corrupt(0, "recorded package size exceeds ciphertext"))?;
    let needed = plaintext_len
        .checked_next_multiple_of(block)
        .filter(|needed| *needed <= ciphertext.len())
        .ok_or_else(|| corrupt(0, "recorded package size exceeds ciphertext"))?;

    if ciphertext.len() > needed {
        debug!(
            recorded,
            trailing = ciphertext.len() - needed,
            "ignoring ciphertext past recorded package size"
        );
    }

    let mut plaintext = Zeroizing::new(ciphertext[..needed].to_vec());
    plaintext
        .par_chunks_mut(SEGMENT_LENGTH)
        .enumerate()
        .try_for_each(|(index, segment)| {
            decrypt_segment(key_data, package_key, segment_index(index)?, segment)
        })?;
    plaintext.truncate(plaintext_len);

    Ok(std::mem::take(&mut *plaintext))
}

/// Build an `EncryptedPackage` stream: the plaintext length, then every segment encrypted
/// with the last one zero-padded to a whole block.
pub(crate) fn encrypt_package(
    key_data: &KeyData,
    package_key: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let padded = pad_to_block(plaintext, key_data.cipher.block_bytes());

    let mut stream = Vec::with_capacity(PACKAGE_HEADER_LENGTH + padded.len());
    stream.extend_from_slice(&(plaintext.len() as u64).to_le_bytes());
    stream.extend_from_slice(&padded);

    stream[PACKAGE_HEADER_LENGTH..]
        .par_chunks_mut(SEGMENT_LENGTH)
        .enumerate()
        .try_for_each(|(index, segment)| {
            encrypt_segment(key_data, package_key, segment_index(index)?, segment)
        })?;

    Ok(stream)
}

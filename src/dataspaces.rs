//! The `\x06DataSpaces` storage that marks `EncryptedPackage` as transformed by the strong
//! encryption data space (MS-OFFCRYPTO 2.1.5 - 2.1.9, 2.3.4.1).

use crate::ole::OleWriter;
use crate::CryptoError;

const DATA_SPACES: &str = "\u{6}DataSpaces";
const STRONG_ENCRYPTION_DATA_SPACE: &str = "StrongEncryptionDataSpace";
const STRONG_ENCRYPTION_TRANSFORM: &str = "StrongEncryptionTransform";
const ENCRYPTION_TRANSFORM_ID: &str = "{FF9A3F03-56EF-4613-BDD5-5A41C1D07246}";

/// Add the `\x06DataSpaces` storages and streams that accompany an encrypted package.
pub(crate) fn add_to(writer: &mut OleWriter) -> Result<(), CryptoError> {
    writer.add_storage(&[DATA_SPACES])?;
    writer.add_stream(&[DATA_SPACES, "Version"], version_info())?;
    writer.add_stream(&[DATA_SPACES, "DataSpaceMap"], data_space_map())?;

    writer.add_storage(&[DATA_SPACES, "DataSpaceInfo"])?;
    writer.add_stream(
        &[DATA_SPACES, "DataSpaceInfo", STRONG_ENCRYPTION_DATA_SPACE],
        data_space_definition(),
    )?;

    writer.add_storage(&[DATA_SPACES, "TransformInfo"])?;
    writer.add_storage(&[DATA_SPACES, "TransformInfo", STRONG_ENCRYPTION_TRANSFORM])?;
    writer.add_stream(
        &[
            DATA_SPACES,
            "TransformInfo",
            STRONG_ENCRYPTION_TRANSFORM,
            "\u{6}Primary",
        ],
        transform_info(),
    )
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// `UNICODE-LP-P4`: byte length, UTF-16LE characters, zero padding to 4 bytes.
fn push_unicode_lp_p4(out: &mut Vec<u8>, value: &str) {
    let units: Vec<u16> = value.encode_utf16().collect();
    push_u32(out, (units.len() * 2) as u32);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.resize(out.len().next_multiple_of(4), 0);
}

/// Reader, updater and writer versions, all 1.0.
fn push_versions(out: &mut Vec<u8>) {
    for _ in 0..3 {
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
    }
}

fn version_info() -> Vec<u8> {
    let mut out = Vec::new();
    push_unicode_lp_p4(&mut out, "Microsoft.Container.DataSpaces");
    push_versions(&mut out);
    out
}

fn data_space_map() -> Vec<u8> {
    let mut entry = Vec::new();
    // one reference component, of type stream
    push_u32(&mut entry, 1);
    push_u32(&mut entry, 0);
    push_unicode_lp_p4(&mut entry, "EncryptedPackage");
    push_unicode_lp_p4(&mut entry, STRONG_ENCRYPTION_DATA_SPACE);

    let mut out = Vec::new();
    push_u32(&mut out, 8);
    push_u32(&mut out, 1);
    push_u32(&mut out, (entry.len() + 4) as u32);
    out.extend_from_slice(&entry);
    out
}

fn data_space_definition() -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, 8);
    push_u32(&mut out, 1);
    push_unicode_lp_p4(&mut out, STRONG_ENCRYPTION_TRANSFORM);
    out
}

fn transform_info() -> Vec<u8> {
    let mut header = Vec::new();
    push_u32(&mut header, 1);
    push_unicode_lp_p4(&mut header, ENCRYPTION_TRANSFORM_ID);

    let mut out = Vec::new();
    push_u32(&mut out, (header.len() + 4) as u32);
    out.extend_from_slice(&header);
    push_unicode_lp_p4(&mut out, "Microsoft.Container.EncryptionTransform");
    push_versions(&mut out);

    // EncryptionTransformInfo: null name, block size, cipher mode, reserved
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);
    push_u32(&mut out, 4);
    out
}

#![allow(dead_code)]

use ooxml_agile::{CipherAlgorithm, EncryptOptions, HashAlgorithm};

/// Low spin count so tests do not spend their time in the hash chain.
pub fn fast_options(cipher: CipherAlgorithm, hash: HashAlgorithm) -> EncryptOptions {
    EncryptOptions {
        spin_count: 10,
        cipher,
        hash,
        ..Default::default()
    }
}

pub fn default_fast_options() -> EncryptOptions {
    fast_options(CipherAlgorithm::Aes256, HashAlgorithm::Sha512)
}

/// Deterministic filler that does not repeat on segment boundaries.
pub fn sample_package(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 4096) as u8).collect()
}

pub fn temp_path(name: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("ooxml-agile-{}-{}", std::process::id(), name));
    path
}

pub fn read_test_file(name: &str) -> Vec<u8> {
    let mut path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("files");
    path.push(name);
    std::fs::read(path).unwrap()
}

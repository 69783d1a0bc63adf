use ooxml_agile::*;

mod utils;

// Streams written by a separate MS-OFFCRYPTO implementation, spin count 1000, with distinct
// keyData and password salts.
fn decrypt_fixture(name: &str, password: &str) -> Result<Vec<u8>, CryptoError> {
    decrypt_streams(
        &utils::read_test_file(&format!("{name}.info")),
        &utils::read_test_file(&format!("{name}.package")),
        password,
    )
}

#[test]
fn agile_aes256_sha1() {
    // a 20-byte SHA-1 digest is extended with 0x36 to the 32-byte key
    let decrypted = decrypt_fixture("agileAes256Sha1", "Test123").unwrap();
    let expected = utils::read_test_file("expectedAgile.bin");

    assert!(decrypted == expected);
}

#[test]
fn agile_aes128_sha512() {
    let decrypted = decrypt_fixture("agileAes128Sha512", "pässwörd").unwrap();
    let expected = utils::read_test_file("expectedAgile.bin");

    assert!(decrypted == expected);
}

#[test]
fn agile_aes192_sha384_without_integrity() {
    let decrypted = decrypt_fixture("agileAes192Sha384NoIntegrity", "testPassword").unwrap();
    let expected = utils::read_test_file("expectedAgile.bin");

    assert!(decrypted == expected);
}

#[test]
fn fixture_matches_sample_package() {
    assert_eq!(
        utils::read_test_file("expectedAgile.bin"),
        utils::sample_package(9000)
    );
}

#[test]
fn fixture_parameters() {
    let descriptor =
        EncryptionDescriptor::parse(&utils::read_test_file("agileAes256Sha1.info")).unwrap();

    assert_eq!(descriptor.key_data.cipher, CipherAlgorithm::Aes256);
    assert_eq!(descriptor.key_data.hash, HashAlgorithm::Sha1);
    assert_eq!(descriptor.key_data.salt, (0u8..16).collect::<Vec<_>>());
    assert_eq!(descriptor.salt_value(), (16u8..32).collect::<Vec<_>>().as_slice());
    assert_eq!(descriptor.spin_count(), 1000);
    assert!(descriptor.data_integrity.is_some());
}

#[test]
fn fixture_wrong_password() {
    assert!(matches!(
        decrypt_fixture("agileAes256Sha1", "test123"),
        Err(CryptoError::InvalidPassword)
    ));
    assert!(matches!(
        decrypt_fixture("agileAes128Sha512", "passwort"),
        Err(CryptoError::InvalidPassword)
    ));
}

#[test]
fn fixture_tampering() {
    let info = utils::read_test_file("agileAes128Sha512.info");
    let mut package = utils::read_test_file("agileAes128Sha512.package");
    let last = package.len() - 1;
    package[last] ^= 0x80;

    assert!(matches!(
        decrypt_streams(&info, &package, "pässwörd"),
        Err(CryptoError::IntegrityViolation)
    ));
}

//! The `EncryptionInfo` stream of an Agile-encrypted container: an 8-byte version header followed
//! by an XML descriptor (MS-OFFCRYPTO 2.3.4.10).

use crate::algorithm::{CipherAlgorithm, HashAlgorithm};
use crate::cursor::ByteCursor;
use crate::{corrupt, validate, CryptoError};

use base64::engine::general_purpose;
use base64::Engine;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::reader::Reader;
use quick_xml::Writer;

pub(crate) const AGILE_VERSION_MAJOR: u16 = 4;
pub(crate) const AGILE_VERSION_MINOR: u16 = 4;
pub(crate) const AGILE_FLAGS: u32 = 0x40;

const ENCRYPTION_NS: &str = "http://schemas.microsoft.com/office/2006/encryption";
const PASSWORD_NS: &str = "http://schemas.microsoft.com/office/2006/keyEncryptor/password";
const CERTIFICATE_NS: &str = "http://schemas.microsoft.com/office/2006/keyEncryptor/certificate";
const CHAINING_MODE_CBC: &str = "ChainingModeCBC";

const MAX_SPIN_COUNT: u32 = 10_000_000;

/// Parsed `EncryptionInfo` stream.
///
/// Holds only public parameters and ciphertext blobs, never a password or a derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionDescriptor {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    /// Parameters of the package cipher.
    pub key_data: KeyData,
    /// The password key encryptor (`p:encryptedKey`).
    pub password_key: PasswordKeyEncryptor,
    pub data_integrity: Option<DataIntegrity>,
}

/// `keyData`: the cipher, hash and salt used for package segments and integrity IVs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyData {
    pub cipher: CipherAlgorithm,
    pub hash: HashAlgorithm,
    pub salt: Vec<u8>,
}

/// `p:encryptedKey`: how the package key is protected under the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordKeyEncryptor {
    pub cipher: CipherAlgorithm,
    pub hash: HashAlgorithm,
    pub salt: Vec<u8>,
    pub spin_count: u32,
    pub encrypted_verifier_hash_input: Vec<u8>,
    pub encrypted_verifier_hash_value: Vec<u8>,
    pub encrypted_key_value: Vec<u8>,
}

/// `dataIntegrity`: encrypted HMAC key and HMAC value over the `EncryptedPackage` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataIntegrity {
    pub encrypted_hmac_key: Vec<u8>,
    pub encrypted_hmac_value: Vec<u8>,
}

impl EncryptionDescriptor {
    pub fn parse(encryption_info: &[u8]) -> Result<Self, CryptoError> {
        let mut cursor = ByteCursor::new(encryption_info);
        let version_minor = cursor.read_u16("EncryptionInfo version")?;
        let version_major = cursor.read_u16("EncryptionInfo version")?;
        let flags = cursor.read_u32("EncryptionInfo flags")?;

        validate!(
            version_major >= AGILE_VERSION_MAJOR && version_minor == AGILE_VERSION_MINOR,
            CryptoError::UnsupportedScheme {
                major: version_major,
                minor: version_minor,
            }
        )?;

        let body_offset = cursor.position();
        let xml = std::str::from_utf8(cursor.remaining())
            .map_err(|e| corrupt(body_offset + e.valid_up_to(), "descriptor is not UTF-8"))?;
        let (xml, body_offset) = match xml.strip_prefix('\u{feff}') {
            Some(stripped) => (stripped, body_offset + '\u{feff}'.len_utf8()),
            None => (xml, body_offset),
        };
        let elements = read_elements(xml, body_offset)?;

        let key_data_element = elements
            .key_data
            .ok_or_else(|| corrupt(encryption_info.len(), "descriptor has no keyData"))?;
        let password_element = elements.password_key.ok_or_else(|| {
            corrupt(encryption_info.len(), "descriptor has no password key encryptor")
        })?;

        let key_data = key_data_element.key_data()?;
        let password_key = password_element.password_key(&key_data)?;
        let data_integrity = elements
            .data_integrity
            .map(|element| element.data_integrity(&key_data))
            .transpose()?;

        Ok(EncryptionDescriptor {
            version_major,
            version_minor,
            flags,
            key_data,
            password_key,
            data_integrity,
        })
    }

    /// Serialize as an `EncryptionInfo` stream: the 4.4 Agile header followed by the XML
    /// descriptor.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(1024);
        out.extend_from_slice(&self.version_minor.to_le_bytes());
        out.extend_from_slice(&self.version_major.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.xml()?);

        Ok(out)
    }

    fn xml(&self) -> Result<Vec<u8>, CryptoError> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))
            .map_err(xml_write_error)?;
        writer.inner().extend_from_slice(b"\r\n");

        let mut root = BytesStart::new("encryption");
        root.push_attribute(("xmlns", ENCRYPTION_NS));
        root.push_attribute(("xmlns:p", PASSWORD_NS));
        root.push_attribute(("xmlns:c", CERTIFICATE_NS));
        writer.write_event(Event::Start(root)).map_err(xml_write_error)?;

        let key_data = &self.key_data;
        let mut element = BytesStart::new("keyData");
        push_cipher_params(
            &mut element,
            key_data.cipher,
            key_data.hash,
            &key_data.salt,
        );
        writer.write_event(Event::Empty(element)).map_err(xml_write_error)?;

        if let Some(integrity) = &self.data_integrity {
            let mut element = BytesStart::new("dataIntegrity");
            element.push_attribute((
                "encryptedHmacKey",
                b64_encode(&integrity.encrypted_hmac_key).as_str(),
            ));
            element.push_attribute((
                "encryptedHmacValue",
                b64_encode(&integrity.encrypted_hmac_value).as_str(),
            ));
            writer.write_event(Event::Empty(element)).map_err(xml_write_error)?;
        }

        writer
            .write_event(Event::Start(BytesStart::new("keyEncryptors")))
            .map_err(xml_write_error)?;
        let mut encryptor = BytesStart::new("keyEncryptor");
        encryptor.push_attribute(("uri", PASSWORD_NS));
        writer.write_event(Event::Start(encryptor)).map_err(xml_write_error)?;

        let password_key = &self.password_key;
        let mut element = BytesStart::new("p:encryptedKey");
        element.push_attribute(("spinCount", password_key.spin_count.to_string().as_str()));
        push_cipher_params(
            &mut element,
            password_key.cipher,
            password_key.hash,
            &password_key.salt,
        );
        element.push_attribute((
            "encryptedVerifierHashInput",
            b64_encode(&password_key.encrypted_verifier_hash_input).as_str(),
        ));
        element.push_attribute((
            "encryptedVerifierHashValue",
            b64_encode(&password_key.encrypted_verifier_hash_value).as_str(),
        ));
        element.push_attribute((
            "encryptedKeyValue",
            b64_encode(&password_key.encrypted_key_value).as_str(),
        ));
        writer.write_event(Event::Empty(element)).map_err(xml_write_error)?;

        for name in ["keyEncryptor", "keyEncryptors", "encryption"] {
            writer
                .write_event(Event::End(BytesEnd::new(name)))
                .map_err(xml_write_error)?;
        }

        Ok(writer.into_inner())
    }

    pub fn cipher_key_bits(&self) -> u32 {
        self.key_data.cipher.key_bits()
    }

    pub fn cipher_block_bytes(&self) -> usize {
        self.key_data.cipher.block_bytes()
    }

    pub fn hash_size_bytes(&self) -> usize {
        self.key_data.hash.digest_len()
    }

    /// Salt of the password key encryptor, which seeds the spin-count hash chain.
    pub fn salt_value(&self) -> &[u8] {
        &self.password_key.salt
    }

    pub fn spin_count(&self) -> u32 {
        self.password_key.spin_count
    }

    /// Check `password` against the encrypted verifier without recovering the package key.
    pub fn verify_password(&self, password: &str) -> Result<bool, CryptoError> {
        crate::verifier::verify(self, password, &|| false)
    }
}

fn push_cipher_params(
    element: &mut BytesStart,
    cipher: CipherAlgorithm,
    hash: HashAlgorithm,
    salt: &[u8],
) {
    element.push_attribute(("saltSize", salt.len().to_string().as_str()));
    element.push_attribute(("blockSize", cipher.block_bytes().to_string().as_str()));
    element.push_attribute(("keyBits", cipher.key_bits().to_string().as_str()));
    element.push_attribute(("hashSize", hash.digest_len().to_string().as_str()));
    element.push_attribute(("cipherAlgorithm", cipher.name()));
    element.push_attribute(("cipherChaining", CHAINING_MODE_CBC));
    element.push_attribute(("hashAlgorithm", hash.name()));
    element.push_attribute(("saltValue", b64_encode(salt).as_str()));
}

fn xml_write_error(_: quick_xml::Error) -> CryptoError {
    CryptoError::InvalidInput("descriptor could not be serialized")
}

#[derive(Default)]
struct DescriptorElements {
    key_data: Option<RawElement>,
    data_integrity: Option<RawElement>,
    password_key: Option<RawElement>,
}

/// Collect the descriptor elements. `base` is the stream offset of the first byte of `xml`.
fn read_elements(xml: &str, base: usize) -> Result<DescriptorElements, CryptoError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut elements = DescriptorElements::default();
    let mut in_password_encryptor = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|_| corrupt(base + reader.buffer_position(), "malformed descriptor XML"))?;
        let offset = base + reader.buffer_position();

        match event {
            // self-closing, so it holds no encryptedKey
            Event::Empty(e) if e.local_name().as_ref() == b"keyEncryptor" => {
                in_password_encryptor = false;
            }
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"keyData" if elements.key_data.is_none() => {
                    elements.key_data = Some(RawElement::read(&e, offset)?);
                }
                b"dataIntegrity" if elements.data_integrity.is_none() => {
                    elements.data_integrity = Some(RawElement::read(&e, offset)?);
                }
                b"keyEncryptor" => {
                    let element = RawElement::read(&e, offset)?;
                    in_password_encryptor = element.uri.as_deref() == Some(PASSWORD_NS);
                }
                b"encryptedKey" if in_password_encryptor && elements.password_key.is_none() => {
                    elements.password_key = Some(RawElement::read(&e, offset)?);
                }
                _ => (),
            },
            Event::End(e) if e.local_name().as_ref() == b"keyEncryptor" => {
                in_password_encryptor = false;
            }
            Event::Eof => break,
            _ => (),
        }
    }

    Ok(elements)
}

/// Attributes of one descriptor element, before validation.
#[derive(Default)]
struct RawElement {
    offset: usize,
    uri: Option<String>,
    salt_size: Option<u32>,
    block_size: Option<u32>,
    key_bits: Option<u32>,
    hash_size: Option<u32>,
    spin_count: Option<u32>,
    cipher_algorithm: Option<String>,
    cipher_chaining: Option<String>,
    hash_algorithm: Option<String>,
    salt_value: Option<Vec<u8>>,
    encrypted_verifier_hash_input: Option<Vec<u8>>,
    encrypted_verifier_hash_value: Option<Vec<u8>>,
    encrypted_key_value: Option<Vec<u8>>,
    encrypted_hmac_key: Option<Vec<u8>>,
    encrypted_hmac_value: Option<Vec<u8>>,
}

impl RawElement {
    fn read(element: &BytesStart, offset: usize) -> Result<Self, CryptoError> {
        let mut raw = RawElement {
            offset,
            ..Default::default()
        };

        for attr in element.attributes() {
            let attr = attr.map_err(|_| corrupt(offset, "malformed descriptor attribute"))?;
            let value = std::str::from_utf8(&attr.value)
                .map_err(|_| corrupt(offset, "descriptor attribute is not UTF-8"))?;

            match attr.key.local_name().as_ref() {
                b"uri" => raw.uri = Some(value.to_owned()),
                b"saltSize" => raw.salt_size = Some(parse_number(value, offset, "invalid saltSize")?),
                b"blockSize" => {
                    raw.block_size = Some(parse_number(value, offset, "invalid blockSize")?)
                }
                b"keyBits" => raw.key_bits = Some(parse_number(value, offset, "invalid keyBits")?),
                b"hashSize" => raw.hash_size = Some(parse_number(value, offset, "invalid hashSize")?),
                b"spinCount" => {
                    raw.spin_count = Some(parse_number(value, offset, "invalid spinCount")?)
                }
                b"cipherAlgorithm" => raw.cipher_algorithm = Some(value.to_owned()),
                b"cipherChaining" => raw.cipher_chaining = Some(value.to_owned()),
                b"hashAlgorithm" => raw.hash_algorithm = Some(value.to_owned()),
                b"saltValue" => raw.salt_value = Some(b64_decode(value, offset, "invalid saltValue")?),
                b"encryptedVerifierHashInput" => {
                    raw.encrypted_verifier_hash_input = Some(b64_decode(
                        value,
                        offset,
                        "invalid encryptedVerifierHashInput",
                    )?)
                }
                b"encryptedVerifierHashValue" => {
                    raw.encrypted_verifier_hash_value = Some(b64_decode(
                        value,
                        offset,
                        "invalid encryptedVerifierHashValue",
                    )?)
                }
                b"encryptedKeyValue" => {
                    raw.encrypted_key_value =
                        Some(b64_decode(value, offset, "invalid encryptedKeyValue")?)
                }
                b"encryptedHmacKey" => {
                    raw.encrypted_hmac_key =
                        Some(b64_decode(value, offset, "invalid encryptedHmacKey")?)
                }
                b"encryptedHmacValue" => {
                    raw.encrypted_hmac_value =
                        Some(b64_decode(value, offset, "invalid encryptedHmacValue")?)
                }
                _ => (),
            }
        }

        Ok(raw)
    }

    /// Cipher, hash and salt shared by `keyData` and `p:encryptedKey`.
    fn cipher_params(
        &mut self,
    ) -> Result<(CipherAlgorithm, HashAlgorithm, Vec<u8>), CryptoError> {
        let offset = self.offset;

        let cipher_name = self
            .cipher_algorithm
            .as_deref()
            .ok_or_else(|| corrupt(offset, "missing cipherAlgorithm"))?;
        let key_bits = self
            .key_bits
            .ok_or_else(|| corrupt(offset, "missing keyBits"))?;
        let cipher = CipherAlgorithm::from_descriptor(cipher_name, key_bits)?;

        if let Some(chaining) = self.cipher_chaining.as_deref() {
            validate!(
                chaining == CHAINING_MODE_CBC,
                CryptoError::UnsupportedCipher {
                    field: "cipherChaining",
                    value: chaining.to_owned(),
                }
            )?;
        }

        let hash_name = self
            .hash_algorithm
            .as_deref()
            .ok_or_else(|| corrupt(offset, "missing hashAlgorithm"))?;
        let hash = HashAlgorithm::from_descriptor(hash_name)?;

        if let Some(hash_size) = self.hash_size {
            validate!(
                hash_size as usize == hash.digest_len(),
                corrupt(offset, "hashSize does not match hashAlgorithm")
            )?;
        }

        if let Some(block_size) = self.block_size {
            validate!(
                block_size as usize == cipher.block_bytes(),
                CryptoError::UnsupportedCipher {
                    field: "blockSize",
                    value: block_size.to_string(),
                }
            )?;
        }

        let salt = self
            .salt_value
            .take()
            .ok_or_else(|| corrupt(offset, "missing saltValue"))?;
        validate!(
            salt.len() == cipher.block_bytes(),
            corrupt(offset, "salt length does not match block size")
        )?;
        if let Some(salt_size) = self.salt_size {
            validate!(
                salt_size as usize == salt.len(),
                corrupt(offset, "saltSize does not match saltValue")
            )?;
        }

        Ok((cipher, hash, salt))
    }

    fn key_data(mut self) -> Result<KeyData, CryptoError> {
        let (cipher, hash, salt) = self.cipher_params()?;
        Ok(KeyData { cipher, hash, salt })
    }

    fn password_key(mut self, key_data: &KeyData) -> Result<PasswordKeyEncryptor, CryptoError> {
        let (cipher, hash, salt) = self.cipher_params()?;
        let offset = self.offset;

        let spin_count = self
            .spin_count
            .ok_or_else(|| corrupt(offset, "missing spinCount"))?;
        validate!(
            (1..=MAX_SPIN_COUNT).contains(&spin_count),
            corrupt(offset, "spinCount out of range")
        )?;

        let block = cipher.block_bytes();
        let encrypted_verifier_hash_input = required_blob(
            self.encrypted_verifier_hash_input,
            block,
            block,
            offset,
            "encryptedVerifierHashInput",
        )?;
        let encrypted_verifier_hash_value = required_blob(
            self.encrypted_verifier_hash_value,
            hash.digest_len(),
            block,
            offset,
            "encryptedVerifierHashValue",
        )?;
        let encrypted_key_value = required_blob(
            self.encrypted_key_value,
            key_data.cipher.key_bytes(),
            block,
            offset,
            "encryptedKeyValue",
        )?;

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

    fn data_integrity(self, key_data: &KeyData) -> Result<DataIntegrity, CryptoError> {
        let block = key_data.cipher.block_bytes();
        let digest_len = key_data.hash.digest_len();

        Ok(DataIntegrity {
            encrypted_hmac_key: required_blob(
                self.encrypted_hmac_key,
                digest_len,
                block,
                self.offset,
                "encryptedHmacKey",
            )?,
            encrypted_hmac_value: required_blob(
                self.encrypted_hmac_value,
                digest_len,
                block,
                self.offset,
                "encryptedHmacValue",
            )?,
        })
    }
}

/// An encrypted blob must be present, whole cipher blocks, and long enough to hold `min_plain`
/// bytes once decrypted.
fn required_blob(
    blob: Option<Vec<u8>>,
    min_plain: usize,
    block: usize,
    offset: usize,
    context: &'static str,
) -> Result<Vec<u8>, CryptoError> {
    let blob = blob.ok_or_else(|| corrupt(offset, context))?;
    validate!(
        !blob.is_empty() && blob.len() % block == 0 && blob.len() >= min_plain,
        corrupt(offset, context)
    )?;

    Ok(blob)
}

fn parse_number(value: &str, offset: usize, context: &'static str) -> Result<u32, CryptoError> {
    value.trim().parse().map_err(|_| corrupt(offset, context))
}

fn b64_decode(value: &str, offset: usize, context: &'static str) -> Result<Vec<u8>, CryptoError> {
    // some writers wrap long values
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    general_purpose::STANDARD
        .decode(compact)
        .map_err(|_| corrupt(offset, context))
}

fn b64_encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

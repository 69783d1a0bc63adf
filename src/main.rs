use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ooxml_agile::{CipherAlgorithm, EncryptOptions, HashAlgorithm};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Cipher {
    Aes128,
    Aes192,
    Aes256,
}

impl From<Cipher> for CipherAlgorithm {
    fn from(cipher: Cipher) -> Self {
        match cipher {
            Cipher::Aes128 => CipherAlgorithm::Aes128,
            Cipher::Aes192 => CipherAlgorithm::Aes192,
            Cipher::Aes256 => CipherAlgorithm::Aes256,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Hash {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl From<Hash> for HashAlgorithm {
    fn from(hash: Hash) -> Self {
        match hash {
            Hash::Sha1 => HashAlgorithm::Sha1,
            Hash::Sha256 => HashAlgorithm::Sha256,
            Hash::Sha384 => HashAlgorithm::Sha384,
            Hash::Sha512 => HashAlgorithm::Sha512,
        }
    }
}

#[derive(Parser)]
#[command(about = "Decrypt and encrypt password-protected OOXML files (Agile Encryption).")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decrypt an encrypted container into the plain OOXML package.
    Decrypt {
        input: PathBuf,
        output: PathBuf,
        #[arg(short, long)]
        password: String,
    },
    /// Encrypt a plain OOXML package into a compound file container.
    Encrypt {
        input: PathBuf,
        output: PathBuf,
        #[arg(short, long)]
        password: String,
        /// Hash iterations used to stretch the password.
        #[arg(long, default_value_t = 100_000)]
        spin_count: u32,
        #[arg(long, value_enum, default_value_t = Cipher::Aes256)]
        cipher: Cipher,
        #[arg(long, value_enum, default_value_t = Hash::Sha512)]
        hash: Hash,
        /// Skip the dataIntegrity HMAC.
        #[arg(long)]
        no_integrity: bool,
    },
    /// Print the encryption parameters of a container.
    Info { input: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Decrypt {
            input,
            output,
            password,
        } => {
            let plaintext = ooxml_agile::decrypt_from_file(&input, &password)
                .with_context(|| format!("failed to decrypt {}", input.display()))?;
            fs::write(&output, plaintext)
                .with_context(|| format!("failed to write {}", output.display()))?;
        }
        Command::Encrypt {
            input,
            output,
            password,
            spin_count,
            cipher,
            hash,
            no_integrity,
        } => {
            let plaintext =
                fs::read(&input).with_context(|| format!("failed to read {}", input.display()))?;
            let options = EncryptOptions {
                spin_count,
                cipher: cipher.into(),
                hash: hash.into(),
                data_integrity: !no_integrity,
                salt: None,
            };
            ooxml_agile::encrypt_to_file(&plaintext, &output, &password, &options)
                .with_context(|| format!("failed to encrypt {}", input.display()))?;
        }
        Command::Info { input } => {
            let raw = fs::read(&input).with_context(|| format!("failed to read {}", input.display()))?;
            if !ooxml_agile::is_encrypted(&raw) {
                println!("{}: not an encrypted container", input.display());
                return Ok(());
            }
            let descriptor = ooxml_agile::inspect(raw)
                .with_context(|| format!("failed to parse {}", input.display()))?;
            println!(
                "version:        {}.{}",
                descriptor.version_major, descriptor.version_minor
            );
            println!(
                "cipher:         {}-{} CBC",
                descriptor.key_data.cipher.name(),
                descriptor.cipher_key_bits()
            );
            println!("hash:           {}", descriptor.key_data.hash);
            println!("spin count:     {}", descriptor.spin_count());
            println!(
                "data integrity: {}",
                if descriptor.data_integrity.is_some() {
                    "yes"
                } else {
                    "no"
                }
            );
        }
    }

    Ok(())
}

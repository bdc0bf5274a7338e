//! In-place file encryption for backup archives.
//!
//! Payload layout: `[salt: 16 bytes][AES-256-CBC ciphertext, PKCS#7 padded]`.
//! Key and IV are re-derived from the passphrase and salt on both paths; the
//! IV is the first 16 bytes of the derived key, which keeps archives written
//! by earlier releases readable.

use std::io::Write;
use std::path::Path;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::errors::{AppError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

struct KeyMaterial {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl KeyMaterial {
    fn iv(&self) -> &[u8] {
        &self.key[..IV_LEN]
    }
}

fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> KeyMaterial {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key[..]);
    KeyMaterial { key }
}

/// Encrypts `plaintext` under a freshly generated random salt.
pub fn encrypt_bytes(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| AppError::Encryption(format!("failed to generate salt: {}", e)))?;
    encrypt_with_salt(plaintext, passphrase, &salt)
}

fn encrypt_with_salt(plaintext: &[u8], passphrase: &str, salt: &[u8; SALT_LEN]) -> Result<Vec<u8>> {
    let material = derive_key(passphrase, salt, PBKDF2_ITERATIONS);
    let cipher = Aes256CbcEnc::new_from_slices(&material.key[..], material.iv())
        .map_err(|e| AppError::Encryption(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut payload = Vec::with_capacity(SALT_LEN + ciphertext.len());
    payload.extend_from_slice(salt);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Splits `payload` into salt and ciphertext and decrypts it.
pub fn decrypt_bytes(payload: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    if payload.len() < SALT_LEN {
        return Err(AppError::Decryption(format!(
            "payload is {} bytes, shorter than the {}-byte salt",
            payload.len(),
            SALT_LEN
        )));
    }
    let (salt, ciphertext) = payload.split_at(SALT_LEN);
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(AppError::Decryption(format!(
            "ciphertext length {} is not a multiple of the {}-byte block size",
            ciphertext.len(),
            BLOCK_LEN
        )));
    }

    let material = derive_key(passphrase, salt, PBKDF2_ITERATIONS);
    let cipher = Aes256CbcDec::new_from_slices(&material.key[..], material.iv())
        .map_err(|e| AppError::Decryption(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| AppError::Decryption("invalid padding".to_string()))
}

/// Encrypts the file at `path` in place.
pub async fn encrypt_file(path: &Path, passphrase: &str) -> Result<()> {
    let plaintext = tokio::fs::read(path).await?;
    let plaintext_len = plaintext.len();
    let passphrase = Zeroizing::new(passphrase.to_owned());
    let payload = tokio::task::spawn_blocking(move || encrypt_bytes(&plaintext, &passphrase))
        .await
        .map_err(|e| AppError::Encryption(format!("encryption task failed: {}", e)))??;

    replace_contents(path, payload).await?;
    info!(path = %path.display(), plaintext_bytes = plaintext_len, "File encrypted successfully");
    Ok(())
}

/// Decrypts the file at `path` in place.
pub async fn decrypt_file(path: &Path, passphrase: &str) -> Result<()> {
    let payload = tokio::fs::read(path).await?;
    let passphrase = Zeroizing::new(passphrase.to_owned());
    let plaintext = tokio::task::spawn_blocking(move || decrypt_bytes(&payload, &passphrase))
        .await
        .map_err(|e| AppError::Decryption(format!("decryption task failed: {}", e)))??;

    let plaintext_len = plaintext.len();
    replace_contents(path, plaintext).await?;
    info!(path = %path.display(), plaintext_bytes = plaintext_len, "File decrypted successfully");
    Ok(())
}

/// Overwrites `path` by writing a sibling temp file and renaming it into place.
async fn replace_contents(path: &Path, contents: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| AppError::Io(e.error))?;
        debug!(path = %path.display(), bytes = contents.len(), "Replaced file contents");
        Ok(())
    })
    .await
    .map_err(|e| AppError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str = "correct horse battery staple";

    #[test]
    fn pbkdf2_matches_published_vector() {
        // PBKDF2-HMAC-SHA256, P="password", S="salt", c=1, dkLen=32
        let material = derive_key("password", b"salt", 1);
        assert_eq!(
            hex::encode(&material.key[..]),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
        assert_eq!(material.iv(), &material.key[..16]);
    }

    #[test]
    fn round_trip_restores_original_bytes() {
        let inputs: [&[u8]; 4] = [b"", b"a", &[7u8; 16], b"pg_dump tar stream bytes \x00\x01\x02"];
        for plaintext in inputs {
            let payload = encrypt_bytes(plaintext, PASSPHRASE).unwrap();
            let decrypted = decrypt_bytes(&payload, PASSPHRASE).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn payload_is_salt_then_padded_ciphertext() {
        let plaintext = vec![42u8; 33];
        let payload = encrypt_bytes(&plaintext, PASSPHRASE).unwrap();
        let ciphertext_len = payload.len() - SALT_LEN;
        assert_eq!(ciphertext_len % BLOCK_LEN, 0);
        // PKCS#7 always adds at least one byte of padding
        assert_eq!(ciphertext_len, 48);
    }

    #[test]
    fn fresh_salt_per_encryption() {
        let first = encrypt_bytes(b"same input", PASSPHRASE).unwrap();
        let second = encrypt_bytes(b"same input", PASSPHRASE).unwrap();
        assert_ne!(first[..SALT_LEN], second[..SALT_LEN]);
        assert_ne!(first, second);
    }

    #[test]
    fn fixed_salt_is_deterministic() {
        let salt = [9u8; SALT_LEN];
        let first = encrypt_with_salt(b"deterministic", PASSPHRASE, &salt).unwrap();
        let second = encrypt_with_salt(b"deterministic", PASSPHRASE, &salt).unwrap();
        assert_eq!(first, second);
        assert_eq!(&first[..SALT_LEN], &salt);
    }

    #[test]
    fn wrong_passphrase_never_yields_plaintext() {
        let plaintext = b"SELECT * FROM secrets;".to_vec();
        let payload = encrypt_bytes(&plaintext, PASSPHRASE).unwrap();

        let mut rejected = 0;
        for wrong in ["hunter2", "Correct horse battery staple", "", "tr0ub4dor&3"] {
            match decrypt_bytes(&payload, wrong) {
                Err(AppError::Decryption(_)) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
                Ok(bytes) => assert_ne!(bytes, plaintext),
            }
        }
        assert!(rejected > 0);
    }

    #[test]
    fn misaligned_ciphertext_is_rejected() {
        let mut payload = encrypt_bytes(b"some archive", PASSPHRASE).unwrap();
        payload.pop();
        assert!(matches!(decrypt_bytes(&payload, PASSPHRASE), Err(AppError::Decryption(_))));
    }

    #[test]
    fn short_payload_is_rejected() {
        assert!(matches!(decrypt_bytes(&[0u8; 10], PASSPHRASE), Err(AppError::Decryption(_))));
        // salt only, no ciphertext: nothing to unpad
        assert!(matches!(decrypt_bytes(&[0u8; SALT_LEN], PASSPHRASE), Err(AppError::Decryption(_))));
    }

    #[tokio::test]
    async fn file_round_trip_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db-backup-2024.tar.gz");
        let plain_dump = b"\x1f\x8b compressed dump".to_vec();
        tokio::fs::write(&path, &plain_dump).await.unwrap();

        encrypt_file(&path, PASSPHRASE).await.unwrap();
        let encrypted = tokio::fs::read(&path).await.unwrap();
        assert_ne!(encrypted, plain_dump);
        assert_eq!((encrypted.len() - SALT_LEN) % BLOCK_LEN, 0);

        decrypt_file(&path, PASSPHRASE).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), plain_dump);
    }

    #[tokio::test]
    async fn failed_decrypt_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.tar.gz");
        tokio::fs::write(&path, [1u8; SALT_LEN + 5]).await.unwrap();

        let err = decrypt_file(&path, PASSPHRASE).await.unwrap_err();
        assert!(matches!(err, AppError::Decryption(_)));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![1u8; SALT_LEN + 5]);
    }
}

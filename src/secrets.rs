// ===============================
// src/secrets.rs
// ===============================
//
// Credential store primitives: a 32-byte key kept base64 in a local key
// file, AES-256-GCM for the values, stored as base64(nonce || ciphertext).
// Empty strings pass through unchanged so an unset credential stays unset.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("key file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file is not valid base64")]
    KeyEncoding,
    #[error("key file must decode to exactly 32 bytes")]
    KeyLength,
    #[error("stored secret is not valid base64")]
    ValueEncoding,
    #[error("stored secret is too short")]
    ValueLength,
    #[error("decryption failed (wrong key file or corrupted value)")]
    Cipher,
    #[error("decrypted secret is not valid UTF-8")]
    Utf8,
}

/// Load the key file, or generate one on first use. On Unix the fresh file
/// is chmod 0600.
pub fn load_or_create_key(path: &Path) -> Result<[u8; KEY_LEN], SecretsError> {
    if path.exists() {
        let text = fs::read_to_string(path)?;
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|_| SecretsError::KeyEncoding)?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| SecretsError::KeyLength)?;
        return Ok(key);
    }

    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    fs::write(path, BASE64.encode(key))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    Ok(key)
}

pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &str) -> Result<String, SecretsError> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| SecretsError::Cipher)?;

    let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    raw.extend_from_slice(&nonce);
    raw.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(raw))
}

pub fn decrypt(key: &[u8; KEY_LEN], stored: &str) -> Result<String, SecretsError> {
    if stored.is_empty() {
        return Ok(String::new());
    }
    let raw = BASE64
        .decode(stored)
        .map_err(|_| SecretsError::ValueEncoding)?;
    if raw.len() <= NONCE_LEN {
        return Err(SecretsError::ValueLength);
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SecretsError::Cipher)?;
    String::from_utf8(plaintext).map_err(|_| SecretsError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        key
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sltp_guard_{}_{}", name, std::process::id()))
    }

    #[test]
    fn roundtrip() {
        let key = make_key();
        let stored = encrypt(&key, "bybit-api-key-123").unwrap();
        assert_ne!(stored, "bybit-api-key-123");
        assert_eq!(decrypt(&key, &stored).unwrap(), "bybit-api-key-123");
    }

    #[test]
    fn empty_passthrough() {
        let key = make_key();
        assert_eq!(encrypt(&key, "").unwrap(), "");
        assert_eq!(decrypt(&key, "").unwrap(), "");
    }

    #[test]
    fn fresh_nonce_every_time() {
        let key = make_key();
        let a = encrypt(&key, "same input").unwrap();
        let b = encrypt(&key, "same input").unwrap();
        assert_ne!(a, b);
        assert_eq!(decrypt(&key, &a).unwrap(), decrypt(&key, &b).unwrap());
    }

    #[test]
    fn tampered_value_fails() {
        let key = make_key();
        let stored = encrypt(&key, "secret").unwrap();
        let mut raw = BASE64.decode(&stored).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = BASE64.encode(raw);
        assert!(matches!(decrypt(&key, &tampered), Err(SecretsError::Cipher)));
    }

    #[test]
    fn wrong_key_fails() {
        let key = make_key();
        let stored = encrypt(&key, "secret").unwrap();
        let mut other = make_key();
        other[0] ^= 0xff;
        assert!(matches!(decrypt(&other, &stored), Err(SecretsError::Cipher)));
    }

    #[test]
    fn garbage_value_fails_cleanly() {
        let key = make_key();
        assert!(matches!(decrypt(&key, "not base64 !!"), Err(SecretsError::ValueEncoding)));
        let short = BASE64.encode([1u8; 4]);
        assert!(matches!(decrypt(&key, &short), Err(SecretsError::ValueLength)));
    }

    #[test]
    fn key_file_create_then_load() {
        let path = temp_path("keyfile");
        let _ = std::fs::remove_file(&path);
        let created = load_or_create_key(&path).unwrap();
        let loaded = load_or_create_key(&path).unwrap();
        assert_eq!(created, loaded);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn bad_key_file_is_rejected() {
        let path = temp_path("badkey");
        std::fs::write(&path, BASE64.encode([7u8; 16])).unwrap();
        assert!(matches!(load_or_create_key(&path), Err(SecretsError::KeyLength)));
        let _ = std::fs::remove_file(&path);
    }
}

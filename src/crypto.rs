//! At-rest encryption for invite codes.
//!
//! Codes are sealed with AES-256-GCM under a fresh random nonce, so the same
//! code never produces the same stored value twice. The stored form is
//! base64 of `nonce || ciphertext`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),
    #[error("encryption key is not valid hex: {0}")]
    KeyEncoding(#[from] hex::FromHexError),
    #[error("sealed invite code is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("sealed invite code is too short")]
    Truncated,
    #[error("invite code could not be sealed")]
    Seal,
    #[error("invite code could not be opened with any known key")]
    Open,
    #[error("opened invite code is not valid utf-8")]
    Utf8,
}

/// Seals and opens invite codes.
///
/// New values are always sealed with the current key. Opening tries the
/// current key first and then every retired key, so a key can be rotated
/// without rewriting the table up front.
pub struct InviteCipher {
    current: Aes256Gcm,
    retired: Vec<Aes256Gcm>,
}

impl std::fmt::Debug for InviteCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InviteCipher")
            .field("retired_keys", &self.retired.len())
            .finish_non_exhaustive()
    }
}

fn cipher_from_bytes(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::KeyLength(key.len()));
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
}

fn cipher_from_hex(key: &str) -> Result<Aes256Gcm, CipherError> {
    let bytes = Zeroizing::new(hex::decode(key.trim())?);
    cipher_from_bytes(&bytes)
}

impl InviteCipher {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        Ok(Self {
            current: cipher_from_bytes(key)?,
            retired: Vec::new(),
        })
    }

    pub fn from_hex(key: &str) -> Result<Self, CipherError> {
        Ok(Self {
            current: cipher_from_hex(key)?,
            retired: Vec::new(),
        })
    }

    /// Adds a decrypt-only key.
    pub fn with_retired_hex(mut self, key: &str) -> Result<Self, CipherError> {
        self.retired.push(cipher_from_hex(key)?);
        Ok(self)
    }

    pub fn seal(&self, code: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .current
            .encrypt(&nonce, code.as_bytes())
            .map_err(|_| CipherError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CipherError> {
        let raw = STANDARD.decode(sealed)?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);

        let plaintext = std::iter::once(&self.current)
            .chain(self.retired.iter())
            .find_map(|cipher| cipher.decrypt(nonce, ciphertext).ok())
            .ok_or(CipherError::Open)?;

        String::from_utf8(plaintext).map_err(|_| CipherError::Utf8)
    }
}

#[cfg(test)]
pub(crate) fn test_cipher() -> InviteCipher {
    InviteCipher::new(&[7u8; KEY_LEN]).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const KEY_B: &str = "1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100";

    #[test]
    fn sealed_code_does_not_contain_plaintext() {
        let cipher = InviteCipher::from_hex(KEY_A).unwrap();
        let sealed = cipher.seal("sakura").unwrap();

        assert!(!sealed.contains("sakura"));
        assert_eq!(cipher.open(&sealed).unwrap(), "sakura");
    }

    #[test]
    fn same_code_seals_differently() {
        let cipher = test_cipher();

        let first = cipher.seal("abc").unwrap();
        let second = cipher.seal("abc").unwrap();

        assert_ne!(first, second);
        assert_eq!(cipher.open(&first).unwrap(), cipher.open(&second).unwrap());
    }

    #[test]
    fn retired_key_still_opens_old_values() {
        let old = InviteCipher::from_hex(KEY_A).unwrap();
        let sealed = old.seal("rotated").unwrap();

        let rotated = InviteCipher::from_hex(KEY_B)
            .unwrap()
            .with_retired_hex(KEY_A)
            .unwrap();
        assert_eq!(rotated.open(&sealed).unwrap(), "rotated");

        let fresh = InviteCipher::from_hex(KEY_B).unwrap();
        assert!(matches!(fresh.open(&sealed), Err(CipherError::Open)));
    }

    #[test]
    fn rejects_bad_keys_and_values() {
        assert!(matches!(
            InviteCipher::new(&[0u8; 16]),
            Err(CipherError::KeyLength(16))
        ));
        assert!(matches!(
            InviteCipher::from_hex("zz"),
            Err(CipherError::KeyEncoding(_))
        ));

        let cipher = test_cipher();
        assert!(matches!(cipher.open("AAAA"), Err(CipherError::Truncated)));
        assert!(matches!(cipher.open("%%%"), Err(CipherError::Encoding(_))));
    }
}

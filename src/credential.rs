//! API key generation/validation and symmetric encryption of stored secrets.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use eyre::Result;
use rand::Rng;
use rand::distr::Alphanumeric;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Literal tag every issued key starts with.
pub const KEY_TAG: &str = "bk_live_";

/// Number of random characters after the tag.
pub const KEY_RANDOM_LEN: usize = 32;

/// Number of leading key characters kept for lookup and display.
pub const PREFIX_LEN: usize = 12;

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 100_000;

/// A freshly generated key. `key` is the only copy of the plaintext.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub key: String,
    pub prefix: String,
    pub hash: String,
}

/// Generate a new random API key.
pub fn generate_key() -> GeneratedKey {
    let random: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    let key = format!("{}{}", KEY_TAG, random);
    let prefix = key[..PREFIX_LEN].to_string();
    let hash = hash_key(&key);
    GeneratedKey { key, prefix, hash }
}

/// SHA-256 of the key as 64 lowercase hex characters.
pub fn hash_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// Check `key` against a stored hash in constant time.
pub fn validate_key(key: &str, hash: &str) -> bool {
    if hash.len() != HASH_HEX_LEN {
        return false;
    }
    secrets_equal(&hash_key(key), hash)
}

/// Constant-time string equality. Differing lengths compare unequal.
pub fn secrets_equal(a: &str, b: &str) -> bool {
    // ct_eq on slices of different lengths returns 0 without panicking
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt `value` with a key derived from `password`.
///
/// Output is `hex(salt):hex(nonce):hex(ciphertext)`; salt and nonce are fresh
/// for every call so equal inputs never produce equal output.
pub fn encrypt(value: &str, password: &str) -> Result<String> {
    let salt = rand::rng().random::<[u8; SALT_LEN]>();
    let nonce = rand::rng().random::<[u8; NONCE_LEN]>();

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), value.as_bytes())
        .map_err(|_| eyre::eyre!("Failed to encrypt value"))?;

    Ok(format!(
        "{}:{}:{}",
        hex::encode(salt),
        hex::encode(nonce),
        hex::encode(ciphertext)
    ))
}

/// Decrypt output of [`encrypt`].
///
/// Returns `None` for a wrong password or malformed/corrupted input.
pub fn decrypt(ciphertext: &str, password: &str) -> Option<String> {
    let mut parts = ciphertext.split(':');
    let salt = hex::decode(parts.next()?).ok()?;
    let nonce = hex::decode(parts.next()?).ok()?;
    let body = hex::decode(parts.next()?).ok()?;
    if parts.next().is_some() || salt.len() != SALT_LEN || nonce.len() != NONCE_LEN {
        return None;
    }

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher.decrypt(Nonce::from_slice(&nonce), body.as_slice()).ok()?;
    String::from_utf8(plaintext).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_shape() {
        let generated = generate_key();
        assert!(generated.key.starts_with(KEY_TAG));
        assert_eq!(generated.key.len(), KEY_TAG.len() + KEY_RANDOM_LEN);
        assert_eq!(generated.prefix, &generated.key[..12]);
        assert_eq!(generated.hash, hash_key(&generated.key));
        assert_eq!(generated.hash.len(), 64);
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(generate_key().key, generate_key().key);
    }

    #[test]
    fn test_hash_key_is_deterministic_hex() {
        let a = hash_key("some-key");
        assert_eq!(a, hash_key("some-key"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, hash_key("other-key"));
    }

    #[test]
    fn test_validate_key() {
        let generated = generate_key();
        let other = generate_key();
        assert!(validate_key(&generated.key, &generated.hash));
        assert!(!validate_key(&generated.key, &hash_key(&other.key)));
    }

    #[test]
    fn test_validate_key_rejects_bad_hash_lengths() {
        let generated = generate_key();
        assert!(!validate_key(&generated.key, ""));
        assert!(!validate_key(&generated.key, &generated.hash[..10]));
        assert!(!validate_key(&generated.key, &format!("{}00", generated.hash)));
    }

    #[test]
    fn test_secrets_equal() {
        assert!(secrets_equal("abc", "abc"));
        assert!(!secrets_equal("abc", "abd"));
        assert!(!secrets_equal("abc", "abcd"));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        for value in ["hello", "", "héllo wörld ✓ 日本語 🦀"] {
            let ciphertext = encrypt(value, "pw").unwrap();
            assert_eq!(decrypt(&ciphertext, "pw").as_deref(), Some(value));
        }
    }

    #[test]
    fn test_encrypt_is_randomized() {
        let a = encrypt("same", "pw").unwrap();
        let b = encrypt("same", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_password() {
        let ciphertext = encrypt("secret", "right").unwrap();
        assert_eq!(decrypt(&ciphertext, "wrong"), None);
    }

    #[test]
    fn test_decrypt_garbage() {
        assert_eq!(decrypt("", "pw"), None);
        assert_eq!(decrypt("not-ciphertext", "pw"), None);
        assert_eq!(decrypt("zz:zz:zz", "pw"), None);
        assert_eq!(decrypt("00:00:00", "pw"), None);
        assert_eq!(decrypt("a:b:c:d", "pw"), None);
    }

    #[test]
    fn test_decrypt_tampered() {
        let ciphertext = encrypt("secret", "pw").unwrap();
        let mut tampered = ciphertext.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert_eq!(decrypt(&tampered, "pw"), None);
    }

    #[test]
    fn test_decrypt_empty_is_distinguishable() {
        let ciphertext = encrypt("", "pw").unwrap();
        assert_eq!(decrypt(&ciphertext, "pw"), Some(String::new()));
        assert_eq!(decrypt(&ciphertext, "nope"), None);
    }
}

//! Value Encryption
//!
//! Encrypts values of sensitive keys on write and decrypts marker-prefixed
//! values on read. Stored form: `ENC:` + base64(nonce || ciphertext || tag).

use super::ValueTransformer;
use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::env;

/// Prefix carried by every encrypted value
pub const ENCRYPTED_MARKER: &str = "ENC:";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 cipher keyed by the SHA-256 of a passphrase
#[derive(Clone)]
pub struct ValueCipher {
    aead: ChaCha20Poly1305,
}

impl ValueCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Read the passphrase from an environment variable
    pub fn from_env(var: &str) -> anyhow::Result<Self> {
        let passphrase = env::var(var)
            .map_err(|_| anyhow!("Encryption key not found in environment variable: {}", var))?;
        if passphrase.is_empty() {
            bail!("Encryption key in environment variable {} is empty", var);
        }
        Ok(Self::from_passphrase(&passphrase))
    }

    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| anyhow!("Failed to encrypt value"))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);

        Ok(format!("{}{}", ENCRYPTED_MARKER, general_purpose::STANDARD.encode(payload)))
    }

    pub fn decrypt(&self, stored: &str) -> anyhow::Result<String> {
        let encoded = stored
            .strip_prefix(ENCRYPTED_MARKER)
            .context("Value does not carry the encryption marker")?;
        let payload = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow!("Failed to decode encrypted value: {}", e))?;
        if payload.len() < NONCE_LEN + TAG_LEN {
            bail!("Encrypted value is truncated");
        }

        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| anyhow!("Encrypted value failed authentication (wrong key or tampered value)"))?;
        String::from_utf8(plaintext).context("Decrypted value is not valid UTF-8")
    }
}

impl std::fmt::Debug for ValueCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValueCipher(..)")
    }
}

/// Build a case-insensitive glob set from key patterns such as `*Password*`
pub(crate) fn build_patterns<I, S>(patterns: I) -> anyhow::Result<GlobSet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("Invalid sensitive key pattern: {}", pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Transformer encrypting sensitive values at rest
#[derive(Debug)]
pub struct EncryptionTransformer {
    name: String,
    priority: i32,
    patterns: GlobSet,
    cipher: ValueCipher,
}

impl EncryptionTransformer {
    pub const DEFAULT_PRIORITY: i32 = 100;

    pub fn new<I, S>(cipher: ValueCipher, patterns: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            name: "encryption".to_string(),
            priority: Self::DEFAULT_PRIORITY,
            patterns: build_patterns(patterns)?,
            cipher,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        self.patterns.is_match(key)
    }
}

impl ValueTransformer for EncryptionTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn should_transform(&self, key: &str, value: Option<&str>) -> bool {
        value.is_some_and(|v| v.starts_with(ENCRYPTED_MARKER)) || self.is_sensitive(key)
    }

    fn transform_on_read(&self, _key: &str, value: Option<String>) -> anyhow::Result<Option<String>> {
        match value {
            Some(v) if v.starts_with(ENCRYPTED_MARKER) => Ok(Some(self.cipher.decrypt(&v)?)),
            other => Ok(other),
        }
    }

    fn transform_on_write(&self, _key: &str, value: Option<String>) -> anyhow::Result<Option<String>> {
        match value {
            Some(v) if !v.starts_with(ENCRYPTED_MARKER) => Ok(Some(self.cipher.encrypt(&v)?)),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformer() -> EncryptionTransformer {
        EncryptionTransformer::new(ValueCipher::from_passphrase("test-key"), ["*Password*", "*:ApiKey"]).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let t = transformer();
        for value in ["secret123", "", "ünïcødé and a value longer than one cipher block of sixty-four bytes, padded out"] {
            let stored = t.transform_on_write("Db:Password", Some(value.to_string())).unwrap();
            assert!(stored.as_deref().unwrap().starts_with(ENCRYPTED_MARKER));
            let read = t.transform_on_read("Db:Password", stored).unwrap();
            assert_eq!(read.as_deref(), Some(value));
        }
    }

    #[test]
    fn test_write_does_not_double_encrypt() {
        let t = transformer();
        let once = t.transform_on_write("Db:Password", Some("secret".into())).unwrap();
        let twice = t.transform_on_write("Db:Password", once.clone()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.unwrap().matches(ENCRYPTED_MARKER).count(), 1);
    }

    #[test]
    fn test_plain_values_pass_through_read() {
        let t = transformer();
        assert_eq!(t.transform_on_read("Db:Password", Some("plain".into())).unwrap().as_deref(), Some("plain"));
        assert_eq!(t.transform_on_read("Db:Password", None).unwrap(), None);
        assert_eq!(t.transform_on_write("Db:Password", None).unwrap(), None);
    }

    #[test]
    fn test_pattern_matching_is_case_insensitive() {
        let t = transformer();
        assert!(t.should_transform("Db:PASSWORD", Some("x")));
        assert!(t.should_transform("Service:ApiKey", Some("x")));
        assert!(!t.should_transform("Db:Host", Some("x")));
        // Marker-prefixed values are handled regardless of key
        assert!(t.should_transform("Db:Host", Some("ENC:abc")));
    }

    #[test]
    fn test_tampered_value_fails() {
        let t = transformer();
        let stored = t.transform_on_write("Db:Password", Some("secret".into())).unwrap().unwrap();
        let mut payload = general_purpose::STANDARD.decode(&stored[ENCRYPTED_MARKER.len()..]).unwrap();
        payload[NONCE_LEN] ^= 0xff;
        let tampered = format!("{}{}", ENCRYPTED_MARKER, general_purpose::STANDARD.encode(payload));

        assert!(t.transform_on_read("Db:Password", Some(tampered)).is_err());
    }

    #[test]
    fn test_each_encryption_uses_a_fresh_nonce() {
        let cipher = ValueCipher::from_passphrase("test-key");
        let first = cipher.encrypt("same").unwrap();
        let second = cipher.encrypt("same").unwrap();
        assert_ne!(first, second);

        let payload = general_purpose::STANDARD.decode(&first[ENCRYPTED_MARKER.len()..]).unwrap();
        assert_eq!(payload.len(), NONCE_LEN + "same".len() + TAG_LEN);
        assert!(cipher.decrypt(&format!("{}{}", ENCRYPTED_MARKER, general_purpose::STANDARD.encode(&payload[..NONCE_LEN + 2]))).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let stored = transformer().transform_on_write("Db:Password", Some("secret".into())).unwrap();
        let other = EncryptionTransformer::new(ValueCipher::from_passphrase("other"), ["*Password*"]).unwrap();
        assert!(other.transform_on_read("Db:Password", stored).is_err());
    }

    #[test]
    fn test_cipher_from_env() {
        env::set_var("LAYERCONF_TEST_CIPHER_KEY", "from-env");
        let cipher = ValueCipher::from_env("LAYERCONF_TEST_CIPHER_KEY").unwrap();
        assert_eq!(cipher.decrypt(&cipher.encrypt("x").unwrap()).unwrap(), "x");
        env::remove_var("LAYERCONF_TEST_CIPHER_KEY");

        assert!(ValueCipher::from_env("LAYERCONF_TEST_CIPHER_KEY_MISSING").is_err());
    }
}

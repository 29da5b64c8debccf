use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use thiserror::Error;

/// Serialized bundle prefix: `enc:v1:<iv-hex>:<tag-hex>:<ciphertext-hex>`.
const BUNDLE_PREFIX: &str = "enc";
const BUNDLE_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption failed")]
    Encrypt,
    /// Tampered or corrupted bundle: wrong tag, wrong iv, or mangled
    /// ciphertext. Decryption never yields partial plaintext.
    #[error("ciphertext integrity check failed")]
    Integrity,
    #[error("malformed ciphertext bundle")]
    Malformed,
}

/// AES-256-GCM cipher for the organization's upstream secret at rest.
/// The key is loaded once at startup and held only in memory.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypts with a fresh random nonce per call and returns the serialized
    /// bundle. Nonces are never reused across calls.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;
        // aes-gcm appends the tag to the ciphertext; the bundle keeps them apart.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(format!(
            "{BUNDLE_PREFIX}:{BUNDLE_VERSION}:{}:{}:{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(sealed),
        ))
    }

    /// Verifies the authentication tag before releasing plaintext. Any
    /// modification to iv, tag, or ciphertext fails deterministically.
    pub fn decrypt(&self, bundle: &str) -> Result<String, CipherError> {
        let (iv, tag, ciphertext) = parse_bundle(bundle).ok_or(CipherError::Malformed)?;
        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| CipherError::Integrity)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Integrity)
    }

    /// Structural check used to tell already-encrypted values from legacy
    /// plaintext during migration. Data hygiene, not a security boundary.
    pub fn is_encrypted_format(value: &str) -> bool {
        parse_bundle(value).is_some()
    }
}

fn parse_bundle(bundle: &str) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut parts = bundle.split(':');
    if parts.next()? != BUNDLE_PREFIX || parts.next()? != BUNDLE_VERSION {
        return None;
    }
    let iv = hex::decode(parts.next()?).ok()?;
    let tag = hex::decode(parts.next()?).ok()?;
    let ciphertext = hex::decode(parts.next()?).ok()?;
    if parts.next().is_some() || iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return None;
    }
    Some((iv, tag, ciphertext))
}

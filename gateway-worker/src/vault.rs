// Crypto vault for device session blobs.
//
// Every worker in the fleet shares one symmetric key so any of them can
// resume any device's session after a deploy. Tokens are self-describing:
//
//   v1:<iv_b64>:<tag_b64>:<ct_b64>
//
// AES-256-GCM with a 96-bit random nonce; integrity and confidentiality are
// tied together so partial-state tampering surfaces as `BadTag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;

const TOKEN_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("token format is not recognized")]
    BadFormat,
    #[error("encryption key is missing or not exactly 32 bytes")]
    BadKey,
    #[error("authentication tag mismatch")]
    BadTag,
}

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self { cipher }
    }

    /// Build the vault from the base64-encoded key material.
    ///
    /// Fails with `BadKey` when the value is absent, not valid base64, or
    /// not exactly 32 bytes once decoded. Callers treat this as a startup
    /// fatal (configuration error).
    pub fn from_key_b64(key_b64: Option<&str>) -> Result<Self, VaultError> {
        let key_b64 = key_b64.ok_or(VaultError::BadKey)?;
        let bytes = B64.decode(key_b64).map_err(|_| VaultError::BadKey)?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| VaultError::BadKey)?;
        Ok(Self::new(&key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // AES-GCM appends the 16-byte tag to the ciphertext; the token keeps
        // the two as separate fields.
        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("AES-GCM encryption cannot fail for in-memory payloads");
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        format!(
            "{TOKEN_VERSION}:{}:{}:{}",
            B64.encode(nonce_bytes),
            B64.encode(&tag),
            B64.encode(&sealed),
        )
    }

    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, VaultError> {
        let parts: Vec<&str> = token.split(':').collect();
        let [version, iv_b64, tag_b64, ct_b64] = parts.as_slice() else {
            return Err(VaultError::BadFormat);
        };
        if *version != TOKEN_VERSION {
            return Err(VaultError::BadFormat);
        }

        let iv = B64.decode(iv_b64).map_err(|_| VaultError::BadFormat)?;
        let tag = B64.decode(tag_b64).map_err(|_| VaultError::BadFormat)?;
        let ct = B64.decode(ct_b64).map_err(|_| VaultError::BadFormat)?;
        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(VaultError::BadFormat);
        }

        let mut sealed = ct;
        sealed.extend_from_slice(&tag);
        self.cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| VaultError::BadTag)
    }
}

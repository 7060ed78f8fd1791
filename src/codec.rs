//! Credential codec (§4.2): symmetric encrypt/decrypt of per-printer secrets,
//! keyed by a process-persistent master key at `<data_dir>/secret.key`.
//!
//! Grounded on the AES-256-GCM + base64 approach in `shipper-encrypt`, simplified
//! for this use: the key here is machine-generated and persisted, not a
//! user-supplied passphrase, so there is no PBKDF2 derivation step — just a
//! random 256-bit key created with `OsRng` on first run.

use crate::error::CodecError;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const NONCE_LEN: usize = 12;

pub struct CredentialCodec {
    cipher: Aes256Gcm,
}

impl CredentialCodec {
    /// Loads the master key from `data_dir/secret.key`, creating one with a
    /// cryptographically strong RNG if absent (§6.5).
    pub fn load_or_create(data_dir: &Path) -> Result<Self, CodecError> {
        let key_path = data_dir.join("secret.key");
        let key_bytes = if key_path.exists() {
            let encoded = fs::read_to_string(&key_path)
                .map_err(|_| CodecError::KeyUnavailable(key_path.clone()))?;
            URL_SAFE_NO_PAD
                .decode(encoded.trim())
                .map_err(|_| CodecError::KeyUnavailable(key_path.clone()))?
        } else {
            fs::create_dir_all(data_dir).map_err(|_| CodecError::KeyUnavailable(key_path.clone()))?;
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            let encoded = URL_SAFE_NO_PAD.encode(bytes);
            fs::write(&key_path, &encoded).map_err(|_| CodecError::KeyUnavailable(key_path.clone()))?;
            if let Ok(metadata) = fs::metadata(&key_path) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o600);
                let _ = fs::set_permissions(&key_path, perms);
            }
            bytes.to_vec()
        };

        if key_bytes.len() != 32 {
            return Err(CodecError::KeyUnavailable(key_path));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(CredentialCodec {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn key_path(data_dir: &Path) -> PathBuf {
        data_dir.join("secret.key")
    }

    /// `encrypt(plaintext) -> ciphertext_b64`. Format: `base64(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CodecError::DecryptFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(combined))
    }

    /// `decrypt(ciphertext_b64) -> plaintext | None`. Any failure (bad key,
    /// truncated ciphertext, tampering) surfaces as `None`; callers treat this
    /// as "credential unavailable" (§4.2) rather than propagating an error.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Option<String> {
        let combined = URL_SAFE_NO_PAD.decode(ciphertext_b64).ok()?;
        if combined.len() < NONCE_LEN {
            return None;
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self.cipher.decrypt(nonce, ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

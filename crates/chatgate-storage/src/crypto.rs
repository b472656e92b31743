use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use chatgate_common::CryptoMode;

/// Prefix marking a value produced by this cipher. Rows written before
/// encryption was introduced carry raw plaintext without it.
const CIPHERTEXT_PREFIX: &str = "v1:";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key must be at least 32 bytes, got {0}")]
    KeyTooShort(usize),
    #[error("malformed ciphertext: {0}")]
    Malformed(&'static str),
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("plaintext credential rejected in strict mode")]
    PlaintextRejected,
}

/// Symmetric cipher for provider credential blobs.
///
/// Output encoding is `v1:<base64 nonce>:<base64 ciphertext>`. Decrypt
/// behavior for inputs without the prefix follows the configured mode:
/// passthrough returns them unchanged (legacy rows), strict rejects them.
/// A prefixed value that fails AEAD is an error in both modes.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
    mode: CryptoMode,
}

impl CredentialCipher {
    pub fn new(secret_key: &[u8], mode: CryptoMode) -> Result<Self, CryptoError> {
        if secret_key.len() < 32 {
            return Err(CryptoError::KeyTooShort(secret_key.len()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&secret_key[..32]);
        Ok(Self {
            cipher: Aes256Gcm::new(&key.into()),
            mode,
        })
    }

    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(format!(
            "{CIPHERTEXT_PREFIX}{}:{}",
            BASE64.encode(nonce),
            BASE64.encode(&ciphertext)
        ))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let Some(rest) = stored.strip_prefix(CIPHERTEXT_PREFIX) else {
            return match self.mode {
                CryptoMode::Passthrough => Ok(stored.to_string()),
                CryptoMode::Strict => Err(CryptoError::PlaintextRejected),
            };
        };

        let (nonce_b64, data_b64) = rest
            .split_once(':')
            .ok_or(CryptoError::Malformed("missing nonce separator"))?;
        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|_| CryptoError::Malformed("bad nonce encoding"))?;
        if nonce_bytes.len() != 12 {
            return Err(CryptoError::Malformed("bad nonce length"));
        }
        let data = BASE64
            .decode(data_b64)
            .map_err(|_| CryptoError::Malformed("bad data encoding"))?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, data.as_ref())
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Malformed("not utf-8"))
    }
}

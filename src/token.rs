//! Encryption and decryption of per-institution aggregator access tokens.
//!
//! Tokens are stored as base64 text. When an encryption key is configured the
//! stored value is AES-256-GCM ciphertext with a random nonce prepended;
//! older rows from before the key rollout hold plain base64 tokens, so
//! decryption walks an explicit fallback chain rather than failing hard.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};

use crate::Error;

/// Length of the AES-GCM nonce in bytes.
const NONCE_LENGTH: usize = 12;

/// Length of the AES-GCM authentication tag in bytes.
const TAG_LENGTH: usize = 16;

/// Access tokens issued by the aggregator carry this prefix in every
/// environment, e.g. `access-sandbox-5a3f...`. The base64 fallback uses it to
/// tell a legacy plaintext token apart from undecryptable garbage.
const TOKEN_PREFIX: &str = "access-";

/// Which strategy in the fallback chain produced the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptStrategy {
    /// Authenticated AES-256-GCM decryption with the configured key.
    Authenticated,
    /// Plain base64 decoding of a token stored before the key rollout.
    Base64Fallback,
    /// The blob could not be interpreted; it is returned unchanged so the
    /// aggregator rejects it with a clear error instead of the decryptor
    /// crashing the sync.
    PassThrough,
}

/// The result of decrypting a stored credential blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedToken {
    /// The plaintext access token (or the raw blob for
    /// [DecryptStrategy::PassThrough]).
    pub token: String,
    /// The strategy that produced `token`.
    pub strategy: DecryptStrategy,
}

/// Encrypts and decrypts aggregator access tokens.
///
/// The key is derived by hashing an environment-supplied secret with SHA-256,
/// so any non-empty secret string yields a full-length AES-256 key.
#[derive(Clone)]
pub struct TokenCipher {
    key: Option<[u8; 32]>,
}

impl TokenCipher {
    /// Create a cipher keyed by hashing `secret` with SHA-256.
    pub fn from_secret(secret: &str) -> Self {
        let hash = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hash);

        Self { key: Some(key) }
    }

    /// Create a cipher for deployments without an encryption key.
    ///
    /// Encryption degrades to plain base64 and decryption starts at the
    /// base64 fallback step.
    pub fn new_unkeyed() -> Self {
        Self { key: None }
    }

    /// Encrypt `token` for storage.
    ///
    /// With a key configured the result is base64(nonce || ciphertext || tag)
    /// with a fresh random nonce per value. Without a key the token is stored
    /// as plain base64.
    ///
    /// # Errors
    /// Returns [Error::TokenEncryption] if the underlying AEAD rejects the
    /// input, which does not happen for well-formed keys.
    pub fn encrypt(&self, token: &str) -> Result<String, Error> {
        let Some(key) = &self.key else {
            return Ok(BASE64.encode(token.as_bytes()));
        };

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|error| Error::TokenEncryption(format!("failed to create cipher: {error}")))?;

        use rand::RngCore;
        use rand::rngs::OsRng;
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, token.as_bytes())
            .map_err(|error| Error::TokenEncryption(format!("encryption failed: {error}")))?;

        let mut blob = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(blob))
    }

    /// Decrypt a stored credential `blob` into a usable access token.
    ///
    /// The fallback chain is ordered and each step is logged:
    /// 1. Authenticated decryption with the configured key.
    /// 2. Plain base64 decoding, accepted only when the result carries the
    ///    aggregator token prefix (tokens stored before the key rollout).
    /// 3. Pass-through of the raw blob, leaving the aggregator to reject it
    ///    with a clear error downstream.
    ///
    /// This function never fails; the caller inspects
    /// [DecryptedToken::strategy] when the provenance matters.
    pub fn decrypt(&self, blob: &str) -> DecryptedToken {
        match &self.key {
            Some(key) => match try_authenticated_decrypt(key, blob) {
                Ok(token) => {
                    return DecryptedToken {
                        token,
                        strategy: DecryptStrategy::Authenticated,
                    };
                }
                Err(reason) => {
                    tracing::warn!(
                        "authenticated token decryption failed ({reason}), \
                        trying plain base64 fallback"
                    );
                }
            },
            None => {
                tracing::warn!(
                    "no token encryption key configured, trying plain base64 fallback"
                );
            }
        }

        match try_base64_decode(blob) {
            Ok(token) => {
                tracing::info!("stored token accepted via plain base64 fallback");
                return DecryptedToken {
                    token,
                    strategy: DecryptStrategy::Base64Fallback,
                };
            }
            Err(reason) => {
                tracing::warn!("plain base64 fallback failed ({reason})");
            }
        }

        tracing::warn!(
            "returning stored credential blob unchanged; aggregator calls \
            will fail with a clear error if it is not a valid token"
        );

        DecryptedToken {
            token: blob.to_owned(),
            strategy: DecryptStrategy::PassThrough,
        }
    }
}

fn try_authenticated_decrypt(key: &[u8; 32], blob: &str) -> Result<String, String> {
    let bytes = BASE64
        .decode(blob.trim())
        .map_err(|error| format!("blob is not valid base64: {error}"))?;

    if bytes.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err("ciphertext too short".to_owned());
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|error| format!("failed to create cipher: {error}"))?;

    let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LENGTH);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|error| format!("decryption failed: {error}"))?;

    String::from_utf8(plaintext).map_err(|error| format!("plaintext is not valid UTF-8: {error}"))
}

fn try_base64_decode(blob: &str) -> Result<String, String> {
    let bytes = BASE64
        .decode(blob.trim())
        .map_err(|error| format!("blob is not valid base64: {error}"))?;

    let text = String::from_utf8(bytes)
        .map_err(|error| format!("decoded blob is not valid UTF-8: {error}"))?;

    if text.starts_with(TOKEN_PREFIX) {
        Ok(text)
    } else {
        Err(format!(
            "decoded blob does not start with \"{TOKEN_PREFIX}\""
        ))
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("key", &self.key.map(|_| "[REDACTED]"))
            .finish()
    }
}

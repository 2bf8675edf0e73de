//! HMAC-SHA256 authenticated, optionally AES-256-GCM encrypted values.
//!
//! Wire format (base64url, no padding) of `"{unix_secs}|{body}|{mac}"` where
//! `body` is base64url of the (encrypted) payload and `mac` is the raw HMAC of
//! `"{name}|{unix_secs}|{body}"`. The cookie name is bound into the MAC and
//! used as associated data for the cipher, so a value cannot be replayed
//! under another name.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::Codec;
use crate::error::CodecError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const DEFAULT_MAX_AGE: i64 = 86400 * 30;
const DEFAULT_MAX_LENGTH: usize = 4096;
const BLOCK_KEY_INFO: &[u8] = b"docsession-block-key";

/// Key material for one codec: an authentication key and an optional
/// encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub hash_key: Vec<u8>,
    pub block_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyPair([REDACTED])")
    }
}

impl KeyPair {
    pub fn new(hash_key: Vec<u8>, block_key: Option<Vec<u8>>) -> Self {
        Self {
            hash_key,
            block_key,
        }
    }

    /// Fresh random 32-byte hash and block keys.
    pub fn generate() -> Self {
        let mut hash_key = vec![0u8; 32];
        let mut block_key = vec![0u8; 32];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut hash_key);
        rng.fill_bytes(&mut block_key);
        Self::new(hash_key, Some(block_key))
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        if self.hash_key.is_empty() {
            return Err(CodecError::InvalidKey("hash key is not set".into()));
        }
        if let Some(block) = &self.block_key {
            if block.len() < 16 {
                return Err(CodecError::InvalidKey(format!(
                    "block key must be at least 16 bytes, got {}",
                    block.len()
                )));
            }
        }
        Ok(())
    }
}

/// Derive the AES-256 key from the configured block key.
fn derive_block_key(block_key: &[u8]) -> Result<[u8; 32], CodecError> {
    let hk = Hkdf::<Sha256>::new(None, block_key);
    let mut okm = [0u8; 32];
    hk.expand(BLOCK_KEY_INFO, &mut okm)
        .map_err(|e| CodecError::InvalidKey(e.to_string()))?;
    Ok(okm)
}

pub struct SecureCodec {
    hash_key: Vec<u8>,
    cipher: Option<Aes256Gcm>,
    max_age: i64,
    max_length: usize,
}

impl std::fmt::Debug for SecureCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCodec")
            .field("encrypted", &self.cipher.is_some())
            .field("max_age", &self.max_age)
            .field("max_length", &self.max_length)
            .finish()
    }
}

impl SecureCodec {
    pub fn new(pair: &KeyPair) -> Result<Self, CodecError> {
        pair.validate()?;
        if pair.hash_key.len() < 32 {
            tracing::warn!(
                "Hash key is {} bytes; 32 or more is recommended",
                pair.hash_key.len()
            );
        }

        let cipher = match &pair.block_key {
            Some(block) => {
                let key = derive_block_key(block)?;
                Some(Aes256Gcm::new((&key).into()))
            }
            None => None,
        };

        Ok(Self {
            hash_key: pair.hash_key.clone(),
            cipher,
            max_age: DEFAULT_MAX_AGE,
            max_length: DEFAULT_MAX_LENGTH,
        })
    }

    /// Maximum encoded length; 0 disables the check.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    fn mac(&self, name: &str, timestamp: &[u8], body: &[u8]) -> Result<HmacSha256, CodecError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hash_key)
            .map_err(|e| CodecError::InvalidKey(e.to_string()))?;
        mac.update(name.as_bytes());
        mac.update(b"|");
        mac.update(timestamp);
        mac.update(b"|");
        mac.update(body);
        Ok(mac)
    }

    fn encrypt(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| CodecError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, name: &str, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let Some(cipher) = &self.cipher else {
            return Ok(data.to_vec());
        };
        if data.len() < NONCE_LEN {
            return Err(CodecError::Decryption);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| CodecError::Decryption)
    }
}

impl Codec for SecureCodec {
    fn encode(&self, name: &str, plaintext: &[u8]) -> Result<String, CodecError> {
        let body = URL_SAFE_NO_PAD.encode(self.encrypt(name, plaintext)?);
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let tag = self
            .mac(name, timestamp.as_bytes(), body.as_bytes())?
            .finalize()
            .into_bytes();

        let mut raw = Vec::with_capacity(timestamp.len() + body.len() + tag.len() + 2);
        raw.extend_from_slice(timestamp.as_bytes());
        raw.push(b'|');
        raw.extend_from_slice(body.as_bytes());
        raw.push(b'|');
        raw.extend_from_slice(&tag);

        let encoded = URL_SAFE_NO_PAD.encode(raw);
        if self.max_length != 0 && encoded.len() > self.max_length {
            return Err(CodecError::TooLong(encoded.len()));
        }
        Ok(encoded)
    }

    fn decode(&self, name: &str, value: &str) -> Result<Vec<u8>, CodecError> {
        if self.max_length != 0 && value.len() > self.max_length {
            return Err(CodecError::TooLong(value.len()));
        }
        let raw = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|_| CodecError::Base64)?;

        let mut parts = raw.splitn(3, |b| *b == b'|');
        let (Some(timestamp), Some(body), Some(tag)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CodecError::Format);
        };

        self.mac(name, timestamp, body)?
            .verify_slice(tag)
            .map_err(|_| CodecError::InvalidMac)?;

        let issued: i64 = std::str::from_utf8(timestamp)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(CodecError::Format)?;
        if self.max_age > 0 && issued < chrono::Utc::now().timestamp() - self.max_age {
            return Err(CodecError::Expired);
        }

        let data = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| CodecError::Base64)?;
        self.decrypt(name, &data)
    }

    fn set_max_age(&mut self, secs: i64) {
        self.max_age = secs;
    }

    fn set_max_length(&mut self, len: usize) {
        self.max_length = len;
    }
}

pub mod secure;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

pub use secure::{KeyPair, SecureCodec};

/// An authenticate + encrypt capability for named values.
pub trait Codec: Send + Sync {
    fn encode(&self, name: &str, plaintext: &[u8]) -> Result<String, CodecError>;

    fn decode(&self, name: &str, value: &str) -> Result<Vec<u8>, CodecError>;

    /// Maximum accepted age of an encoded value in seconds; 0 disables the check.
    fn set_max_age(&mut self, secs: i64);

    /// Maximum accepted length of an encoded value; 0 disables the check.
    fn set_max_length(&mut self, len: usize);
}

/// Ordered codecs supporting key rotation.
///
/// Encoding uses the first codec that succeeds (by convention the newest
/// key); decoding tries every codec in order.
pub struct CodecChain {
    codecs: Vec<Box<dyn Codec>>,
}

impl std::fmt::Debug for CodecChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecChain")
            .field("codecs", &self.codecs.len())
            .finish()
    }
}

impl CodecChain {
    pub fn new(codecs: Vec<Box<dyn Codec>>) -> Self {
        Self { codecs }
    }

    /// One [`SecureCodec`] per key pair, newest first.
    pub fn from_pairs(pairs: &[KeyPair]) -> Result<Self, CodecError> {
        if pairs.is_empty() {
            return Err(CodecError::NoCodecs);
        }
        let codecs = pairs
            .iter()
            .map(|pair| SecureCodec::new(pair).map(|c| Box::new(c) as Box<dyn Codec>))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(codecs))
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    pub fn set_max_age(&mut self, secs: i64) {
        for codec in &mut self.codecs {
            codec.set_max_age(secs);
        }
    }

    pub fn set_max_length(&mut self, len: usize) {
        for codec in &mut self.codecs {
            codec.set_max_length(len);
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<String, CodecError> {
        if self.codecs.is_empty() {
            return Err(CodecError::NoCodecs);
        }
        let plaintext = serde_json::to_vec(value).map_err(CodecError::Serialize)?;

        let mut errors = Vec::new();
        for codec in &self.codecs {
            match codec.encode(name, &plaintext) {
                Ok(encoded) => return Ok(encoded),
                Err(e) => errors.push(e),
            }
        }
        Err(collapse(errors))
    }

    pub fn decode<T: DeserializeOwned>(&self, name: &str, value: &str) -> Result<T, CodecError> {
        if self.codecs.is_empty() {
            return Err(CodecError::NoCodecs);
        }

        let mut errors = Vec::new();
        for codec in &self.codecs {
            let decoded = codec.decode(name, value).and_then(|plaintext| {
                serde_json::from_slice(&plaintext).map_err(CodecError::Deserialize)
            });
            match decoded {
                Ok(v) => return Ok(v),
                Err(e) => errors.push(e),
            }
        }
        Err(collapse(errors))
    }
}

fn collapse(mut errors: Vec<CodecError>) -> CodecError {
    if errors.len() == 1 {
        errors.remove(0)
    } else {
        CodecError::Multi(errors)
    }
}

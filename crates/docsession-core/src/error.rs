/// Core error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session id")]
    InvalidId,

    #[error("invalid session timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("session not found")]
    NotFound,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// True for load results that mean "no record for this id".
    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::NotFound)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("no codecs configured")]
    NoCodecs,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("failed to serialize value: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize value: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("value is not valid base64")]
    Base64,

    #[error("value has an invalid format")]
    Format,

    #[error("the value is not valid: signature mismatch")]
    InvalidMac,

    #[error("timestamp is too old")]
    Expired,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("encoded value is too long ({0} bytes)")]
    TooLong(usize),

    /// Every codec in a chain rejected the value; errors are in chain order.
    #[error("all codecs rejected the value: {}", join_errors(.0))]
    Multi(Vec<CodecError>),
}

fn join_errors(errors: &[CodecError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("{0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DatabaseError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        DatabaseError::Backend(Box::new(err))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no key pairs configured")]
    NoKeys,
}

pub type Result<T> = std::result::Result<T, SessionError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MurmurError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid handle: {0}")]
    Handle(#[from] HandleError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Local, recoverable failures: the affected message is marked unreadable and
/// never retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Entropy source unavailable")]
    EntropyUnavailable,

    #[error("Key encoding error: {0}")]
    Encoding(String),

    #[error("Out-of-order message: expected #{expected}, got #{got}")]
    OutOfOrder { expected: u32, got: u32 },
}

/// A broken session or key-agreement invariant. Fatal for the affected
/// channel's session only; recovery is a fresh handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing key material: {0}")]
    MissingKeyMaterial(&'static str),

    #[error("Signed pre-key signature does not verify")]
    BadPreKeySignature,

    #[error("Unknown one-time pre-key {0}")]
    UnknownOneTimePreKey(u32),

    #[error("Unsupported schema version {0}")]
    UnsupportedSchema(u8),

    #[error("Corrupt session snapshot: {0}")]
    CorruptSnapshot(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("expected {expected} characters, got {got}")]
    Length { expected: usize, got: usize },

    #[error("non-alphanumeric character {0:?}")]
    Character(char),
}

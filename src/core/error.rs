// Error handling for the signal store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported file type: {extension:?} (supported: {supported:?})")]
    UnsupportedFormat {
        extension: String,
        supported: Vec<String>,
    },

    #[error("Failed to load {path}: {reason}")]
    FileLoad { path: String, reason: String },

    #[error("File not loaded: {0}")]
    FileNotLoaded(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Unknown detection method {name:?}, available: {available:?}")]
    UnknownStrategy { name: String, available: Vec<String> },

    #[error("Peak detection with {method:?} failed: {reason}")]
    DetectionFailure { method: String, reason: String },

    #[error("Unsupported wavelet {0:?}")]
    UnsupportedWavelet(String),

    #[error("Invalid parameter {name:?}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Comment {0} not found")]
    CommentNotFound(u32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Signal store lock poisoned")]
    LockPoisoned,

    #[error("Invalid magic bytes: expected {expected:?}, got {got:?}")]
    InvalidMagic { expected: Vec<u8>, got: Vec<u8> },

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported compression type: {0}")]
    UnsupportedCompression(u8),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl StoreError {
    pub(crate) fn invalid_param(name: &str, reason: impl Into<String>) -> Self {
        StoreError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

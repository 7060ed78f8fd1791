//! Typed error enums at component seams.
//!
//! Application glue (`main.rs`, config loading, task orchestration) uses
//! `anyhow::Result` with context, matching the teacher's `config.rs`. Components
//! that callers need to match on return one of the enums below instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error persisting {document}: {source}")]
    Io {
        document: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize/deserialize {document}: {source}")]
    Serde {
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("lock acquisition for {resource} timed out after {millis}ms")]
    LockTimeout { resource: &'static str, millis: u64 },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to read or create master key at {0}")]
    KeyUnavailable(std::path::PathBuf),
    #[error("ciphertext is not valid base64")]
    InvalidEncoding,
    #[error("decryption failed (bad key, truncated ciphertext, or tampering)")]
    DecryptFailed,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("operation timed out")]
    Timeout,
    #[error("ftps transfer failed: {0}")]
    Ftps(String),
}

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("a preset named '{0}' already exists")]
    DuplicateName(String),
    #[error("no preset with id '{0}'")]
    NotFound(String),
    #[error("file '{0}' does not have a supported G-code/3mf extension")]
    UnsupportedExtension(String),
    #[error("uploaded preset file is not valid UTF-8")]
    InvalidEncoding,
}

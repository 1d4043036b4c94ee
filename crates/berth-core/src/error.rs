//! Error taxonomy for the Berth hub

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{SessionId, WorkerId};

/// Top-level error type for the hub
#[derive(Error, Debug)]
pub enum HubError {
    /// Session lifecycle error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Worker management error
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// SSH credential validation error
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// Process spawn/backend error
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence error
    #[error("Repository error: {0}")]
    Repo(#[from] RepoError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Unknown session id
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// Continue/admit attempted on a running session
    #[error("Session already active: {0}")]
    AlreadyActive(SessionId),

    /// Input/resize/kill attempted on a non-running session
    #[error("Session not active: {0}")]
    NotActive(SessionId),

    /// Delete attempted on a running session
    #[error("Session is active and cannot be deleted: {0}")]
    DeleteActive(SessionId),

    /// Working directory could not be created
    #[error("Failed to create working directory {path}: {reason}")]
    DirectoryCreateFailed { path: PathBuf, reason: String },
}

/// Worker management errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Unknown worker id
    #[error("Worker not found: {0}")]
    NotFound(WorkerId),

    /// No live tunnel for a remote worker
    #[error("Worker not connected: {0}")]
    NotConnected(WorkerId),

    /// Delete/SSH-edit rejected while sessions are active on the worker
    #[error("Worker {0} has active sessions")]
    HasActiveSessions(WorkerId),

    /// The singleton local worker cannot be removed
    #[error("The local worker cannot be deleted")]
    LocalImmutable,

    /// Tunnel-level failure (connect, auth, channel)
    #[error("Tunnel error for worker {worker}: {reason}")]
    Tunnel { worker: WorkerId, reason: String },
}

/// SSH private key validation errors.
///
/// Interactive passphrase prompts are unsupported; the hub runs headless,
/// so encrypted keys are rejected outright rather than prompted for.
#[derive(Error, Debug)]
pub enum KeyError {
    /// Key file does not exist
    #[error("SSH key not found at {0}")]
    NotFound(PathBuf),

    /// Key file exists but could not be read
    #[error("SSH key at {path} is unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    /// File content is not a private key
    #[error("File at {0} is not a private key")]
    NotAPrivateKey(PathBuf),

    /// Key is encrypted (legacy PEM, PKCS#8 or OpenSSH with a KDF)
    #[error("SSH key at {0} is passphrase-protected; provide an unencrypted key")]
    Encrypted(PathBuf),
}

/// Process spawn and backend errors
#[derive(Error, Debug)]
pub enum SpawnError {
    /// PTY allocation or exec failed
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// Remote channel could not be opened
    #[error("Failed to open remote channel: {0}")]
    ChannelOpenFailed(String),

    /// Non-zero exit or SSH-level error
    #[error("Process exited abnormally (code {0})")]
    AbnormalExit(i32),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Persistence-layer errors
#[derive(Error, Debug)]
pub enum RepoError {
    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypted_key_message_names_passphrase() {
        let err = KeyError::Encrypted(PathBuf::from("/keys/id_rsa"));
        assert!(err.to_string().contains("passphrase-protected"));
    }

    #[test]
    fn test_session_error_rolls_up() {
        let err: HubError = SessionError::NotFound(SessionId::from("s1")).into();
        assert!(matches!(err, HubError::Session(SessionError::NotFound(_))));
    }
}

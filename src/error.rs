//! Error types for mailfts.
//!
//! All fallible operations return [`MailFtsError`]. The variants follow the
//! way callers are expected to react: lock timeouts are recoverable, stale
//! indexes are healed by the caller, helper protocol failures only cost the
//! current helper connection.
//!
//! # Examples
//!
//! ```
//! use mailfts::error::{MailFtsError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(MailFtsError::engine("fragment 0 is not writable"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type for mailfts operations.
#[derive(Error, Debug)]
pub enum MailFtsError {
    /// I/O errors (file operations, pipes, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The lock could not be obtained before the deadline.
    #[error("Timed out waiting for lock on {}", .0.display())]
    LockTimeout(PathBuf),

    /// The same owner token tried to take a lock it already holds.
    #[error("Lock contention: {0}")]
    LockContention(String),

    /// The index set is stale or unreadable and has to be rebuilt.
    #[error("Index corrupt: {0}")]
    IndexCorrupt(String),

    /// The index set was written by a newer version and is left untouched.
    #[error("Index written by a newer version: {0}")]
    IndexForeign(String),

    /// Bad handshake, malformed or missing tagged reply, or reply timeout.
    #[error("Indexer protocol error: {0}")]
    IndexerProtocol(String),

    /// The helper process could not be spawned or its pipes failed.
    #[error("Indexer process error: {0}")]
    IndexerProcess(String),

    /// Errors reported by the search engine.
    #[error("Engine error: {0}")]
    Engine(String),

    /// A uid arrived below one that was already flushed.
    #[error("Uid {uid} arrived after uid {last}")]
    UidOrder { uid: u32, last: u32 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with MailFtsError.
pub type Result<T> = std::result::Result<T, MailFtsError>;

impl From<bincode::Error> for MailFtsError {
    fn from(err: bincode::Error) -> Self {
        MailFtsError::Serialization(err.to_string())
    }
}

impl MailFtsError {
    /// Create a new engine error.
    pub fn engine<S: Into<String>>(msg: S) -> Self {
        MailFtsError::Engine(msg.into())
    }

    /// Create a new corrupt-index error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        MailFtsError::IndexCorrupt(msg.into())
    }

    /// Create a new helper protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        MailFtsError::IndexerProtocol(msg.into())
    }

    /// Create a new helper process error.
    pub fn process<S: Into<String>>(msg: S) -> Self {
        MailFtsError::IndexerProcess(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MailFtsError::Config(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        MailFtsError::InvalidOperation(msg.into())
    }

    /// Whether the caller may simply retry the operation later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MailFtsError::LockTimeout(_) | MailFtsError::IndexerProtocol(_)
        )
    }

    /// Whether the index set should be deleted and recreated.
    pub fn needs_rebuild(&self) -> bool {
        matches!(self, MailFtsError::IndexCorrupt(_))
    }
}

//! Error types and result handling for pg-cdc-backup.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_cdc_backup::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use std::process::ExitStatus;

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// The main error type for pg-cdc-backup operations.
///
/// Covers the whole failure taxonomy: connection loss, slot problems,
/// malformed stream messages, and backup or dump failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file or environment overrides.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when writing checkpoints or raw artifacts.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from checkpoint or artifact file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// The replication slot exists but was created with another decoding plugin.
    #[error("Replication slot '{slot}' uses plugin '{actual}', expected '{expected}'")]
    SlotMismatch {
        /// Slot name
        slot: String,
        /// Configured decoding plugin
        expected: String,
        /// Plugin the server reports for the slot
        actual: String,
    },

    /// The server cancelled the stream query or disconnected administratively.
    #[error("Replication stream cancelled: {message}")]
    StreamCancelled {
        /// Server message
        message: String,
    },

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// An external tool (pg_dump, pg_recvlogical) exited unsuccessfully.
    #[error("{program} exited with {status}")]
    Subprocess {
        /// Program that was run
        program: String,
        /// Exit status reported by the OS
        status: ExitStatus,
    },
}

impl Error {
    /// Returns `true` when the server ended the stream on purpose: the query
    /// was cancelled or the backend was terminated by an administrator.
    pub fn is_stream_cancelled(&self) -> bool {
        match self {
            Error::StreamCancelled { .. } => true,
            Error::Postgres(e) => e.code().map(is_cancellation_code).unwrap_or(false),
            _ => false,
        }
    }

    /// Returns `true` when the connection itself is gone and no further
    /// messages can be read from it.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Postgres(e) => {
                e.is_closed()
                    || e.code()
                        .map(|code| code.code().starts_with("08"))
                        .unwrap_or(false)
            }
            _ => false,
        }
    }
}

pub(crate) fn is_cancellation_code(code: &SqlState) -> bool {
    *code == SqlState::QUERY_CANCELED
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
}

/// A convenient Result type alias for pg-cdc-backup operations.
///
/// This is equivalent to `std::result::Result<T, pg_cdc_backup::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

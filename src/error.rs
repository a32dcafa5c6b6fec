//! Error types for Magnetite
//!
//! This module defines all error types used throughout the codebase.
//! Uses `thiserror` for ergonomic error definitions.

use std::io;
use thiserror::Error;

/// Main error type for Magnetite operations
#[derive(Error, Debug)]
pub enum MagnetiteError {
    /// Malformed RESP framing
    #[error("Protocol error: {0}")]
    InvalidFormat(String),

    /// A RESP length line did not parse as a number
    #[error("Protocol error: invalid length")]
    InvalidLength,

    /// Bulk string length is negative or exceeds the protocol limit
    #[error("Protocol error: bulk string length {0} out of range")]
    BulkStringTooLarge(i64),

    /// A command array with zero elements
    #[error("Protocol error: empty command")]
    EmptyCommand,

    /// Unknown or unimplemented command
    #[error("ERR unknown command")]
    UnknownCommand(String),

    /// Command syntax error
    #[error("ERR syntax error")]
    Syntax,

    /// Operation on wrong data type
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// EX/PX argument did not parse as an integer
    #[error("ERR invalid {0} time")]
    InvalidExpiryTime(&'static str),

    /// RDB snapshot operation error
    #[error("RDB error: {0}")]
    Rdb(String),

    /// Replication link error
    #[error("Replication error: {0}")]
    Replication(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection was closed mid-frame
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias for Magnetite operations
pub type Result<T> = std::result::Result<T, MagnetiteError>;

impl MagnetiteError {
    /// Returns true if this error should close the connection
    #[cold]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MagnetiteError::Io(_) | MagnetiteError::ConnectionClosed | MagnetiteError::Replication(_)
        )
    }

    /// Convert error to the RESP error line sent back to a client
    #[cold]
    pub fn to_resp_error(&self) -> String {
        match self {
            MagnetiteError::UnknownCommand(_) => "ERR unknown command".to_string(),
            MagnetiteError::Syntax => "ERR syntax error".to_string(),
            MagnetiteError::WrongType => {
                "WRONGTYPE Operation against a key holding the wrong kind of value".to_string()
            }
            MagnetiteError::InvalidExpiryTime(unit) => format!("ERR invalid {unit} time"),
            _ => format!("ERR {self}"),
        }
    }
}

//! Error types for the fleetgate ingestion backend

use std::{error::Error as StdError, fmt};

/// Main error type for fleetgate
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Configuration {
        /// Error message
        message: String,
    },

    /// Database error
    Database(String),

    /// IMEI failed range or Luhn validation
    InvalidImei {
        /// The rejected IMEI value
        imei: u64,
        /// Why it was rejected
        reason: String,
    },

    /// Firmware image could not be loaded or verified
    Firmware {
        /// Error message
        message: String,
    },

    /// A frame could not be decoded
    Codec {
        /// Source protocol name
        protocol: &'static str,
        /// Decode failure description
        message: String,
    },

    /// Session referenced by a packet does not exist
    UnknownSession {
        /// The session id the device presented
        session_id: u32,
    },

    /// Not found error
    NotFound {
        /// Resource that was not found
        resource: String,
    },

    /// Notification gateway failure
    Notification(String),

    /// Serialization error
    Serialization(serde_json::Error),

    /// Other error
    Other(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Configuration { message } => write!(f, "Configuration error: {message}"),
            Self::Database(msg) => write!(f, "Database error: {msg}"),
            Self::InvalidImei { imei, reason } => write!(f, "Invalid IMEI {imei}: {reason}"),
            Self::Firmware { message } => write!(f, "Firmware error: {message}"),
            Self::Codec { protocol, message } => {
                write!(f, "Malformed {protocol} frame: {message}")
            }
            Self::UnknownSession { session_id } => {
                write!(f, "Unknown session id {session_id:#010x}")
            }
            Self::NotFound { resource } => write!(f, "Resource not found: {resource}"),
            Self::Notification(msg) => write!(f, "Notification failed: {msg}"),
            Self::Serialization(err) => write!(f, "Serialization error: {err}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

// From implementations for automatic conversions
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err)
    }
}

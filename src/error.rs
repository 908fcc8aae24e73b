//! Error types for the acceptance path
//!
//! This module provides the error kinds the dispatcher distinguishes when
//! deciding how to reject a connection, making it easier to diagnose and
//! handle different failure scenarios.

use std::fmt;

/// Errors that can occur while accepting a device or client connection
#[derive(Debug)]
pub enum ProtocolError {
    /// The read deadline expired before a full AT command arrived
    Timeout,

    /// A line was received that is not a recognized AT command
    Parse(String),

    /// Bad token format or auth token mismatch
    Auth(String),

    /// The target device is not registered
    NotFound(String),

    /// The target device is already in a session
    Busy(String),

    /// I/O error on the underlying connection
    Io(std::io::Error),
}

impl ProtocolError {
    /// True if this is the distinct timeout kind (as opposed to an I/O error)
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout waiting for AT command"),
            Self::Parse(line) => write!(f, "unknown command: {}", line),
            Self::Auth(reason) => write!(f, "authentication failed: {}", reason),
            Self::NotFound(device_id) => write!(f, "device '{}' not found", device_id),
            Self::Busy(device_id) => write!(f, "device '{}' is busy", device_id),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

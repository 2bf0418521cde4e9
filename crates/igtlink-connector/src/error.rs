//! Error types for connector sessions.
//!
//! Transport failures inside `periodic_process` never surface here; they
//! drive state transitions instead. These errors are contract violations
//! reported to the caller.

use igtlink_wire::{CodecError, WireError};

/// Errors returned by connector and hub operations
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message content could not be encoded or decoded
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Framing error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation requires a connected peer
    #[error("Connector is not connected")]
    NotConnected,

    /// `start` called before a server or client role was set
    #[error("Connector has no server or client role")]
    NoRole,

    /// Query ID already in use by an active command
    #[error("Query ID {0} is already active")]
    DuplicateQueryId(u32),

    /// No pending peer command with this query ID
    #[error("Unknown command: {0}")]
    UnknownCommand(u32),

    /// Response attempted after the peer command timed out
    #[error("Command {0} expired")]
    CommandExpired(u32),

    /// Command is malformed or used in the wrong direction
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Device not found on this connector
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device has nothing to send yet
    #[error("Device has no content: {0}")]
    NoContent(String),

    /// Content kind does not match the device kind
    #[error("Content for {content} cannot be stored in {device}")]
    ContentMismatch { device: String, content: String },

    /// Connector not found in the hub
    #[error("Connector not found: {0}")]
    ConnectorNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

use std::io;

use thiserror::Error;

/// Failure of an SDO operation.
#[derive(Debug, Error)]
pub enum SdoError {
    /// The remote node (or this client) aborted the transfer.
    #[error("SDO abort 0x{code:08X}: {reason}")]
    ProtocolAbort { code: u32, reason: &'static str },

    /// No qualifying response arrived before the deadline.
    #[error("SDO protocol timed out on 0x{index:04X}:{sub_index:02X}")]
    Timeout { index: u16, sub_index: u8 },

    /// The target could not be resolved locally; nothing was sent.
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// Another transfer is still in flight on this client.
    #[error("SDO transfer already in progress for node {node_id}")]
    Busy { node_id: u8 },

    #[error("Value error: {0}")]
    Value(String),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// The indication source went away while a transfer was waiting.
    #[error("Indication channel closed")]
    Disconnected,
}

/// Local resolution failures, reported before any frame is sent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("'{0}' not a data object")]
    NotFound(String),

    #[error("'{target}' name is not unique ({count} objects match)")]
    Ambiguous { target: String, count: usize },

    #[error("0x{index:04X} has no sub index {sub_index}")]
    NoSuchSubindex { index: u16, sub_index: u8 },
}

/// Failure loading an object dictionary description.
#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("Failed to parse EDS file: {0}")]
    Parse(String),

    #[error("Invalid EDS entry [{section}]: {message}")]
    InvalidEntry { section: String, message: String },
}

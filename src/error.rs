//! Error types for the iSCSI target engine

use thiserror::Error;

/// iSCSI target errors
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("{kind} digest mismatch: received 0x{received:08x}, computed 0x{computed:08x}")]
    Digest {
        kind: &'static str,
        received: u32,
        computed: u32,
    },

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection closed")]
    ConnectionClosed,

    /// A Reject PDU carrying `reason` was flushed and the connection must fail
    #[error("Rejected PDU (reason 0x{reason:02x}), failing connection")]
    Rejected { reason: u8 },
}

impl IscsiError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        IscsiError::Protocol(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        IscsiError::Session(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        IscsiError::Config(msg.into())
    }
}

/// Result type for engine operations
pub type IscsiResult<T> = Result<T, IscsiError>;

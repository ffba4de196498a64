//! Error types for the legacy DFU engine.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{DfuState, OpCode};

/// Firmware archive could not be turned into a [`FirmwarePackage`](crate::package::FirmwarePackage).
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a firmware archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("unrecognized archive layout: {0}")]
    UnrecognizedLayout(String),

    #[error("archive entry '{0}' is missing")]
    MissingEntry(String),

    #[error("archive entry '{0}' is empty")]
    EmptyEntry(String),

    #[error("application image of {0} bytes does not fit a 32-bit size record")]
    ImageTooLarge(usize),
}

/// Control-point conversation went wrong.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("response for {actual:#04x} while waiting for {expected:?}")]
    WrongOpcode { expected: OpCode, actual: u8 },

    #[error("{opcode:?} failed with status {status:#04x}")]
    NonSuccessStatus { opcode: OpCode, status: u8 },

    #[error("no response to {opcode:?} within {timeout:?}")]
    Timeout { opcode: OpCode, timeout: Duration },

    #[error("{requested:?} written while {pending:?} is still outstanding")]
    CommandOverlap { pending: OpCode, requested: OpCode },
}

/// BLE link level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("peripheral disconnected")]
    Disconnected,

    #[error("write failed: {0}")]
    Write(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("characteristic {0} not found")]
    MissingCharacteristic(uuid::Uuid),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Discovery gave up.
#[derive(Debug, Error)]
#[error("could not locate {what}")]
pub struct NotFoundError {
    pub what: String,
}

impl NotFoundError {
    pub fn new(what: impl Into<String>) -> Self {
        Self { what: what.into() }
    }
}

/// Anything that ends a single update attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Attempt failure together with the state the session was in.
#[derive(Debug, Error)]
#[error("{source} (state: {state})")]
pub struct SessionError {
    pub state: DfuState,
    #[source]
    pub source: AttemptError,
}

impl SessionError {
    pub fn is_transport(&self) -> bool {
        matches!(self.source, AttemptError::Transport(_))
    }
}

/// Terminal error of a whole update.
#[derive(Debug, Error)]
pub enum DfuError {
    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("update failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: SessionError,
    },

    #[error("update cancelled (state: {state})")]
    Cancelled { state: DfuState },
}

impl DfuError {
    /// Last protocol state reached before the update gave up.
    pub fn state(&self) -> Option<DfuState> {
        match self {
            DfuError::RetriesExhausted { source, .. } => Some(source.state),
            DfuError::Cancelled { state } => Some(*state),
            _ => None,
        }
    }

    /// Short code for support tickets.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Package(_) => "DFU-040",
            DfuError::NotFound(_) => "DFU-050",
            DfuError::RetriesExhausted { source, .. } => match source.source {
                AttemptError::Protocol(ProtocolError::Timeout { .. }) => "DFU-021",
                AttemptError::Protocol(_) => "DFU-030",
                AttemptError::Transport(_) => "DFU-051",
            },
            DfuError::Cancelled { .. } => "DFU-099",
        }
    }
}

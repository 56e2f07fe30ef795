//! Error types for the MIDI directory and decoder.

use std::fmt;

use thiserror::Error;

use crate::directory::Role;

/// Why a byte was rejected by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// Data byte arrived while no message was being collected
    DataOutsideMessage,
    /// End of Exclusive (0xF7) arrived outside a SysEx message
    UnexpectedEndOfExclusive,
    /// Status byte has no entry in the data-length table (0xF4, 0xF5)
    UndefinedStatus,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::DataOutsideMessage => write!(f, "data received outside of a message"),
            MalformedReason::UnexpectedEndOfExclusive => {
                write!(f, "end of exclusive marker outside SysEx message")
            }
            MalformedReason::UndefinedStatus => write!(f, "undefined status byte"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed MIDI stream: {reason} (byte 0x{byte:02X} at offset {offset})")]
    MalformedStream {
        byte: u8,
        offset: usize,
        reason: MalformedReason,
    },

    #[error("native MIDI transport unavailable: {0}")]
    NativeUnavailable(String),

    #[error("listener '{listener}' failed: {message}")]
    ListenerFailure { listener: String, message: String },

    #[error("endpoint {unique_id} vanished from the system")]
    VanishedDeviceTeardown { unique_id: u32 },

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(u32),

    #[error("endpoint {unique_id} is not a {expected}")]
    WrongRole { unique_id: u32, expected: Role },

    #[error("endpoint {0} is not open")]
    EndpointClosed(u32),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Build a listener failure from any displayable error
    pub fn listener(listener: impl Into<String>, err: impl fmt::Display) -> Self {
        Error::ListenerFailure {
            listener: listener.into(),
            message: err.to_string(),
        }
    }

    /// True for decoder errors that leave the decoder usable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedStream { .. }
                | Error::ListenerFailure { .. }
                | Error::VanishedDeviceTeardown { .. }
        )
    }
}

impl From<midir::InitError> for Error {
    fn from(e: midir::InitError) -> Self {
        Error::NativeUnavailable(e.to_string())
    }
}

impl From<midir::ConnectError<midir::MidiInput>> for Error {
    fn from(e: midir::ConnectError<midir::MidiInput>) -> Self {
        Error::NativeUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

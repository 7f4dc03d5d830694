use std::time::Duration;

use fwbridge_frame::FrameError;
use fwbridge_transport::TransportError;

/// A GDB/MI line that does not follow the record grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at offset {cursor} in {text:?}")]
pub struct ParseError {
    /// What the parser expected.
    pub message: String,
    /// The offending line.
    pub text: String,
    /// Byte offset where parsing stopped.
    pub cursor: usize,
}

/// Errors raised by the protocol clients and codecs.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An I/O error outside the framed stream (thread spawn, pipes).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A binary RPC message carried an opcode missing from the catalog.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// A binary RPC payload ended before a declared field.
    #[error("out of data decoding field '{field}' of opcode 0x{opcode:02x}")]
    OutOfData { field: &'static str, opcode: u8 },

    /// A field value cannot be represented on the wire.
    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// A GDB/MI line failed to parse.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A reply arrived but not one the command accepts.
    #[error("unexpected reply: expected {expected}, received {received}")]
    UnexpectedReply { expected: String, received: String },

    /// No reply arrived within the deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The connection failed or was stopped while the request was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// The binary RPC peer answered with an error code.
    #[error("remote error {code} ({})", remote_error_label(.code))]
    Remote { code: u8 },

    /// The debugger reported an error (`^error` or `Exx`).
    #[error("debugger error: {0}")]
    Gdb(String),

    /// The peer does not support the request.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ProtoError {
    pub(crate) fn unexpected(expected: impl Into<String>, received: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            expected: expected.into(),
            received: received.into(),
        }
    }

    /// Whether the error means the connection is gone for good.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::Transport(_)
                | Self::Io(_)
                | Self::Frame(FrameError::ConnectionClosed)
                | Self::Frame(FrameError::Stopped)
                | Self::Frame(FrameError::Io(_))
        )
    }
}

fn remote_error_label(code: &u8) -> &'static str {
    crate::rpc::types::remote_error_name(*code)
}

pub type Result<T> = std::result::Result<T, ProtoError>;

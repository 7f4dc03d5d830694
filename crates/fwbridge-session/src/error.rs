use fwbridge_frame::FrameError;
use fwbridge_proto::ProtoError;
use fwbridge_transport::TransportError;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Protocol client error.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error outside a framed stream (files, thread spawn).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend does not provide the capability.
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    /// Register name unknown to the backend.
    #[error("unknown register '{0}'")]
    UnknownRegister(String),

    /// A breakpoint is already set at the address.
    #[error("breakpoint already set at 0x{0:08x}")]
    BreakpointExists(u64),

    /// No breakpoint is set at the address.
    #[error("no breakpoint at 0x{0:08x}")]
    NoSuchBreakpoint(u64),

    /// Nothing was delivered before the wait deadline.
    #[error("wait timed out")]
    WaitTimeout,

    /// The event bus shut down.
    #[error("event bus closed")]
    BusClosed,

    /// Invalid bridge configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

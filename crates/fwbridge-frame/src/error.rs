/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// An escape byte was followed by an unknown continuation byte.
    #[error("invalid escape sequence 0xaa 0x{0:02x}")]
    InvalidEscape(u8),

    /// A frame ended with a lone escape byte.
    #[error("frame ends with an unterminated escape byte")]
    TruncatedEscape,

    /// The received checksum does not match the computed one.
    #[error("checksum mismatch (received 0x{received:02x}, computed 0x{computed:02x})")]
    ChecksumMismatch { received: u8, computed: u8 },

    /// A non-hex character appeared where a checksum digit was expected.
    #[error("invalid checksum digit 0x{0:02x}")]
    InvalidChecksumDigit(u8),

    /// A frame carried too few bytes to hold a message and its checksum.
    #[error("frame too short ({0} bytes)")]
    EmptyFrame(usize),

    /// A packet or frame grew past the configured maximum before completing.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A text line exceeded the configured maximum length.
    #[error("line too long ({len} bytes, max {max})")]
    LineTooLong { len: usize, max: usize },

    /// A text line was not valid UTF-8.
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The reader was asked to stop.
    #[error("reader stopped")]
    Stopped,
}

impl FrameError {
    /// Whether the error only invalidates the current frame.
    ///
    /// The bytes of the bad frame have been consumed; reading can continue.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            Self::InvalidEscape(_)
                | Self::TruncatedEscape
                | Self::ChecksumMismatch { .. }
                | Self::InvalidChecksumDigit(_)
                | Self::EmptyFrame(_)
                | Self::FrameTooLarge { .. }
                | Self::LineTooLong { .. }
                | Self::InvalidUtf8
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;

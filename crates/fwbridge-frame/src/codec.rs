use std::time::Duration;

use bytes::BytesMut;

use crate::error::Result;

/// Default maximum size of one frame or line: 64 KiB.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// Default read timeout used to poll a reader's stop signal.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Incremental byte-stream decoder.
///
/// `decode` consumes complete frames from the front of `src`. It returns
/// `Ok(None)` when more bytes are needed, leaving any partial frame buffered
/// (inside `src` or inside the decoder's own state).
pub trait Decoder {
    type Item;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>>;
}

/// Frame encoder for items of type `I`.
pub trait Encoder<I: ?Sized> {
    fn encode(&mut self, item: &I, dst: &mut BytesMut) -> Result<()>;
}

/// Stream settings shared by [`FrameReader`](crate::FrameReader) and
/// [`FrameWriter`](crate::FrameWriter).
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Read timeout applied to the stream. With a stop signal attached, each
    /// expiry is a chance to notice cancellation. Default: 100 ms.
    pub read_timeout: Option<Duration>,
    /// Write timeout applied to the stream.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            read_timeout: Some(DEFAULT_POLL_INTERVAL),
            write_timeout: None,
        }
    }
}

impl FrameConfig {
    /// Override the write timeout.
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Override the read (poll) timeout.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use fwbridge_transport::BridgeStream;

use crate::codec::{Encoder, FrameConfig};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream using an [`Encoder`].
///
/// Each `send` encodes into a reusable buffer and writes it in full before
/// returning, so a writer shared behind a lock never interleaves frames.
pub struct FrameWriter<T, E> {
    inner: T,
    encoder: E,
    buf: BytesMut,
}

impl<T: Write, E> FrameWriter<T, E> {
    /// Create a new frame writer.
    pub fn new(inner: T, encoder: E) -> Self {
        Self {
            inner,
            encoder,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Encode and send one item.
    pub fn send<I: ?Sized>(&mut self, item: &I) -> Result<()>
    where
        E: Encoder<I>,
    {
        self.buf.clear();
        self.encoder.encode(item, &mut self.buf)?;
        self.write_buffered()
    }

    /// Send pre-encoded bytes verbatim.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
        self.write_buffered()
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<E> FrameWriter<BridgeStream, E> {
    /// Create a frame writer for `BridgeStream` and apply the write timeout
    /// from config.
    pub fn with_config_stream(inner: BridgeStream, encoder: E, config: &FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::new(inner, encoder))
    }
}

use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use fwbridge_transport::{BridgeStream, StopSignal};

use crate::codec::{Decoder, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream using a [`Decoder`].
///
/// Handles partial reads internally; callers always get complete frames.
/// With a [`StopSignal`] attached, read timeouts become poll points: the
/// reader checks the signal and keeps waiting instead of surfacing the
/// timeout.
pub struct FrameReader<T, D> {
    inner: T,
    decoder: D,
    buf: BytesMut,
    stop: Option<StopSignal>,
}

impl<T: Read, D: Decoder> FrameReader<T, D> {
    /// Create a new frame reader.
    pub fn new(inner: T, decoder: D) -> Self {
        Self {
            inner,
            decoder,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            stop: None,
        }
    }

    /// Attach a stop signal, polled whenever a read times out.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached and
    /// `Err(FrameError::Stopped)` once the stop signal is raised. Frame-local
    /// errors are returned as-is; the bad frame has been consumed and the
    /// next call continues with the following bytes.
    pub fn read_frame(&mut self) -> Result<D::Item> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(frame);
            }

            if self.stop.as_ref().is_some_and(StopSignal::is_stopped) {
                return Err(FrameError::Stopped);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if self.stop.is_some()
                        && matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue
                }
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the decoder.
    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<D: Decoder> FrameReader<BridgeStream, D> {
    /// Create a frame reader for `BridgeStream` and apply the read timeout
    /// from config.
    pub fn with_config_stream(inner: BridgeStream, decoder: D, config: &FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::new(inner, decoder))
    }
}

pub(crate) fn transport_to_frame_error(err: fwbridge_transport::TransportError) -> FrameError {
    match err {
        fwbridge_transport::TransportError::Io(io)
        | fwbridge_transport::TransportError::Accept(io) => FrameError::Io(io),
        fwbridge_transport::TransportError::Bind { source, .. }
        | fwbridge_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::line::LineCodec;
    use crate::rpc::{encode_rpc_frame, RpcCodec};
    use crate::rsp::{encode_packet, RspCodec, RspFrame};

    fn rpc_wire(messages: &[&[u8]]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        for message in messages {
            encode_rpc_frame(message, &mut wire);
        }
        wire.to_vec()
    }

    #[test]
    fn read_single_rpc_frame() {
        let wire = rpc_wire(&[&[0x91, 0x78, 0x56, 0x34, 0x12]]);
        let mut reader = FrameReader::new(Cursor::new(wire), RpcCodec::new());
        let frame = reader.read_frame().expect("should read frame");
        assert_eq!(frame.as_ref(), &[0x91, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn read_multiple_frames() {
        let wire = rpc_wire(&[&[0x81, 0x01], &[0xb1], &[0xa4, 0x00, 0x10, 0x00, 0x00]]);
        let mut reader = FrameReader::new(Cursor::new(wire), RpcCodec::new());

        let f1 = reader.read_frame().expect("first");
        let f2 = reader.read_frame().expect("second");
        let f3 = reader.read_frame().expect("third");

        assert_eq!(f1.as_ref(), &[0x81, 0x01]);
        assert_eq!(f2.as_ref(), &[0xb1]);
        assert_eq!(f3.as_ref(), &[0xa4, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn partial_read_handling() {
        let mut wire = BytesMut::new();
        encode_packet(b"m2000,4", &mut wire);

        let byte_reader = ByteByByteReader {
            bytes: wire.to_vec(),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader, RspCodec::new());
        let frame = reader.read_frame().expect("should read packet");
        assert_eq!(frame, RspFrame::Packet(Bytes::from_static(b"m2000,4")));
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()), LineCodec::new());
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut reader = FrameReader::new(Cursor::new(b"$OK#9".to_vec()), RspCodec::new());
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn frame_local_error_then_recovery() {
        let mut wire = vec![0x01, 0x02, 0x03, 0x55];
        wire.extend(rpc_wire(&[&[0xb1]]));
        let mut reader = FrameReader::new(Cursor::new(wire), RpcCodec::new());

        let err = reader.read_frame().unwrap_err();
        assert!(err.is_frame_local());
        let frame = reader.read_frame().expect("should recover");
        assert_eq!(frame.as_ref(), &[0xb1]);
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            if buf.is_empty() {
                return Ok(0);
            }

            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn roundtrip_over_pipe() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left, LineCodec::new());
        let mut reader = FrameReader::new(right, LineCodec::new());

        writer.send("1-exec-continue").expect("should send");
        let line = reader.read_frame().expect("should read line");
        assert_eq!(line, "1-exec-continue");
    }

    #[test]
    fn concurrent_reader_writer_threads() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left, RpcCodec::new());
        let mut reader = FrameReader::new(right, RpcCodec::new());

        let reader_thread = std::thread::spawn(move || {
            for expected in 0..64u8 {
                let frame = reader.read_frame().expect("should read frame");
                // Values around the sentinel exercise byte stuffing.
                assert_eq!(frame.as_ref(), &[0x90, 1, expected.wrapping_add(0x40)]);
            }
        });

        for i in 0..64u8 {
            writer
                .send(&[0x90, 1, i.wrapping_add(0x40)][..])
                .expect("should send");
        }

        reader_thread.join().unwrap();
    }

    #[test]
    fn accessors_and_into_inner() {
        let cursor = Cursor::new(Vec::<u8>::new());
        let mut reader = FrameReader::new(cursor, LineCodec::new());

        assert_eq!(reader.buffered(), 0);
        let _ = reader.decoder();
        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
    }

    #[test]
    fn read_would_block_propagates_io_error_without_stop() {
        let reader = WouldBlockThenData {
            state: 0,
            bytes: b"ok\n".to_vec(),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader, LineCodec::new());
        let err = framed.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
    }

    #[test]
    fn read_would_block_polls_with_stop() {
        let reader = WouldBlockThenData {
            state: 0,
            bytes: b"ok\n".to_vec(),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader, LineCodec::new()).with_stop(StopSignal::new());
        let line = framed.read_frame().expect("should retry after WouldBlock");
        assert_eq!(line, "ok");
    }

    struct WouldBlockThenData {
        state: u8,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for WouldBlockThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.state == 0 {
                self.state = 1;
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            state: 0,
            bytes: b"+".to_vec(),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader, RspCodec::new());
        let frame = framed.read_frame().expect("should retry after Interrupted");
        assert_eq!(frame, RspFrame::Ack);
    }

    struct InterruptedThenData {
        state: u8,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.state == 0 {
                self.state = 1;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    #[cfg(unix)]
    fn stop_signal_releases_blocked_reader() {
        let (left, _right) = BridgeStream::pair().expect("should create pair");
        let config = FrameConfig::default().with_read_timeout(Some(Duration::from_millis(20)));
        let stop = StopSignal::new();
        let mut reader = FrameReader::with_config_stream(left, RspCodec::new(), &config)
            .expect("should apply timeout")
            .with_stop(stop.clone());

        let handle = std::thread::spawn(move || reader.read_frame());
        std::thread::sleep(Duration::from_millis(60));
        stop.stop();

        let result = handle.join().expect("reader thread should not panic");
        assert!(matches!(result, Err(FrameError::Stopped)));
    }

    #[test]
    #[cfg(unix)]
    fn roundtrip_over_bridge_stream() {
        let (left, right) = BridgeStream::pair().expect("should create pair");
        let server = std::thread::spawn(move || {
            let mut reader = FrameReader::new(right, RspCodec::new());
            reader.read_frame().expect("should read packet")
        });

        let mut writer = crate::writer::FrameWriter::new(left, RspCodec::new());
        writer
            .send(&RspFrame::Packet(Bytes::from_static(b"qSupported")))
            .expect("should send");

        let frame = server.join().unwrap();
        assert_eq!(frame, RspFrame::Packet(Bytes::from_static(b"qSupported")));
    }
}

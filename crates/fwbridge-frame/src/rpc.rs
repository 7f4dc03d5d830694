//! Binary RPC framing.
//!
//! Wire form: `escape(message ++ [crc8(message)]) ++ [0x55]`. Inside a frame,
//! 0x55 is sent as `AA 01` and 0xAA as `AA 02`.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::checksum::crc8;
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_FRAME};
use crate::error::{FrameError, Result};

/// Frame terminator.
pub const FRAME_END: u8 = 0x55;
/// Escape prefix.
pub const ESCAPE: u8 = 0xAA;
const ESCAPED_END: u8 = 0x01;
const ESCAPED_ESCAPE: u8 = 0x02;

fn put_escaped(byte: u8, dst: &mut BytesMut) {
    match byte {
        FRAME_END => dst.put_slice(&[ESCAPE, ESCAPED_END]),
        ESCAPE => dst.put_slice(&[ESCAPE, ESCAPED_ESCAPE]),
        other => dst.put_u8(other),
    }
}

/// Append one escaped, checksummed, terminated frame carrying `message`.
pub fn encode_rpc_frame(message: &[u8], dst: &mut BytesMut) {
    dst.reserve(message.len() + 2);
    for &byte in message {
        put_escaped(byte, dst);
    }
    put_escaped(crc8(message), dst);
    dst.put_u8(FRAME_END);
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` when no terminator has arrived yet. On any error the
/// offending frame has already been consumed.
pub fn decode_rpc_frame(src: &mut BytesMut) -> Result<Option<Bytes>> {
    let Some(end) = src.iter().position(|&b| b == FRAME_END) else {
        return Ok(None);
    };
    let raw = src.split_to(end + 1);
    let body = &raw[..end];

    let mut unescaped = BytesMut::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(byte) = iter.next() {
        if byte != ESCAPE {
            unescaped.put_u8(byte);
            continue;
        }
        match iter.next() {
            Some(ESCAPED_END) => unescaped.put_u8(FRAME_END),
            Some(ESCAPED_ESCAPE) => unescaped.put_u8(ESCAPE),
            Some(other) => return Err(FrameError::InvalidEscape(other)),
            None => return Err(FrameError::TruncatedEscape),
        }
    }

    if unescaped.len() < 2 {
        return Err(FrameError::EmptyFrame(unescaped.len()));
    }

    let checksum_at = unescaped.len() - 1;
    let received = unescaped[checksum_at];
    unescaped.truncate(checksum_at);
    let computed = crc8(&unescaped);
    if received != computed {
        return Err(FrameError::ChecksumMismatch { received, computed });
    }

    Ok(Some(unescaped.freeze()))
}

/// [`Decoder`] / [`Encoder`] pair for binary RPC frames.
///
/// A bare terminator (a frame with no bytes at all) is skipped silently; the
/// peer emits those to resynchronise.
#[derive(Debug, Clone)]
pub struct RpcCodec {
    max_len: usize,
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCodec {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME)
    }

    /// Codec that gives up on frames whose wire form exceeds `max_len` bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Decoder for RpcCodec {
    type Item = Bytes;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        while src.first() == Some(&FRAME_END) {
            trace!("skipping empty rpc frame");
            let _ = src.split_to(1);
        }

        if !src.contains(&FRAME_END) && src.len() > self.max_len {
            let size = src.len();
            src.clear();
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.max_len,
            });
        }

        decode_rpc_frame(src)
    }
}

impl Encoder<[u8]> for RpcCodec {
    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<()> {
        encode_rpc_frame(item, dst);
        Ok(())
    }
}

impl Encoder<Bytes> for RpcCodec {
    fn encode(&mut self, item: &Bytes, dst: &mut BytesMut) -> Result<()> {
        encode_rpc_frame(item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_read_memory_frame() {
        let mut wire = BytesMut::new();
        encode_rpc_frame(&[0x01, 0x00, 0x10, 0x00, 0x00, 0x04], &mut wire);
        assert_eq!(
            &wire[..],
            &[0x01, 0x00, 0x10, 0x00, 0x00, 0x04, 0x6e, 0x55]
        );
    }

    #[test]
    fn stuffs_sentinel_and_escape_bytes() {
        let message = [0x02, 0x55, 0xaa, 0x00, 0x00, 0x01, 0x55];
        let mut wire = BytesMut::new();
        encode_rpc_frame(&message, &mut wire);
        assert_eq!(
            &wire[..],
            &[
                0x02, 0xaa, 0x01, 0xaa, 0x02, 0x00, 0x00, 0x01, 0xaa, 0x01, 0x11, 0x55
            ]
        );
        // Only the final byte is a raw terminator.
        assert_eq!(wire.iter().filter(|&&b| b == FRAME_END).count(), 1);

        let decoded = decode_rpc_frame(&mut wire)
            .expect("should decode")
            .expect("should be complete");
        assert_eq!(decoded.as_ref(), &message);
        assert!(wire.is_empty());
    }

    #[test]
    fn escaped_checksum_byte_roundtrip() {
        // crc8([0x14]) == 0xfc, crc8 of 0x91 0x78 0x56 0x34 0x12 == 0x53
        for message in [&[0x14][..], &[0x91, 0x78, 0x56, 0x34, 0x12][..], &[0x55, 0xaa][..]] {
            let mut wire = BytesMut::new();
            encode_rpc_frame(message, &mut wire);
            let decoded = decode_rpc_frame(&mut wire)
                .expect("should decode")
                .expect("should be complete");
            assert_eq!(decoded.as_ref(), message);
        }
    }

    #[test]
    fn incomplete_frame_waits() {
        let mut buf = BytesMut::from(&[0x01, 0x00, 0x10][..]);
        assert!(decode_rpc_frame(&mut buf).expect("should not fail").is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn invalid_escape_continuation() {
        let mut buf = BytesMut::from(&[0x01, 0xaa, 0x03, 0x00, 0x55, 0xb1, 0x55][..]);
        let err = decode_rpc_frame(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidEscape(0x03)));
        // The bad frame is consumed; the rest stays buffered.
        assert_eq!(&buf[..], &[0xb1, 0x55]);
    }

    #[test]
    fn trailing_lone_escape_is_error() {
        let mut buf = BytesMut::from(&[0x01, 0x02, 0xaa, 0x55][..]);
        let err = decode_rpc_frame(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::TruncatedEscape));
    }

    #[test]
    fn checksum_mismatch_detected() {
        let mut buf = BytesMut::from(&[0x01, 0x00, 0x10, 0x00, 0x00, 0x04, 0x6f, 0x55][..]);
        let err = decode_rpc_frame(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::ChecksumMismatch {
                received: 0x6f,
                computed: 0x6e
            }
        ));
    }

    #[test]
    fn any_single_bit_flip_is_detected() {
        let message = [0x04, 0x0f, 0x78, 0x56, 0x34, 0x12];
        let mut clean = Vec::from(&message[..]);
        clean.push(crc8(&message));

        for index in 0..clean.len() {
            for bit in 0..8 {
                let mut corrupted = clean.clone();
                corrupted[index] ^= 1 << bit;
                let mut wire = BytesMut::new();
                for &byte in &corrupted {
                    put_escaped(byte, &mut wire);
                }
                wire.put_u8(FRAME_END);
                let result = decode_rpc_frame(&mut wire);
                assert!(
                    matches!(result, Err(FrameError::ChecksumMismatch { .. })),
                    "flip of bit {bit} in byte {index} went undetected"
                );
            }
        }
    }

    #[test]
    fn one_byte_frame_is_too_short() {
        let mut buf = BytesMut::from(&[0xb1, 0x55][..]);
        let err = decode_rpc_frame(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::EmptyFrame(1)));
    }

    #[test]
    fn codec_skips_bare_terminators() {
        let mut codec = RpcCodec::new();
        let mut buf = BytesMut::from(&[0x55, 0x55][..]);
        encode_rpc_frame(&[0xb1], &mut buf);
        let frame = codec
            .decode(&mut buf)
            .expect("should decode")
            .expect("should be complete");
        assert_eq!(frame.as_ref(), &[0xb1]);
    }

    #[test]
    fn codec_rejects_runaway_frame() {
        let mut codec = RpcCodec::with_max_len(8);
        let mut buf = BytesMut::from(&[0x01; 9][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 9, max: 8 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = RpcCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(&[0x81u8, 0x01][..], &mut buf)
            .expect("should encode");
        codec
            .encode(&Bytes::from_static(&[0x91, 0x0f, 0x00, 0x00, 0x00]), &mut buf)
            .expect("should encode");

        let first = codec.decode(&mut buf).expect("ok").expect("first frame");
        let second = codec.decode(&mut buf).expect("ok").expect("second frame");
        assert_eq!(first.as_ref(), &[0x81, 0x01]);
        assert_eq!(second.as_ref(), &[0x91, 0x0f, 0x00, 0x00, 0x00]);
        assert!(codec.decode(&mut buf).expect("ok").is_none());
    }
}

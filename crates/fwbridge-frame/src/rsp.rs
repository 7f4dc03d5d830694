//! GDB remote serial protocol framing.
//!
//! Packets are `$payload#hh`, where `hh` is the modular byte sum of the
//! payload as it appears on the wire. Outside a packet the receiver sees
//! single-byte acknowledgements (`+` / `-`) and the 0x03 interrupt request.
//! Payload bytes `$`, `#`, `}` and `*` are escaped as `}` followed by the byte
//! XOR 0x20; replies may use `*` run-length encoding, which the decoder
//! expands.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::checksum::ModSum;
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_FRAME};
use crate::error::{FrameError, Result};

const PACKET_START: u8 = b'$';
const CHECKSUM_START: u8 = b'#';
const ESCAPE: u8 = b'}';
const RUN_LENGTH: u8 = b'*';
const ACK: u8 = b'+';
const NACK: u8 = b'-';
const INTERRUPT: u8 = 0x03;

/// One unit of remote serial traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RspFrame {
    /// `+`: the last packet arrived intact.
    Ack,
    /// `-`: the last packet was corrupt.
    Nack,
    /// 0x03: request to halt the target.
    Interrupt,
    /// A verified packet payload, unescaped and run-length expanded.
    Packet(Bytes),
}

impl RspFrame {
    /// Build a packet frame from any byte payload.
    pub fn packet(payload: impl Into<Bytes>) -> Self {
        Self::Packet(payload.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InMessage,
    ChecksumHigh,
    ChecksumLow(u8),
}

/// Incremental `$payload#hh` decoder.
///
/// State machine: `Idle -($)-> InMessage -(#)-> ChecksumHigh -(hex)->
/// ChecksumLow -(hex, verify)-> Idle`. A non-hex checksum digit or a checksum
/// mismatch fails that packet only; the decoder returns to `Idle` and the
/// next call resumes with the following bytes.
#[derive(Debug)]
pub struct RspCodec {
    state: State,
    payload: BytesMut,
    sum: ModSum,
    max_len: usize,
}

impl Default for RspCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RspCodec {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME)
    }

    /// Decoder that rejects packets whose raw payload exceeds `max_len`.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            state: State::Idle,
            payload: BytesMut::new(),
            sum: ModSum::new(),
            max_len,
        }
    }

    /// Whether the decoder sits between packets.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    fn start_packet(&mut self) {
        self.payload.clear();
        self.sum = ModSum::new();
        self.state = State::InMessage;
    }
}

impl Decoder for RspCodec {
    type Item = RspFrame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RspFrame>> {
        while src.has_remaining() {
            let byte = src.get_u8();
            match self.state {
                State::Idle => match byte {
                    PACKET_START => self.start_packet(),
                    ACK => return Ok(Some(RspFrame::Ack)),
                    NACK => return Ok(Some(RspFrame::Nack)),
                    INTERRUPT => return Ok(Some(RspFrame::Interrupt)),
                    other => trace!(byte = other, "ignoring byte outside packet"),
                },
                State::InMessage => match byte {
                    CHECKSUM_START => self.state = State::ChecksumHigh,
                    PACKET_START => {
                        warn!(
                            discarded = self.payload.len(),
                            "packet restarted before checksum"
                        );
                        self.start_packet();
                    }
                    _ => {
                        if self.payload.len() >= self.max_len {
                            self.state = State::Idle;
                            return Err(FrameError::FrameTooLarge {
                                size: self.payload.len() + 1,
                                max: self.max_len,
                            });
                        }
                        self.sum.update(&[byte]);
                        self.payload.put_u8(byte);
                    }
                },
                State::ChecksumHigh => match hex_value(byte) {
                    Some(high) => self.state = State::ChecksumLow(high << 4),
                    None => {
                        self.state = State::Idle;
                        return Err(FrameError::InvalidChecksumDigit(byte));
                    }
                },
                State::ChecksumLow(high) => {
                    self.state = State::Idle;
                    let low = hex_value(byte).ok_or(FrameError::InvalidChecksumDigit(byte))?;
                    let received = high | low;
                    let computed = self.sum.value();
                    if received != computed {
                        return Err(FrameError::ChecksumMismatch { received, computed });
                    }
                    let raw = self.payload.split();
                    return expand_payload(&raw).map(|payload| Some(RspFrame::Packet(payload)));
                }
            }
        }
        Ok(None)
    }
}

impl Encoder<RspFrame> for RspCodec {
    fn encode(&mut self, item: &RspFrame, dst: &mut BytesMut) -> Result<()> {
        match item {
            RspFrame::Ack => dst.put_u8(ACK),
            RspFrame::Nack => dst.put_u8(NACK),
            RspFrame::Interrupt => dst.put_u8(INTERRUPT),
            RspFrame::Packet(payload) => encode_packet(payload, dst),
        }
        Ok(())
    }
}

/// Append `$payload#hh` to `dst`, escaping reserved bytes.
pub fn encode_packet(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(payload.len() + 4);
    dst.put_u8(PACKET_START);
    let mut sum = ModSum::new();
    for &byte in payload {
        if matches!(byte, PACKET_START | CHECKSUM_START | ESCAPE | RUN_LENGTH) {
            let escaped = [ESCAPE, byte ^ 0x20];
            sum.update(&escaped);
            dst.put_slice(&escaped);
        } else {
            sum.update(&[byte]);
            dst.put_u8(byte);
        }
    }
    dst.put_u8(CHECKSUM_START);
    let checksum = sum.value();
    dst.put_u8(HEX_DIGITS[usize::from(checksum >> 4)]);
    dst.put_u8(HEX_DIGITS[usize::from(checksum & 0x0f)]);
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Undo escaping and run-length encoding. A packet ending in a lone `}` is
/// rejected.
fn expand_payload(raw: &[u8]) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(raw.len());
    let mut iter = raw.iter().copied();
    while let Some(byte) = iter.next() {
        match byte {
            ESCAPE => match iter.next() {
                Some(next) => out.put_u8(next ^ 0x20),
                None => return Err(FrameError::TruncatedEscape),
            },
            RUN_LENGTH => {
                let count = iter.next().map(|c| usize::from(c.saturating_sub(29)));
                match (out.last().copied(), count) {
                    (Some(prev), Some(count)) => {
                        for _ in 0..count {
                            out.put_u8(prev);
                        }
                    }
                    _ => warn!("run-length marker without a preceding byte"),
                }
            }
            other => out.put_u8(other),
        }
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut RspCodec, wire: &[u8]) -> Vec<Result<RspFrame>> {
        let mut buf = BytesMut::from(wire);
        let mut out = Vec::new();
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => break,
                Err(err) => out.push(Err(err)),
            }
        }
        out
    }

    #[test]
    fn encodes_known_packets() {
        let mut wire = BytesMut::new();
        encode_packet(b"OK", &mut wire);
        assert_eq!(&wire[..], b"$OK#9a");

        wire.clear();
        encode_packet(b"S05", &mut wire);
        assert_eq!(&wire[..], b"$S05#b8");

        wire.clear();
        encode_packet(b"", &mut wire);
        assert_eq!(&wire[..], b"$#00");
    }

    #[test]
    fn decodes_packet_and_acks() {
        let mut codec = RspCodec::new();
        let frames = decode_all(&mut codec, b"+$OK#9a-\x03");
        let frames: Vec<RspFrame> = frames.into_iter().map(|f| f.expect("should decode")).collect();
        assert_eq!(
            frames,
            vec![
                RspFrame::Ack,
                RspFrame::packet(&b"OK"[..]),
                RspFrame::Nack,
                RspFrame::Interrupt,
            ]
        );
        assert!(codec.is_idle());
    }

    #[test]
    fn uppercase_checksum_digits_accepted() {
        let mut codec = RspCodec::new();
        let mut buf = BytesMut::from(&b"$OK#9A"[..]);
        let frame = codec.decode(&mut buf).expect("should decode");
        assert_eq!(frame, Some(RspFrame::packet(&b"OK"[..])));
    }

    #[test]
    fn byte_by_byte_feeding() {
        let mut codec = RspCodec::new();
        let wire = b"$m2000,4#8f";
        let mut buf = BytesMut::new();
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let result = codec.decode(&mut buf).expect("should not fail");
            if i + 1 < wire.len() {
                assert!(result.is_none());
                assert!(!codec.is_idle());
            } else {
                assert_eq!(result, Some(RspFrame::packet(&b"m2000,4"[..])));
            }
        }
    }

    #[test]
    fn checksum_mismatch_drops_only_that_packet() {
        let mut codec = RspCodec::new();
        let frames = decode_all(&mut codec, b"$OK#00$S05#b8");
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            frames[0],
            Err(FrameError::ChecksumMismatch {
                received: 0x00,
                computed: 0x9a
            })
        ));
        assert_eq!(
            *frames[1].as_ref().expect("second packet should decode"),
            RspFrame::packet(&b"S05"[..])
        );
    }

    #[test]
    fn trailing_lone_escape_is_framing_error() {
        let mut codec = RspCodec::new();
        let frames = decode_all(&mut codec, b"$ab}#40$OK#9a");
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(FrameError::TruncatedEscape)));
        assert!(FrameError::TruncatedEscape.is_frame_local());
        assert_eq!(
            *frames[1].as_ref().expect("next packet should decode"),
            RspFrame::packet(&b"OK"[..])
        );

        let frames = decode_all(&mut codec, b"$a}]#3b");
        assert_eq!(
            *frames[0].as_ref().expect("escaped pair should decode"),
            RspFrame::packet(&b"a}"[..])
        );
    }

    #[test]
    fn non_hex_checksum_digit_is_framing_error() {
        let mut codec = RspCodec::new();
        let frames = decode_all(&mut codec, b"$OK#zz+");
        assert!(matches!(frames[0], Err(FrameError::InvalidChecksumDigit(b'z'))));
        // The second 'z' is ignored in Idle; the ack still comes through.
        assert_eq!(
            *frames[1].as_ref().expect("ack should decode"),
            RspFrame::Ack
        );
    }

    #[test]
    fn bad_low_digit_resets_state() {
        let mut codec = RspCodec::new();
        let mut buf = BytesMut::from(&b"$OK#9x"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidChecksumDigit(b'x')));
        assert!(codec.is_idle());
    }

    #[test]
    fn restart_inside_packet_discards_partial() {
        let mut codec = RspCodec::new();
        let mut buf = BytesMut::from(&b"$garb$OK#9a"[..]);
        let frame = codec.decode(&mut buf).expect("should decode");
        assert_eq!(frame, Some(RspFrame::packet(&b"OK"[..])));
    }

    #[test]
    fn escaped_bytes_roundtrip() {
        let mut wire = BytesMut::new();
        encode_packet(b"a#b", &mut wire);
        assert_eq!(&wire[..], b"$a}\x03b#43");

        let mut codec = RspCodec::new();
        let frame = codec.decode(&mut wire).expect("should decode");
        assert_eq!(frame, Some(RspFrame::packet(&b"a#b"[..])));
    }

    #[test]
    fn run_length_expansion() {
        // "0* " repeats '0' three more times.
        let mut codec = RspCodec::new();
        let mut buf = BytesMut::from(&b"$0* #7a"[..]);
        let frame = codec.decode(&mut buf).expect("should decode");
        assert_eq!(frame, Some(RspFrame::packet(&b"0000"[..])));
    }

    #[test]
    fn oversized_packet_rejected() {
        let mut codec = RspCodec::with_max_len(4);
        let mut buf = BytesMut::from(&b"$123456#00"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 5, max: 4 }));
        assert!(codec.is_idle());
    }

    #[test]
    fn encoder_writes_control_bytes() {
        let mut codec = RspCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(&RspFrame::Ack, &mut wire).expect("should encode");
        codec.encode(&RspFrame::Nack, &mut wire).expect("should encode");
        codec
            .encode(&RspFrame::Interrupt, &mut wire)
            .expect("should encode");
        codec
            .encode(&RspFrame::packet(&b"g"[..]), &mut wire)
            .expect("should encode");
        assert_eq!(&wire[..], b"+-\x03$g#67");
    }
}

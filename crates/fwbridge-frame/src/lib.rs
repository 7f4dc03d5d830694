//! Checksums and byte-stream framing for the fwbridge wire protocols.
//!
//! Three framings share one reader/writer pair:
//! - GDB remote serial: `$payload#hh` with a modular byte-sum checksum and
//!   `+`/`-` acknowledgements ([`RspCodec`])
//! - Binary RPC: 0x55-terminated, 0xAA byte-stuffed, CRC8-protected
//!   ([`RpcCodec`])
//! - GDB/MI: newline-terminated text lines ([`LineCodec`])
//!
//! Frame-local failures (bad checksum, bad escape, oversized line) consume the
//! offending bytes and leave the stream aligned on the next frame, so readers
//! can log and keep going. See [`FrameError::is_frame_local`].

pub mod checksum;
pub mod codec;
pub mod error;
pub mod line;
pub mod reader;
pub mod rpc;
pub mod rsp;
pub mod writer;

pub use checksum::{crc8, modsum, Crc8, ModSum};
pub use codec::{Decoder, Encoder, FrameConfig, DEFAULT_MAX_FRAME, DEFAULT_POLL_INTERVAL};
pub use error::{FrameError, Result};
pub use line::LineCodec;
pub use reader::FrameReader;
pub use rpc::{decode_rpc_frame, encode_rpc_frame, RpcCodec};
pub use rsp::{encode_packet, RspCodec, RspFrame};
pub use writer::FrameWriter;

//! GDB remote serial protocol client.

mod client;
mod hex;
mod stop;

pub use client::{BreakpointKind, RspClient, RspConfig};
pub use hex::{decode_hex, encode_hex, parse_hex_u64};
pub use stop::StopReply;

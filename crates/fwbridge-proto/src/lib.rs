//! Protocol engines for talking to a target under analysis.
//!
//! - [`rpc`]: the binary stub protocol (message catalog and client)
//! - [`mi`]: GDB/MI record parser, line client, and debugger commands
//! - [`rsp`]: GDB remote serial protocol client
//!
//! All three clients share the same shape: a reader thread owns the inbound
//! half of the stream and routes each message either to a waiting caller
//! through a [`Correlator`] or to a notification handler.

pub mod correlator;
pub mod error;
pub mod message;
pub mod mi;
pub mod rpc;
pub mod rsp;

pub use correlator::{Correlator, PendingReply};
pub use error::{ParseError, ProtoError, Result};
pub use message::{FieldValue, Message, MessageKind};

//! Connected byte streams for the fwbridge protocol engine.
//!
//! Every wire protocol in fwbridge runs over a plain, already-established
//! byte stream:
//! - TCP (remote stubs, gdbserver, emulator side-channels)
//! - Unix domain sockets (local tooling, tests)
//!
//! This is the lowest layer. It owns endpoint parsing, connect/accept, and
//! the [`StopSignal`] that reader threads poll between read timeouts.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stop;
pub mod stream;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::BridgeListener;
pub use stop::StopSignal;
pub use stream::{BridgeStream, RetryPolicy};

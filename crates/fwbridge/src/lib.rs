//! Protocol engine for hybrid firmware analysis.
//!
//! fwbridge connects a firmware emulator to a real device: it speaks the
//! binary RPC protocol of the on-device stub, drives GDB over its machine
//! interface or the remote serial protocol, and serves targets back to GDB.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and Unix socket streams with connect retry
//! - [`frame`]: checksums and the three wire framings
//! - [`proto`]: protocol clients for binary RPC, GDB/MI and GDB remote
//! - [`session`]: event bus, debug sessions, and bridge orchestration
//!   (behind the `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use fwbridge_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use fwbridge_frame::*;
}

/// Re-export protocol types.
pub mod proto {
    pub use fwbridge_proto::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use fwbridge_session::*;
}

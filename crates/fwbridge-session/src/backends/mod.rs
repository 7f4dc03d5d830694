//! Target backends. Each wraps one protocol client and exposes the
//! capabilities it supports through a [`DebugSession`](crate::DebugSession).

pub mod gdb_mi;
pub mod remote;
pub mod stub;

pub use gdb_mi::GdbMiTarget;
pub use remote::RemoteTarget;
pub use stub::StubTarget;

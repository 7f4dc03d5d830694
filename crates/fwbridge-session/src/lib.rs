//! Session layer: the event bus, the debug session facade over target
//! backends, the emulator call proxy and its JSON side-channel, and a GDB
//! server exposing any session.
//!
//! [`Bridge::start`] assembles these from a [`BridgeConfig`].

pub mod backends;
pub mod breakpoint;
pub mod bridge;
pub mod bus;
pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod gdb_server;
pub mod proxy;
pub mod remote_memory;
pub mod session;

#[cfg(test)]
mod fake;

pub use breakpoint::{CallbackBreakpoint, WaitingBreakpoint};
pub use bridge::Bridge;
pub use bus::{EventBus, EventListener, EventWaiter, ListenerId};
pub use capability::{
    BreakpointControl, BreakpointId, BreakpointOptions, ChecksumQuery, ExecutionControl,
    MemoryAccess, RegisterAccess, ARM_REGISTERS,
};
pub use config::{BridgeConfig, RetryConfig, TargetConfig, TargetKind};
pub use error::{Result, SessionError};
pub use event::{Event, EventProperties, EventTag, Source};
pub use gdb_server::GdbServer;
pub use proxy::{CallProxy, HookSet, MemoryRequest, Monitor, MonitorId};
pub use remote_memory::{handle_request, RemoteMemoryChannel, RemoteMemoryHandler};
pub use session::{BreakpointCallback, DebugSession, DebugSessionBuilder};

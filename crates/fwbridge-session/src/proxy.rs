//! Forwards emulator requests to the target session, with monitor hooks
//! around memory accesses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fwbridge_proto::ProtoError;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::bus::lock;
use crate::capability::ARM_REGISTERS;
use crate::error::{Result, SessionError};
use crate::remote_memory::{parse_hex, RemoteMemoryHandler};
use crate::session::DebugSession;

/// One emulator memory access.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRequest {
    pub address: u64,
    pub size: u8,
    /// Value to write, or the value read once the access completed.
    pub value: Option<u64>,
    /// Emulator CPU state at the time of the access.
    pub cpu_state: Map<String, Value>,
}

impl MemoryRequest {
    pub fn read(address: u64, size: u8) -> Self {
        Self {
            address,
            size,
            value: None,
            cpu_state: Map::new(),
        }
    }

    pub fn write(address: u64, size: u8, value: u64) -> Self {
        Self {
            value: Some(value),
            ..Self::read(address, size)
        }
    }
}

/// Which hooks a monitor wants called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet {
    pub pre_read: bool,
    pub post_read: bool,
    pub pre_write: bool,
    pub post_write: bool,
}

impl HookSet {
    pub fn all() -> Self {
        Self {
            pre_read: true,
            post_read: true,
            pre_write: true,
            post_write: true,
        }
    }
}

/// Observes (and may rewrite) memory accesses forwarded to the target.
///
/// [`hooks`](Self::hooks) is queried once, when the monitor is added.
pub trait Monitor: Send + Sync + 'static {
    fn hooks(&self) -> HookSet;

    /// Before a read; may change the address or size.
    fn pre_read(&self, _request: &mut MemoryRequest) {}

    /// After a read; `request.value` holds the value read.
    fn post_read(&self, _request: &MemoryRequest) {}

    /// Before a write; may change the address, size or value.
    fn pre_write(&self, _request: &mut MemoryRequest) {}

    fn post_write(&self, _request: &MemoryRequest) {}

    /// Called when the proxy shuts down.
    fn stop(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(u64);

type Hooks = Vec<(MonitorId, Arc<dyn Monitor>)>;

#[derive(Default)]
struct HookTable {
    monitors: Hooks,
    pre_read: Hooks,
    post_read: Hooks,
    pre_write: Hooks,
    post_write: Hooks,
}

impl HookTable {
    fn remove(&mut self, id: MonitorId) -> bool {
        let before = self.monitors.len();
        for list in [
            &mut self.monitors,
            &mut self.pre_read,
            &mut self.post_read,
            &mut self.pre_write,
            &mut self.post_write,
        ] {
            list.retain(|(m, _)| *m != id);
        }
        self.monitors.len() != before
    }
}

fn snapshot(hooks: &Hooks) -> Vec<Arc<dyn Monitor>> {
    hooks.iter().map(|(_, monitor)| Arc::clone(monitor)).collect()
}

/// Serves emulator requests from a target [`DebugSession`].
pub struct CallProxy {
    target: DebugSession,
    hooks: Mutex<HookTable>,
    next_id: AtomicU64,
}

impl CallProxy {
    pub fn new(target: DebugSession) -> Self {
        Self {
            target,
            hooks: Mutex::new(HookTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn target(&self) -> &DebugSession {
        &self.target
    }

    pub fn add_monitor(&self, monitor: Arc<dyn Monitor>) -> MonitorId {
        let id = MonitorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let wanted = monitor.hooks();
        let mut guard = lock(&self.hooks);
        let table = &mut *guard;
        for (enabled, list) in [
            (wanted.pre_read, &mut table.pre_read),
            (wanted.post_read, &mut table.post_read),
            (wanted.pre_write, &mut table.pre_write),
            (wanted.post_write, &mut table.post_write),
        ] {
            if enabled {
                list.push((id, Arc::clone(&monitor)));
            }
        }
        table.monitors.push((id, monitor));
        debug!(monitor = id.0, hooks = ?wanted, "monitor added");
        id
    }

    /// Returns false if the monitor was not registered.
    pub fn remove_monitor(&self, id: MonitorId) -> bool {
        lock(&self.hooks).remove(id)
    }

    /// Stop every monitor and drop them.
    pub fn stop(&self) {
        let monitors = std::mem::take(&mut *lock(&self.hooks)).monitors;
        for (_, monitor) in monitors {
            monitor.stop();
        }
    }

    fn hooked(&self, select: impl Fn(&HookTable) -> &Hooks) -> Vec<Arc<dyn Monitor>> {
        snapshot(select(&lock(&self.hooks)))
    }
}

impl RemoteMemoryHandler for CallProxy {
    fn read(&self, mut request: MemoryRequest) -> Result<u64> {
        for monitor in self.hooked(|t| &t.pre_read) {
            monitor.pre_read(&mut request);
        }
        let value = self
            .target
            .read_typed_memory(request.address, request.size)?;
        trace!(
            address = format_args!("0x{:08x}", request.address),
            size = request.size,
            value = format_args!("0x{value:x}"),
            "forwarded read"
        );
        request.value = Some(value);
        for monitor in self.hooked(|t| &t.post_read) {
            monitor.post_read(&request);
        }
        Ok(value)
    }

    fn write(&self, mut request: MemoryRequest) -> Result<()> {
        for monitor in self.hooked(|t| &t.pre_write) {
            monitor.pre_write(&mut request);
        }
        let value = request.value.ok_or_else(|| {
            SessionError::Proto(ProtoError::InvalidField {
                field: "value",
                reason: "write request without a value".into(),
            })
        })?;
        self.target
            .write_typed_memory(request.address, request.size, value)?;
        trace!(
            address = format_args!("0x{:08x}", request.address),
            size = request.size,
            value = format_args!("0x{value:x}"),
            "forwarded write"
        );
        for monitor in self.hooked(|t| &t.post_write) {
            monitor.post_write(&request);
        }
        Ok(())
    }

    /// Copy emulator registers to the target. `cpsr` is not transferred.
    fn set_cpu_state(&self, state: &Map<String, Value>) -> Result<()> {
        for (name, value) in state {
            if name == "cpsr" {
                continue;
            }
            let value = value
                .as_str()
                .and_then(parse_hex)
                .ok_or_else(|| {
                    SessionError::Proto(ProtoError::InvalidField {
                        field: "cpu_state",
                        reason: format!("register {name} is not a hex string: {value}"),
                    })
                })?;
            self.target.set_register(name, value)?;
        }
        Ok(())
    }

    fn get_cpu_state(&self) -> Result<Map<String, Value>> {
        ARM_REGISTERS
            .iter()
            .map(|name| {
                let value = self.target.get_register(name)?;
                Ok((name.to_string(), Value::String(format!("0x{value:x}"))))
            })
            .collect()
    }

    fn cont(&self) -> Result<()> {
        self.target.cont()
    }

    fn checksum(&self, address: u64, size: u64) -> Result<u64> {
        self.target.get_checksum(address, size)
    }
}

impl fmt::Debug for CallProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallProxy")
            .field("target", &self.target)
            .field("monitors", &lock(&self.hooks).monitors.len())
            .finish()
    }
}

use std::collections::HashSet;
use std::fmt;
use std::sync::{mpsc, Arc, Mutex, Weak};

use tracing::{debug, info};

use crate::breakpoint::{matches_breakpoint, CallbackBreakpoint, WaitingBreakpoint};
use crate::bus::{lock, EventBus};
use crate::capability::{
    BreakpointControl, BreakpointId, BreakpointOptions, ChecksumQuery, ExecutionControl,
    MemoryAccess, RegisterAccess,
};
use crate::error::{Result, SessionError};
use crate::event::{Event, Source};

/// Called on the event dispatch thread when a breakpoint is hit.
pub trait BreakpointCallback: Send + Sync + 'static {
    fn on_hit(&self, session: &DebugSession, breakpoint: &BreakpointId);
}

impl<F> BreakpointCallback for F
where
    F: Fn(&DebugSession, &BreakpointId) + Send + Sync + 'static,
{
    fn on_hit(&self, session: &DebugSession, breakpoint: &BreakpointId) {
        self(session, breakpoint)
    }
}

pub(crate) struct SessionInner {
    pub(crate) bus: EventBus,
    pub(crate) source: Source,
    name: String,
    memory: Option<Arc<dyn MemoryAccess>>,
    registers: Option<Arc<dyn RegisterAccess>>,
    breakpoints: Option<Arc<dyn BreakpointControl>>,
    execution: Option<Arc<dyn ExecutionControl>>,
    checksum: Option<Arc<dyn ChecksumQuery>>,
    queue_sigabrt: bool,
    armed: Mutex<HashSet<u64>>,
}

/// One debugging context: a backend's capabilities plus the bus it reports
/// on. Cheap to clone.
#[derive(Clone)]
pub struct DebugSession {
    pub(crate) inner: Arc<SessionInner>,
}

pub struct DebugSessionBuilder {
    bus: EventBus,
    source: Source,
    name: String,
    memory: Option<Arc<dyn MemoryAccess>>,
    registers: Option<Arc<dyn RegisterAccess>>,
    breakpoints: Option<Arc<dyn BreakpointControl>>,
    execution: Option<Arc<dyn ExecutionControl>>,
    checksum: Option<Arc<dyn ChecksumQuery>>,
    queue_sigabrt: bool,
}

impl DebugSessionBuilder {
    /// Channel name stamped on events and logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryAccess>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn registers(mut self, registers: Arc<dyn RegisterAccess>) -> Self {
        self.registers = Some(registers);
        self
    }

    pub fn breakpoints(mut self, breakpoints: Arc<dyn BreakpointControl>) -> Self {
        self.breakpoints = Some(breakpoints);
        self
    }

    pub fn execution(mut self, execution: Arc<dyn ExecutionControl>) -> Self {
        self.execution = Some(execution);
        self
    }

    pub fn checksum(mut self, checksum: Arc<dyn ChecksumQuery>) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// Also deliver SIGABRT stops to waiting breakpoints.
    pub fn queue_sigabrt(mut self, enabled: bool) -> Self {
        self.queue_sigabrt = enabled;
        self
    }

    pub fn build(self) -> DebugSession {
        DebugSession {
            inner: Arc::new(SessionInner {
                bus: self.bus,
                source: self.source,
                name: self.name,
                memory: self.memory,
                registers: self.registers,
                breakpoints: self.breakpoints,
                execution: self.execution,
                checksum: self.checksum,
                queue_sigabrt: self.queue_sigabrt,
                armed: Mutex::new(HashSet::new()),
            }),
        }
    }
}

impl DebugSession {
    pub fn builder(bus: EventBus, source: Source) -> DebugSessionBuilder {
        DebugSessionBuilder {
            bus,
            source,
            name: source.to_string(),
            memory: None,
            registers: None,
            breakpoints: None,
            execution: None,
            checksum: None,
            queue_sigabrt: false,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn source(&self) -> Source {
        self.inner.source
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Post an event stamped with this session's channel.
    pub fn post(&self, event: Event) -> Result<()> {
        self.inner.bus.post(event.with_channel(self.inner.name.clone()))
    }

    fn memory(&self) -> Result<&dyn MemoryAccess> {
        self.inner
            .memory
            .as_deref()
            .ok_or(SessionError::Unsupported("memory access"))
    }

    fn registers(&self) -> Result<&dyn RegisterAccess> {
        self.inner
            .registers
            .as_deref()
            .ok_or(SessionError::Unsupported("register access"))
    }

    fn breakpoint_control(&self) -> Result<&Arc<dyn BreakpointControl>> {
        self.inner
            .breakpoints
            .as_ref()
            .ok_or(SessionError::Unsupported("breakpoints"))
    }

    fn execution(&self) -> Result<&dyn ExecutionControl> {
        self.inner
            .execution
            .as_deref()
            .ok_or(SessionError::Unsupported("execution control"))
    }

    pub fn read_typed_memory(&self, address: u64, size: u8) -> Result<u64> {
        self.memory()?.read_typed(address, size)
    }

    pub fn write_typed_memory(&self, address: u64, size: u8, value: u64) -> Result<()> {
        self.memory()?.write_typed(address, size, value)
    }

    pub fn read_untyped_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.memory()?.read_untyped(address, len)
    }

    pub fn write_untyped_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.memory()?.write_untyped(address, data)
    }

    pub fn get_register(&self, name: &str) -> Result<u64> {
        self.registers()?.get_register(name)
    }

    pub fn set_register(&self, name: &str, value: u64) -> Result<()> {
        self.registers()?.set_register(name, value)
    }

    pub fn get_register_by_number(&self, number: usize) -> Result<u64> {
        self.registers()?.get_register_by_number(number)
    }

    pub fn cont(&self) -> Result<()> {
        debug!(session = %self.inner.name, "continue");
        self.execution()?.cont()
    }

    pub fn step(&self) -> Result<()> {
        self.execution()?.step()
    }

    pub fn halt(&self) -> Result<()> {
        self.execution()?.halt()
    }

    pub fn get_checksum(&self, address: u64, size: u64) -> Result<u64> {
        self.inner
            .checksum
            .as_deref()
            .ok_or(SessionError::Unsupported("checksum"))?
            .checksum(address, size)
    }

    /// Plant a breakpoint whose hits are queued for [`WaitingBreakpoint::wait`].
    pub fn set_breakpoint(
        &self,
        address: u64,
        options: &BreakpointOptions,
    ) -> Result<WaitingBreakpoint> {
        let id = self.plant(address, options)?;
        let (tx, rx) = mpsc::channel();
        let source = self.inner.source;
        let sigabrt = self.inner.queue_sigabrt;
        let listener = self.inner.bus.register(move |event: &Event| -> Result<()> {
            if matches_breakpoint(event, source, &id, sigabrt) {
                // A dropped handle leaves the breakpoint planted but unobserved.
                let _ = tx.send(event.clone());
            }
            Ok(())
        });
        Ok(WaitingBreakpoint::new(self.clone(), id, listener, rx))
    }

    /// Plant a breakpoint that runs `callback` on every hit.
    pub fn set_breakpoint_with_callback(
        &self,
        address: u64,
        options: &BreakpointOptions,
        callback: impl BreakpointCallback,
    ) -> Result<CallbackBreakpoint> {
        let id = self.plant(address, options)?;
        let source = self.inner.source;
        let session: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let listener = self.inner.bus.register(move |event: &Event| -> Result<()> {
            if !matches_breakpoint(event, source, &id, false) {
                return Ok(());
            }
            if let Some(inner) = session.upgrade() {
                callback.on_hit(&DebugSession { inner }, &id);
            }
            Ok(())
        });
        Ok(CallbackBreakpoint::new(self.clone(), id, listener))
    }

    fn plant(&self, address: u64, options: &BreakpointOptions) -> Result<BreakpointId> {
        let control = self.breakpoint_control()?;
        if !lock(&self.inner.armed).insert(address) {
            return Err(SessionError::BreakpointExists(address));
        }
        match control.insert_breakpoint(address, options) {
            Ok(id) => {
                info!(
                    session = %self.inner.name,
                    address = format_args!("0x{address:08x}"),
                    number = ?id.number,
                    "breakpoint set"
                );
                Ok(id)
            }
            Err(err) => {
                lock(&self.inner.armed).remove(&address);
                Err(err)
            }
        }
    }

    pub(crate) fn unplant(&self, id: &BreakpointId) -> Result<()> {
        lock(&self.inner.armed).remove(&id.address);
        self.breakpoint_control()?.remove_breakpoint(id)?;
        info!(
            session = %self.inner.name,
            address = format_args!("0x{:08x}", id.address),
            "breakpoint removed"
        );
        Ok(())
    }
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("name", &self.inner.name)
            .field("source", &self.inner.source)
            .field("memory", &self.inner.memory.is_some())
            .field("registers", &self.inner.registers.is_some())
            .field("breakpoints", &self.inner.breakpoints.is_some())
            .field("execution", &self.inner.execution.is_some())
            .field("checksum", &self.inner.checksum.is_some())
            .finish()
    }
}

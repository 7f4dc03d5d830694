//! Target backend for the on-target stub spoken to over binary RPC.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use fwbridge_proto::rpc::types::{arm_reg, vm_state};
use fwbridge_proto::rpc::{
    arm_register_number, RpcClient, RpcConfig, RpcHandlers, RpcMessage, MAX_UNTYPED_TRANSFER,
};
use fwbridge_proto::ProtoError;
use fwbridge_transport::BridgeStream;
use tracing::{debug, error, info, warn};

use crate::bus::{lock, EventBus};
use crate::capability::{
    check_typed_size, BreakpointControl, BreakpointId, BreakpointOptions, ExecutionControl,
    MemoryAccess, RegisterAccess, ARM_REGISTERS,
};
use crate::error::{Result, SessionError};
use crate::event::{Event, EventTag, Source};
use crate::session::DebugSession;

/// ARM `bkpt` instruction planted for ARM-mode breakpoints.
pub const ARM_BKPT: u32 = 0xe120_0071;
/// Thumb `bkpt` instruction planted for Thumb-mode breakpoints.
pub const THUMB_BKPT: u16 = 0xbe01;

pub const CHANNEL: &str = "avatar";

#[derive(Debug, Clone, Copy)]
struct SoftBreakpoint {
    thumb: bool,
    /// Instruction replaced by the breakpoint while it is planted.
    saved: Option<u32>,
}

impl SoftBreakpoint {
    fn width(&self) -> u8 {
        if self.thumb {
            2
        } else {
            4
        }
    }

    fn instruction(&self) -> u32 {
        if self.thumb {
            u32::from(THUMB_BKPT)
        } else {
            ARM_BKPT
        }
    }
}

pub struct StubTarget {
    client: RpcClient,
    bus: EventBus,
    breakpoints: Mutex<BTreeMap<u32, SoftBreakpoint>>,
}

impl StubTarget {
    /// Start the RPC client on `stream` and the worker that turns STATE
    /// notifications into events.
    pub fn start(stream: BridgeStream, bus: EventBus, config: RpcConfig) -> Result<Arc<Self>> {
        Self::start_with(stream, bus, config, RpcHandlers::new())
    }

    /// Like [`start`](Self::start), with page-fault and exception handlers.
    /// A notification sink in `handlers` is replaced.
    pub fn start_with(
        stream: BridgeStream,
        bus: EventBus,
        config: RpcConfig,
        handlers: RpcHandlers,
    ) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel();
        let handlers = handlers.on_notification(move |message: &RpcMessage| {
            if let RpcMessage::State { state } = message {
                // The worker exits with the target.
                let _ = tx.send(*state);
            }
        });
        let client = RpcClient::connect(stream, handlers, config)?;
        info!("connected to avatar stub");
        let target = Arc::new(Self {
            client,
            bus,
            breakpoints: Mutex::new(BTreeMap::new()),
        });
        let weak = Arc::downgrade(&target);
        thread::Builder::new()
            .name("fwbridge-stub-events".into())
            .spawn(move || state_loop(weak, rx))?;
        Ok(target)
    }

    /// A session exposing this target's capabilities.
    pub fn session(self: &Arc<Self>) -> DebugSession {
        DebugSession::builder(self.bus.clone(), Source::Target)
            .name(CHANNEL)
            .memory(self.clone())
            .registers(self.clone())
            .breakpoints(self.clone())
            .execution(self.clone())
            .build()
    }

    /// The underlying RPC client, for paging and exception configuration.
    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn install_codelet(&self, address: u64, codelet: &[u8]) -> Result<()> {
        debug!(
            address = format_args!("0x{address:08x}"),
            len = codelet.len(),
            "installing codelet"
        );
        self.write_untyped(address, codelet)
    }

    pub fn execute_codelet(&self, address: u64) -> Result<()> {
        Ok(self.client.execute_codelet(narrow(address, "address")?)?)
    }

    pub fn stop(&self) {
        self.client.stop();
    }

    fn pc(&self) -> Result<u32> {
        Ok(self.client.get_register(arm_reg::PC)?)
    }

    fn on_state(&self, state: u8) -> Result<()> {
        if state & vm_state::RUNNING != 0 {
            return self
                .bus
                .post(Event::new(Source::Target, [EventTag::Running]).with_channel(CHANNEL));
        }
        if state & vm_state::PAGE_MISS != 0 {
            debug!(state, "vm halted on page miss");
            return Ok(());
        }
        let pc = self.pc()?;
        debug!(state, pc = format_args!("0x{pc:08x}"), "vm stopped");
        self.bus.post(
            Event::new(Source::Target, [EventTag::Stopped, EventTag::Breakpoint])
                .with_channel(CHANNEL)
                .with_address(u64::from(pc))
                .with_extra("state", state.into()),
        )
    }
}

fn state_loop(target: Weak<StubTarget>, states: Receiver<u8>) {
    for state in states {
        let Some(target) = target.upgrade() else {
            break;
        };
        if let Err(err) = target.on_state(state) {
            error!(%err, state, "failed to report stub state");
        }
    }
    debug!("stub event worker exiting");
}

fn narrow(value: u64, field: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        SessionError::Proto(ProtoError::InvalidField {
            field,
            reason: format!("0x{value:x} does not fit in 32 bits"),
        })
    })
}

impl MemoryAccess for StubTarget {
    fn read_typed(&self, address: u64, size: u8) -> Result<u64> {
        check_typed_size(size)?;
        let value = self.client.read_memory(narrow(address, "address")?, size)?;
        Ok(u64::from(value))
    }

    fn write_typed(&self, address: u64, size: u8, value: u64) -> Result<()> {
        check_typed_size(size)?;
        self.client
            .write_memory(narrow(address, "address")?, size, narrow(value, "value")?)?;
        Ok(())
    }

    fn read_untyped(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(len.min(MAX_UNTYPED_TRANSFER));
        while data.len() < len {
            let chunk = (len - data.len()).min(MAX_UNTYPED_TRANSFER);
            let at = narrow(address.saturating_add(data.len() as u64), "address")?;
            let bytes = self.client.read_untyped_memory(at, chunk)?;
            // Each reply must carry exactly the requested chunk.
            if bytes.len() != chunk {
                return Err(SessionError::Proto(ProtoError::InvalidField {
                    field: "data",
                    reason: format!("requested {chunk} bytes at 0x{at:08x}, got {}", bytes.len()),
                }));
            }
            data.extend_from_slice(&bytes);
        }
        Ok(data)
    }

    fn write_untyped(&self, address: u64, data: &[u8]) -> Result<()> {
        for (index, chunk) in data.chunks(MAX_UNTYPED_TRANSFER).enumerate() {
            let at = address + (index * MAX_UNTYPED_TRANSFER) as u64;
            self.client
                .write_untyped_memory(narrow(at, "address")?, chunk)?;
        }
        Ok(())
    }
}

impl RegisterAccess for StubTarget {
    fn get_register(&self, name: &str) -> Result<u64> {
        let number = arm_register_number(name)
            .ok_or_else(|| SessionError::UnknownRegister(name.to_string()))?;
        Ok(u64::from(self.client.get_register(number)?))
    }

    fn set_register(&self, name: &str, value: u64) -> Result<()> {
        let number = arm_register_number(name)
            .ok_or_else(|| SessionError::UnknownRegister(name.to_string()))?;
        self.client.set_register(number, narrow(value, "value")?)?;
        Ok(())
    }

    fn get_register_by_number(&self, number: usize) -> Result<u64> {
        if number >= ARM_REGISTERS.len() {
            return Err(SessionError::UnknownRegister(number.to_string()));
        }
        Ok(u64::from(self.client.get_register(number as u8)?))
    }
}

impl BreakpointControl for StubTarget {
    /// Record the breakpoint; the instruction is planted on the next `cont`.
    fn insert_breakpoint(
        &self,
        address: u64,
        options: &BreakpointOptions,
    ) -> Result<BreakpointId> {
        let key = narrow(address, "address")?;
        let mut breakpoints = lock(&self.breakpoints);
        if breakpoints.contains_key(&key) {
            return Err(SessionError::BreakpointExists(address));
        }
        if options.hardware {
            warn!(
                address = format_args!("0x{address:08x}"),
                "stub has no hardware breakpoints; using software"
            );
        }
        breakpoints.insert(
            key,
            SoftBreakpoint {
                thumb: options.thumb,
                saved: None,
            },
        );
        Ok(BreakpointId::at(address))
    }

    fn remove_breakpoint(&self, id: &BreakpointId) -> Result<()> {
        let key = narrow(id.address, "address")?;
        let removed = lock(&self.breakpoints)
            .remove(&key)
            .ok_or(SessionError::NoSuchBreakpoint(id.address))?;
        if let Some(original) = removed.saved {
            self.client
                .write_memory(key, removed.width(), original)?;
        }
        Ok(())
    }
}

impl ExecutionControl for StubTarget {
    /// Plant every breakpoint except the one at pc, then resume the VM.
    fn cont(&self) -> Result<()> {
        let pc = self.pc()?;
        {
            let mut breakpoints = lock(&self.breakpoints);
            for (&address, bkpt) in breakpoints.iter_mut() {
                if address == pc {
                    if let Some(original) = bkpt.saved.take() {
                        self.client.write_memory(address, bkpt.width(), original)?;
                    }
                    continue;
                }
                if bkpt.saved.is_none() {
                    bkpt.saved = Some(self.client.read_memory(address, bkpt.width())?);
                    self.client
                        .write_memory(address, bkpt.width(), bkpt.instruction())?;
                }
            }
        }
        debug!(pc = format_args!("0x{pc:08x}"), "resuming stub vm");
        self.client.resume_vm()?;
        Ok(())
    }
}

impl fmt::Debug for StubTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubTarget")
            .field("client", &self.client)
            .field("breakpoints", &lock(&self.breakpoints).len())
            .finish()
    }
}

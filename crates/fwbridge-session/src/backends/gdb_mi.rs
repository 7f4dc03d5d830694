//! Backend driving a GDB instance over the machine interface.

use std::fmt;
use std::sync::Arc;

use fwbridge_proto::mi::{
    parse_integer, AsyncKind, BreakpointRequest, GdbMi, MiClient, MiConfig, MiHandlers, Results,
    Value,
};
use fwbridge_transport::{BridgeStream, Endpoint};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::capability::{
    check_typed_size, BreakpointControl, BreakpointId, BreakpointOptions, ChecksumQuery,
    ExecutionControl, MemoryAccess, RegisterAccess,
};
use crate::error::{Result, SessionError};
use crate::event::{Event, EventTag, Source};
use crate::session::DebugSession;

pub const CHANNEL: &str = "gdb";

/// Stop address reported when a signal stop carries no frame.
pub const UNKNOWN_SIGNAL_ADDRESS: u64 = 0xDEAD_DEAD;

pub struct GdbMiTarget {
    gdb: GdbMi,
    bus: EventBus,
    source: Source,
}

impl GdbMiTarget {
    /// Start an MI client on `stream` (a GDB speaking `--interpreter=mi`)
    /// and configure it for scripted use.
    pub fn start(
        stream: BridgeStream,
        bus: EventBus,
        source: Source,
        config: MiConfig,
    ) -> Result<Arc<Self>> {
        let events = bus.clone();
        let handlers = MiHandlers::new().on_async(
            move |kind: AsyncKind, class: &str, results: &Results| {
                let Some(event) = async_event(source, kind, class, results) else {
                    return;
                };
                if let Err(err) = events.post(event) {
                    warn!(%err, class, "dropping gdb event");
                }
            },
        );
        let gdb = GdbMi::new(MiClient::connect(stream, handlers, config)?);
        gdb.init()?;
        info!(%source, "gdb machine interface ready");
        Ok(Arc::new(Self { gdb, bus, source }))
    }

    /// Point GDB at a gdbserver.
    pub fn attach(&self, endpoint: &Endpoint) -> Result<()> {
        self.gdb.connect(endpoint)?;
        info!(%endpoint, "gdb attached to remote target");
        Ok(())
    }

    pub fn session(self: &Arc<Self>) -> DebugSession {
        DebugSession::builder(self.bus.clone(), self.source)
            .name(CHANNEL)
            .memory(self.clone())
            .registers(self.clone())
            .breakpoints(self.clone())
            .execution(self.clone())
            .checksum(self.clone())
            .queue_sigabrt(true)
            .build()
    }

    pub fn gdb(&self) -> &GdbMi {
        &self.gdb
    }

    pub fn execute_command(&self, command: &str) -> Result<Results> {
        Ok(self.gdb.execute_command(command)?)
    }

    pub fn stop(&self) {
        self.gdb.stop();
    }
}

fn frame_address(results: &Results) -> Option<u64> {
    results
        .get("frame")
        .and_then(|frame| frame.get("addr"))
        .and_then(Value::as_str)
        .and_then(parse_integer)
}

/// Map an exec async record to an event.
pub(crate) fn async_event(
    source: Source,
    kind: AsyncKind,
    class: &str,
    results: &Results,
) -> Option<Event> {
    if kind != AsyncKind::Exec {
        return None;
    }
    match class {
        "running" => Some(Event::new(source, [EventTag::Running]).with_channel(CHANNEL)),
        "stopped" => {
            let reason = results.get_str("reason").unwrap_or_default();
            let address = frame_address(results);
            let mut event = match reason {
                "breakpoint-hit" => {
                    let mut event = Event::new(source, [EventTag::Stopped, EventTag::Breakpoint]);
                    if let Some(number) = results.get_str("bkptno").and_then(|n| n.parse().ok()) {
                        event = event.with_bkpt_number(number);
                    }
                    event
                }
                "end-stepping-range" => {
                    Event::new(source, [EventTag::Stopped, EventTag::EndStepping])
                }
                "signal-received" => {
                    return Some(
                        Event::new(source, [EventTag::Stopped, EventTag::SigAbrt])
                            .with_channel(CHANNEL)
                            .with_address(address.unwrap_or(UNKNOWN_SIGNAL_ADDRESS))
                            .with_extra(
                                "signal_name",
                                results.get_str("signal-name").unwrap_or_default().into(),
                            ),
                    );
                }
                other => {
                    debug!(reason = other, "stop with unmapped reason");
                    Event::new(source, [EventTag::Stopped]).with_extra("reason", other.into())
                }
            };
            if let Some(address) = address {
                event = event.with_address(address);
            }
            Some(event.with_channel(CHANNEL))
        }
        _ => None,
    }
}

impl MemoryAccess for GdbMiTarget {
    fn read_typed(&self, address: u64, size: u8) -> Result<u64> {
        check_typed_size(size)?;
        Ok(self.gdb.read_memory(address, size)?)
    }

    fn write_typed(&self, address: u64, size: u8, value: u64) -> Result<()> {
        check_typed_size(size)?;
        Ok(self.gdb.write_memory(address, size, value)?)
    }
}

impl RegisterAccess for GdbMiTarget {
    fn get_register(&self, name: &str) -> Result<u64> {
        Ok(self.gdb.get_register(name)?)
    }

    fn set_register(&self, name: &str, value: u64) -> Result<()> {
        Ok(self.gdb.set_register(name, value)?)
    }

    /// Uses GDB's own register numbering.
    fn get_register_by_number(&self, number: usize) -> Result<u64> {
        Ok(self.gdb.get_register_by_number(number)?)
    }
}

impl BreakpointControl for GdbMiTarget {
    fn insert_breakpoint(
        &self,
        address: u64,
        options: &BreakpointOptions,
    ) -> Result<BreakpointId> {
        let mut request = BreakpointRequest::at(address);
        if options.temporary {
            request = request.temporary();
        }
        if options.hardware {
            request = request.hardware();
        }
        let number = self.gdb.insert_breakpoint(&request)?;
        Ok(BreakpointId {
            address,
            number: Some(number),
        })
    }

    fn remove_breakpoint(&self, id: &BreakpointId) -> Result<()> {
        let number = id.number.ok_or(SessionError::NoSuchBreakpoint(id.address))?;
        Ok(self.gdb.delete_breakpoint(number)?)
    }
}

impl ExecutionControl for GdbMiTarget {
    fn cont(&self) -> Result<()> {
        Ok(self.gdb.cont()?)
    }

    fn step(&self) -> Result<()> {
        Ok(self.gdb.step_instruction()?)
    }

    fn halt(&self) -> Result<()> {
        Ok(self.gdb.interrupt()?)
    }
}

impl ChecksumQuery for GdbMiTarget {
    fn checksum(&self, address: u64, size: u64) -> Result<u64> {
        Ok(self.gdb.get_checksum(address, size)?)
    }
}

impl fmt::Debug for GdbMiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GdbMiTarget")
            .field("gdb", &self.gdb)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use fwbridge_proto::mi::{parse_record, Record};

    use super::*;
    use crate::bus::{lock, EventWaiter};

    fn exec(line: &str) -> Option<Event> {
        match parse_record(line).expect("should parse") {
            Record::Async {
                kind,
                class,
                results,
            } => async_event(Source::Target, kind, &class, &results),
            other => panic!("not an async record: {other}"),
        }
    }

    #[test]
    fn maps_running() {
        let event = exec("*running,thread-id=\"all\"").expect("should map");
        assert!(event.has_tag(EventTag::Running));
        assert_eq!(event.channel.as_deref(), Some(CHANNEL));
    }

    #[test]
    fn maps_breakpoint_hit() {
        let event = exec(
            "*stopped,reason=\"breakpoint-hit\",disp=\"keep\",bkptno=\"1\",frame={addr=\"0x080483ed\",func=\"main\"}",
        )
        .expect("should map");
        assert!(event.has_tag(EventTag::Stopped));
        assert!(event.has_tag(EventTag::Breakpoint));
        assert_eq!(event.address(), Some(0x080483ed));
        assert_eq!(event.properties.bkpt_number, Some(1));
    }

    #[test]
    fn maps_end_stepping() {
        let event = exec("*stopped,reason=\"end-stepping-range\",frame={addr=\"0x100\"}")
            .expect("should map");
        assert!(event.has_tag(EventTag::EndStepping));
        assert_eq!(event.address(), Some(0x100));
    }

    #[test]
    fn signal_without_frame_uses_placeholder() {
        let event = exec("*stopped,reason=\"signal-received\",signal-name=\"SIGABRT\"")
            .expect("should map");
        assert!(event.has_tag(EventTag::SigAbrt));
        assert_eq!(event.address(), Some(UNKNOWN_SIGNAL_ADDRESS));
    }

    #[test]
    fn ignores_notify_records() {
        assert!(exec("=thread-group-added,id=\"i1\"").is_none());
    }

    #[test]
    fn breakpoint_hit_reaches_waiting_breakpoint() {
        let (host, peer) = BridgeStream::pair().expect("should create pair");
        let commands = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&commands);
        thread::spawn(move || {
            let mut out = peer.try_clone().expect("should clone");
            for line in BufReader::new(peer).lines() {
                let Ok(line) = line else { break };
                let split = line
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(line.len());
                let (token, command) = line.split_at(split);
                lock(&seen).push(command.to_string());
                let reply = if command.starts_with("-break-insert") {
                    format!("{token}^done,bkpt={{number=\"4\",addr=\"0x00008000\"}}\n")
                } else if command == "-exec-continue" {
                    format!(
                        "{token}^running\n*running,thread-id=\"all\"\n(gdb) \n\
                         *stopped,reason=\"breakpoint-hit\",bkptno=\"4\",frame={{addr=\"0x00008000\"}}\n"
                    )
                } else {
                    format!("{token}^done\n")
                };
                if out.write_all(reply.as_bytes()).is_err() {
                    break;
                }
            }
        });

        let bus = EventBus::new().expect("should start bus");
        let config = MiConfig::default().with_command_timeout(Some(Duration::from_secs(2)));
        let target =
            GdbMiTarget::start(host, bus.clone(), Source::Target, config).expect("should start");
        let session = target.session();
        let running = EventWaiter::filtered(&bus, |e: &Event| e.has_tag(EventTag::Running));

        let bp = session
            .set_breakpoint(0x8000, &BreakpointOptions::default())
            .expect("should insert");
        assert_eq!(bp.id().number, Some(4));
        session.cont().expect("should continue");

        running
            .wait(Some(Duration::from_secs(2)))
            .expect("should see running");
        let hit = bp.wait(Some(Duration::from_secs(2))).expect("should hit");
        assert_eq!(hit.properties.bkpt_number, Some(4));

        bp.delete().expect("should delete");
        assert!(lock(&commands).iter().any(|c| c == "-break-delete 4"));
        target.stop();
    }
}

//! Backend for a gdbserver-style stub spoken to over the remote serial
//! protocol.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use fwbridge_proto::rpc::arm_register_number;
use fwbridge_proto::rpc::types::arm_reg;
use fwbridge_proto::rsp::{BreakpointKind, RspClient, RspConfig, StopReply};
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

pub const CHANNEL: &str = "gdb-remote";

/// GDB's register number for cpsr in the ARM target description.
const CPSR_REGNUM: u32 = 25;
const SIGTRAP: u8 = 5;
const STOP_POLL: Duration = Duration::from_millis(500);

pub struct RemoteTarget {
    client: RspClient,
    bus: EventBus,
    source: Source,
    /// Last `g` reply: r0..r15 as little-endian words, cpsr in the final word.
    registers: Mutex<Option<Vec<u8>>>,
    breakpoints: Mutex<HashMap<u64, (BreakpointKind, u32)>>,
    stepping: AtomicBool,
}

impl RemoteTarget {
    /// Start the client and a watcher that turns stop replies into events.
    pub fn start(
        stream: BridgeStream,
        bus: EventBus,
        source: Source,
        config: RspConfig,
    ) -> Result<Arc<Self>> {
        let client = RspClient::connect(stream, config)?;
        info!(%source, "connected to remote stub");
        let target = Arc::new(Self {
            client,
            bus,
            source,
            registers: Mutex::new(None),
            breakpoints: Mutex::new(HashMap::new()),
            stepping: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&target);
        thread::Builder::new()
            .name("fwbridge-rsp-stops".into())
            .spawn(move || watch_stops(weak))?;
        Ok(target)
    }

    pub fn session(self: &Arc<Self>) -> DebugSession {
        DebugSession::builder(self.bus.clone(), self.source)
            .name(CHANNEL)
            .memory(self.clone())
            .registers(self.clone())
            .breakpoints(self.clone())
            .execution(self.clone())
            .build()
    }

    pub fn client(&self) -> &RspClient {
        &self.client
    }

    pub fn stop(&self) {
        self.client.stop();
    }

    fn invalidate(&self) {
        lock(&self.registers).take();
    }

    fn register_file(&self) -> Result<Vec<u8>> {
        let mut cache = lock(&self.registers);
        if let Some(file) = cache.as_ref() {
            return Ok(file.clone());
        }
        let file = self.client.read_registers()?.to_vec();
        if file.len() < 17 * 4 {
            return Err(SessionError::Proto(ProtoError::UnexpectedReply {
                expected: "at least 17 registers".into(),
                received: format!("{} bytes", file.len()),
            }));
        }
        *cache = Some(file.clone());
        Ok(file)
    }

    fn on_stop(&self, reply: StopReply) -> Result<()> {
        self.invalidate();
        let stepping = self.stepping.swap(false, Ordering::AcqRel);
        let Some(signal) = reply.signal() else {
            info!(?reply, "remote process exited");
            return self.bus.post(
                Event::new(self.source, [EventTag::Stopped])
                    .with_channel(CHANNEL)
                    .with_extra("exited", true.into()),
            );
        };
        let pc = self.get_register_by_number(usize::from(arm_reg::PC))?;
        let tag = match signal {
            SIGTRAP if stepping => EventTag::EndStepping,
            SIGTRAP => EventTag::Breakpoint,
            _ => EventTag::SigAbrt,
        };
        debug!(signal, pc = format_args!("0x{pc:08x}"), %tag, "remote target stopped");
        self.bus.post(
            Event::new(self.source, [EventTag::Stopped, tag])
                .with_channel(CHANNEL)
                .with_address(pc)
                .with_signal(signal),
        )
    }
}

fn watch_stops(target: Weak<RemoteTarget>) {
    loop {
        let Some(target) = target.upgrade() else {
            break;
        };
        match target.client.wait_stop(Some(STOP_POLL)) {
            Ok(reply) => {
                if let Err(err) = target.on_stop(reply) {
                    error!(%err, "failed to report remote stop");
                }
            }
            Err(ProtoError::Timeout(_)) => {}
            Err(ProtoError::ConnectionLost) => break,
            Err(err) => warn!(%err, "bad stop reply"),
        }
    }
    debug!("stop watcher exiting");
}

fn little_endian(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
}

fn to_little_endian(value: u64, size: u8) -> Vec<u8> {
    value.to_le_bytes()[..usize::from(size)].to_vec()
}

impl MemoryAccess for RemoteTarget {
    fn read_typed(&self, address: u64, size: u8) -> Result<u64> {
        check_typed_size(size)?;
        let data = self.client.read_memory(address, usize::from(size))?;
        if data.len() != usize::from(size) {
            return Err(SessionError::Proto(ProtoError::UnexpectedReply {
                expected: format!("{size} bytes"),
                received: format!("{} bytes", data.len()),
            }));
        }
        Ok(little_endian(&data))
    }

    fn write_typed(&self, address: u64, size: u8, value: u64) -> Result<()> {
        check_typed_size(size)?;
        self.client
            .write_memory(address, &to_little_endian(value, size))?;
        Ok(())
    }

    fn read_untyped(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.client.read_memory(address, len)?.to_vec())
    }

    fn write_untyped(&self, address: u64, data: &[u8]) -> Result<()> {
        Ok(self.client.write_memory(address, data)?)
    }
}

impl RegisterAccess for RemoteTarget {
    fn get_register(&self, name: &str) -> Result<u64> {
        let number = arm_register_number(name)
            .ok_or_else(|| SessionError::UnknownRegister(name.to_string()))?;
        self.get_register_by_number(usize::from(number))
    }

    fn set_register(&self, name: &str, value: u64) -> Result<()> {
        let number = arm_register_number(name)
            .ok_or_else(|| SessionError::UnknownRegister(name.to_string()))?;
        let regnum = if number == arm_reg::CPSR {
            CPSR_REGNUM
        } else {
            u32::from(number)
        };
        self.invalidate();
        self.client
            .write_register(regnum, &to_little_endian(value, 4))?;
        Ok(())
    }

    fn get_register_by_number(&self, number: usize) -> Result<u64> {
        if number >= ARM_REGISTERS.len() {
            return Err(SessionError::UnknownRegister(number.to_string()));
        }
        let file = self.register_file()?;
        let word = if number == usize::from(arm_reg::CPSR) {
            &file[file.len() - 4..]
        } else {
            &file[number * 4..number * 4 + 4]
        };
        Ok(little_endian(word))
    }
}

impl BreakpointControl for RemoteTarget {
    fn insert_breakpoint(
        &self,
        address: u64,
        options: &BreakpointOptions,
    ) -> Result<BreakpointId> {
        let kind = if options.hardware {
            BreakpointKind::Hardware
        } else {
            BreakpointKind::Software
        };
        let len = if options.thumb { 2 } else { 4 };
        if !self.client.insert_breakpoint(kind, address, len)? {
            return Err(SessionError::Unsupported("this breakpoint kind"));
        }
        lock(&self.breakpoints).insert(address, (kind, len));
        Ok(BreakpointId::at(address))
    }

    fn remove_breakpoint(&self, id: &BreakpointId) -> Result<()> {
        let (kind, len) = lock(&self.breakpoints)
            .remove(&id.address)
            .ok_or(SessionError::NoSuchBreakpoint(id.address))?;
        self.client.remove_breakpoint(kind, id.address, len)?;
        Ok(())
    }
}

impl ExecutionControl for RemoteTarget {
    /// Running is posted before the resume so it precedes the stop event.
    fn cont(&self) -> Result<()> {
        self.invalidate();
        self.bus
            .post(Event::new(self.source, [EventTag::Running]).with_channel(CHANNEL))?;
        Ok(self.client.cont(None)?)
    }

    fn step(&self) -> Result<()> {
        self.invalidate();
        self.stepping.store(true, Ordering::Release);
        if let Err(err) = self.client.step(None) {
            self.stepping.store(false, Ordering::Release);
            return Err(err.into());
        }
        Ok(())
    }

    fn halt(&self) -> Result<()> {
        Ok(self.client.interrupt()?)
    }
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("client", &self.client)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread::JoinHandle;

    use fwbridge_frame::{FrameReader, FrameWriter, RspCodec, RspFrame};
    use fwbridge_proto::rsp::encode_hex;

    use super::*;
    use crate::bus::EventWaiter;

    const WAIT: Option<Duration> = Some(Duration::from_secs(2));

    /// 16 general registers (rN = N * 0x11) plus padding and cpsr last.
    fn register_file(pc: u32) -> String {
        let mut words: Vec<u32> = (0..16).map(|n| n * 0x11).collect();
        words[15] = pc;
        let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        bytes.extend_from_slice(&[0; 8]);
        bytes.extend_from_slice(&0x6000_01d3u32.to_le_bytes());
        encode_hex(&bytes)
    }

    fn fake_gdbserver(stream: BridgeStream) -> JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let mut reader =
                FrameReader::new(stream.try_clone().expect("should clone"), RspCodec::new());
            let mut writer = FrameWriter::new(stream, RspCodec::new());
            let mut seen = Vec::new();
            let mut pc = 0x1000;
            while let Ok(frame) = reader.read_frame() {
                let RspFrame::Packet(payload) = frame else {
                    continue;
                };
                let packet = String::from_utf8_lossy(&payload).into_owned();
                if writer.send(&RspFrame::Ack).is_err() {
                    break;
                }
                let replies: Vec<String> = match packet.as_bytes()[0] {
                    b'g' => vec![register_file(pc)],
                    b'm' => vec!["efbeadde".into()],
                    b'M' | b'P' | b'Z' | b'z' => vec!["OK".into()],
                    b'c' => {
                        pc = 0x2000;
                        vec!["S05".into()]
                    }
                    b's' => {
                        pc += 4;
                        vec!["S05".into()]
                    }
                    _ => vec![String::new()],
                };
                for reply in replies {
                    if writer.send(&RspFrame::packet(reply.into_bytes())).is_err() {
                        break;
                    }
                }
                seen.push(packet);
            }
            seen
        })
    }

    fn start() -> (Arc<RemoteTarget>, EventBus, JoinHandle<Vec<String>>) {
        let (host, peer) = BridgeStream::pair().expect("should create pair");
        let server = fake_gdbserver(peer);
        let bus = EventBus::new().expect("should start bus");
        let config = RspConfig::default()
            .with_ack_timeout(Duration::from_secs(1))
            .with_response_timeout(Duration::from_secs(1));
        let target =
            RemoteTarget::start(host, bus.clone(), Source::Target, config).expect("should start");
        (target, bus, server)
    }

    #[test]
    fn registers_come_from_one_g_packet() {
        let (target, _bus, server) = start();
        assert_eq!(target.get_register("r3").expect("should read"), 0x33);
        assert_eq!(target.get_register("pc").expect("should read"), 0x1000);
        assert_eq!(target.get_register("cpsr").expect("should read"), 0x6000_01d3);
        target.set_register("cpsr", 0x10).expect("should write");
        assert_eq!(target.get_register("sp").expect("should read"), 13 * 0x11);
        target.stop();

        let seen = server.join().expect("server thread");
        assert_eq!(seen, vec!["g", "P19=10000000", "g"]);
    }

    #[test]
    fn typed_memory_is_little_endian() {
        let (target, _bus, server) = start();
        assert_eq!(target.read_typed(0x20, 4).expect("should read"), 0xdeadbeef);
        target.write_typed(0x20, 2, 0x1234).expect("should write");
        target.stop();
        let seen = server.join().expect("server thread");
        assert_eq!(seen, vec!["m20,4", "M20,2:3412"]);
    }

    #[test]
    fn breakpoint_stop_becomes_event() {
        let (target, bus, server) = start();
        let session = target.session();
        let waiter = EventWaiter::new(&bus);
        let bp = session
            .set_breakpoint(0x2000, &BreakpointOptions::thumb())
            .expect("should insert");
        session.cont().expect("should continue");

        assert!(waiter.wait(WAIT).expect("running").has_tag(EventTag::Running));
        let stop = waiter.wait(WAIT).expect("stop");
        assert!(stop.has_tag(EventTag::Breakpoint));
        assert_eq!(stop.address(), Some(0x2000));
        assert_eq!(stop.properties.signal, Some(SIGTRAP));
        bp.wait(WAIT).expect("breakpoint should be hit");

        session.step().expect("should step");
        let stepped = waiter.wait(WAIT).expect("step stop");
        assert!(stepped.has_tag(EventTag::EndStepping));
        assert_eq!(stepped.address(), Some(0x2004));

        bp.delete().expect("should remove");
        drop(waiter);
        target.stop();
        let seen = server.join().expect("server thread");
        assert!(seen.contains(&"Z0,2000,2".to_string()));
        assert!(seen.contains(&"z0,2000,2".to_string()));
    }
}

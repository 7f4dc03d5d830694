//! Remote-serial-protocol server that lets a stock GDB drive a
//! [`DebugSession`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use fwbridge_frame::{
    FrameConfig, FrameError, FrameReader, FrameWriter, RspCodec, RspFrame, DEFAULT_MAX_FRAME,
};
use fwbridge_proto::rsp::{decode_hex, encode_hex, parse_hex_u64};
use fwbridge_proto::ProtoError;
use fwbridge_transport::{BridgeListener, BridgeStream, Endpoint, StopSignal};
use tracing::{debug, error, info, trace, warn};

use crate::breakpoint::WaitingBreakpoint;
use crate::bus::{lock, EventBus, ListenerId};
use crate::capability::{BreakpointOptions, ARM_REGISTERS};
use crate::error::{Result, SessionError};
use crate::event::{Event, EventTag};
use crate::session::DebugSession;

/// GDB's ARM numbering puts cpsr after the FPA registers.
const GDB_CPSR_REGNUM: usize = 25;

const STOP_REPLY: &str = "S05";
const ERROR_REPLY: &str = "E01";

/// Largest `m`/`M` transfer; the hex reply must fit in one packet.
const MAX_MEMORY_TRANSFER: usize = DEFAULT_MAX_FRAME / 2;

type SharedWriter = Arc<Mutex<FrameWriter<BridgeStream, RspCodec>>>;

fn invalid(field: &'static str, reason: impl Into<String>) -> SessionError {
    SessionError::Proto(ProtoError::InvalidField {
        field,
        reason: reason.into(),
    })
}

fn register_name(number: usize) -> Result<&'static str> {
    match number {
        GDB_CPSR_REGNUM => Ok("cpsr"),
        n => ARM_REGISTERS
            .get(n)
            .copied()
            .ok_or_else(|| SessionError::UnknownRegister(format!("#{n}"))),
    }
}

fn hex_number(text: &str, field: &'static str) -> Result<u64> {
    parse_hex_u64(text.as_bytes()).map_err(|_| invalid(field, format!("{text:?}")))
}

fn address_and_length(text: &str) -> Result<(u64, usize)> {
    let (address, length) = text
        .split_once(',')
        .ok_or_else(|| invalid("packet", format!("expected addr,length in {text:?}")))?;
    let length = hex_number(length, "length")?;
    let length = usize::try_from(length)
        .ok()
        .filter(|&length| length <= MAX_MEMORY_TRANSFER)
        .ok_or_else(|| {
            invalid(
                "length",
                format!("0x{length:x} exceeds {MAX_MEMORY_TRANSFER} bytes"),
            )
        })?;
    Ok((hex_number(address, "address")?, length))
}

/// Packet handling over one session. Breakpoints set by the client outlive
/// individual connections.
struct Handler {
    session: DebugSession,
    breakpoints: Mutex<HashMap<u64, WaitingBreakpoint>>,
}

impl Handler {
    /// Returns the reply payload, or `None` for packets answered later by a
    /// stop reply.
    fn handle(&self, packet: &str) -> Result<Option<String>> {
        let Some(opcode) = packet.chars().next() else {
            return Ok(Some(String::new()));
        };
        let args = &packet[opcode.len_utf8()..];
        match opcode {
            'm' => self.read_memory(args).map(Some),
            'M' => self.write_memory(args).map(|()| Some("OK".into())),
            'g' => self.read_registers().map(Some),
            'G' => self.write_registers(args).map(|()| Some("OK".into())),
            'p' => {
                let name = register_name(hex_number(args, "register")? as usize)?;
                let value = self.session.get_register(name)?;
                Ok(Some(encode_hex(&(value as u32).to_le_bytes())))
            }
            'P' => {
                let (number, value) = args
                    .split_once('=')
                    .ok_or_else(|| invalid("packet", format!("expected n=value in {args:?}")))?;
                let name = register_name(hex_number(number, "register")? as usize)?;
                let value = le_word(&decode_hex(value.as_bytes())?)?;
                self.session.set_register(name, value)?;
                Ok(Some("OK".into()))
            }
            'c' => self.session.cont().map(|()| None),
            's' => self.session.step().map(|()| None),
            'Z' => self.insert_breakpoint(args).map(Some),
            'z' => self.remove_breakpoint(args).map(Some),
            '?' => Ok(Some(STOP_REPLY.into())),
            'v' | 'q' | 'H' => {
                debug!(packet, "unsupported query");
                Ok(Some(String::new()))
            }
            _ => {
                warn!(packet, "unknown packet");
                Ok(Some(String::new()))
            }
        }
    }

    fn read_memory(&self, args: &str) -> Result<String> {
        let (address, length) = address_and_length(args)?;
        match length {
            1 | 2 | 4 => {
                let value = self.session.read_typed_memory(address, length as u8)?;
                Ok(encode_hex(&value.to_le_bytes()[..length]))
            }
            _ => Ok(encode_hex(&self.session.read_untyped_memory(address, length)?)),
        }
    }

    fn write_memory(&self, args: &str) -> Result<()> {
        let (header, data) = args
            .split_once(':')
            .ok_or_else(|| invalid("packet", "missing ':' in M packet"))?;
        let (address, length) = address_and_length(header)?;
        let data = decode_hex(data.as_bytes())?;
        if data.len() != length {
            return Err(invalid(
                "length",
                format!("header says {length}, got {} bytes", data.len()),
            ));
        }
        match length {
            1 | 2 | 4 => self
                .session
                .write_typed_memory(address, length as u8, le_word(&data)?),
            _ => self.session.write_untyped_memory(address, &data),
        }
    }

    fn read_registers(&self) -> Result<String> {
        let mut data = Vec::with_capacity(ARM_REGISTERS.len() * 4);
        for name in ARM_REGISTERS {
            data.extend_from_slice(&(self.session.get_register(name)? as u32).to_le_bytes());
        }
        Ok(encode_hex(&data))
    }

    fn write_registers(&self, args: &str) -> Result<()> {
        let data = decode_hex(args.as_bytes())?;
        for (name, word) in ARM_REGISTERS.iter().zip(data.chunks_exact(4)) {
            self.session.set_register(name, le_word(word)?)?;
        }
        Ok(())
    }

    /// `Z<type>,<addr>,<kind>`; kind 2 means a Thumb breakpoint.
    fn breakpoint_args(args: &str) -> Result<(u8, u64, u64)> {
        let mut fields = args.split(',');
        let (Some(kind), Some(address), Some(len)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(invalid("packet", format!("expected type,addr,kind in {args:?}")));
        };
        let kind = hex_number(kind, "type")?;
        let kind = u8::try_from(kind).map_err(|_| invalid("type", kind.to_string()))?;
        Ok((kind, hex_number(address, "address")?, hex_number(len, "kind")?))
    }

    fn insert_breakpoint(&self, args: &str) -> Result<String> {
        let (kind, address, len) = Self::breakpoint_args(args)?;
        let options = BreakpointOptions {
            thumb: len == 2,
            hardware: kind == 1,
            ..BreakpointOptions::default()
        };
        if kind > 1 {
            debug!(kind, "watchpoints are not supported");
            return Ok(String::new());
        }
        let mut breakpoints = lock(&self.breakpoints);
        if breakpoints.contains_key(&address) {
            return Ok("OK".into());
        }
        match self.session.set_breakpoint(address, &options) {
            Ok(breakpoint) => {
                breakpoints.insert(address, breakpoint);
                Ok("OK".into())
            }
            Err(SessionError::BreakpointExists(_)) => Ok("OK".into()),
            Err(err) => Err(err),
        }
    }

    fn remove_breakpoint(&self, args: &str) -> Result<String> {
        let (kind, address, _) = Self::breakpoint_args(args)?;
        if kind > 1 {
            return Ok(String::new());
        }
        let breakpoint = lock(&self.breakpoints)
            .remove(&address)
            .ok_or(SessionError::NoSuchBreakpoint(address))?;
        breakpoint.delete()?;
        Ok("OK".into())
    }
}

fn le_word(bytes: &[u8]) -> Result<u64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(invalid("value", format!("{} bytes", bytes.len())));
    }
    Ok(bytes
        .iter()
        .rev()
        .fold(0, |acc, byte| acc << 8 | u64::from(*byte)))
}

struct Shared {
    handler: Handler,
    stop: StopSignal,
    local: Endpoint,
    /// Stream of the connection being served, for shutdown.
    current: Mutex<Option<BridgeStream>>,
    config: FrameConfig,
}

/// Accepts one GDB connection at a time and serves it on a background
/// thread until [`stop`](Self::stop).
pub struct GdbServer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl GdbServer {
    pub fn bind(endpoint: &Endpoint, session: DebugSession) -> Result<Self> {
        let listener = BridgeListener::bind(endpoint)?;
        let local = listener.local_endpoint()?;
        let shared = Arc::new(Shared {
            handler: Handler {
                session,
                breakpoints: Mutex::new(HashMap::new()),
            },
            stop: StopSignal::new(),
            local: local.clone(),
            current: Mutex::new(None),
            config: FrameConfig::default(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("fwbridge-gdb-server".into())
                .spawn(move || accept_loop(&shared, listener))?
        };
        info!(endpoint = %local, "gdb server listening");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Where the server actually listens; resolves port 0.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.shared.local
    }

    pub fn session(&self) -> &DebugSession {
        &self.shared.handler.session
    }

    pub fn stop(&self) {
        if self.shared.stop.is_stopped() {
            return;
        }
        self.shared.stop.stop();
        if let Some(stream) = lock(&self.shared.current).as_ref() {
            if let Err(err) = stream.shutdown() {
                debug!(%err, "gdb connection shutdown failed");
            }
        }
        // Wake the blocking accept.
        if let Err(err) = BridgeStream::connect(&self.shared.local, Some(Duration::from_secs(1))) {
            debug!(%err, "self-connect to stop listener failed");
        }
        if let Some(handle) = lock(&self.thread).take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("gdb server thread panicked");
            }
        }
        info!(endpoint = %self.shared.local, "gdb server stopped");
    }
}

impl Drop for GdbServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for GdbServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GdbServer")
            .field("endpoint", &self.shared.local)
            .field("session", &self.shared.handler.session.name())
            .field("stopped", &self.shared.stop.is_stopped())
            .finish()
    }
}

fn accept_loop(shared: &Shared, listener: BridgeListener) {
    loop {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(err) if shared.stop.is_stopped() => {
                debug!(%err, "accept after stop");
                break;
            }
            Err(err) => {
                warn!(%err, "gdb server accept failed");
                continue;
            }
        };
        if shared.stop.is_stopped() {
            break;
        }
        info!(peer = stream.label(), "gdb connected");
        if let Err(err) = serve_connection(shared, stream) {
            error!(%err, "gdb connection failed");
        }
        lock(&shared.current).take();
    }
}

/// Sends `S05` for breakpoint and step stops of the served session.
fn register_stop_listener(bus: &EventBus, shared: &Shared, writer: &SharedWriter) -> ListenerId {
    let source = shared.handler.session.source();
    let writer = Arc::clone(writer);
    bus.register(move |event: &Event| -> Result<()> {
        if event.source != source
            || !(event.has_tag(EventTag::Breakpoint) || event.has_tag(EventTag::EndStepping))
        {
            return Ok(());
        }
        trace!(%event, "reporting stop to gdb");
        lock(&writer).send(&RspFrame::packet(Bytes::from_static(STOP_REPLY.as_bytes())))?;
        Ok(())
    })
}

fn serve_connection(shared: &Shared, stream: BridgeStream) -> Result<()> {
    let mut reader =
        FrameReader::with_config_stream(stream.try_clone()?, RspCodec::new(), &shared.config)?
            .with_stop(shared.stop.clone());
    let writer: SharedWriter = Arc::new(Mutex::new(FrameWriter::with_config_stream(
        stream.try_clone()?,
        RspCodec::new(),
        &shared.config,
    )?));
    *lock(&shared.current) = Some(stream);
    if shared.stop.is_stopped() {
        return Ok(());
    }

    let bus = shared.handler.session.bus().clone();
    let listener = register_stop_listener(&bus, shared, &writer);
    let result = packet_loop(shared, &mut reader, &writer);
    bus.unregister(listener);
    result
}

fn packet_loop(
    shared: &Shared,
    reader: &mut FrameReader<BridgeStream, RspCodec>,
    writer: &SharedWriter,
) -> Result<()> {
    let mut last_reply: Option<RspFrame> = None;
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err @ (FrameError::ChecksumMismatch { .. } | FrameError::InvalidChecksumDigit(_))) => {
                warn!(%err, "corrupt packet from gdb");
                lock(writer).send(&RspFrame::Nack)?;
                continue;
            }
            Err(err) if err.is_frame_local() => {
                warn!(%err, "dropping packet from gdb");
                continue;
            }
            Err(FrameError::Stopped) => return Ok(()),
            Err(FrameError::ConnectionClosed) => {
                info!("gdb disconnected");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        match frame {
            RspFrame::Ack => {}
            RspFrame::Nack => {
                if let Some(reply) = &last_reply {
                    debug!("gdb asked for retransmission");
                    lock(writer).send(reply)?;
                }
            }
            RspFrame::Interrupt => {
                debug!("interrupt from gdb");
                if let Err(err) = shared.handler.session.halt() {
                    warn!(%err, "halt failed");
                }
            }
            RspFrame::Packet(payload) => {
                let packet = String::from_utf8_lossy(&payload);
                trace!(%packet, "gdb packet");
                let mut out = lock(writer);
                out.send(&RspFrame::Ack)?;
                let reply = match shared.handler.handle(&packet) {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(%err, %packet, "gdb request failed");
                        Some(ERROR_REPLY.to_string())
                    }
                };
                if let Some(reply) = reply {
                    let frame = RspFrame::packet(Bytes::from(reply.into_bytes()));
                    out.send(&frame)?;
                    last_reply = Some(frame);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fwbridge_proto::rsp::{BreakpointKind, RspClient, RspConfig, StopReply};

    use super::*;
    use crate::capability::{MemoryAccess, RegisterAccess};
    use crate::event::Source;
    use crate::fake::FakeTarget;

    fn serve() -> (GdbServer, Arc<FakeTarget>, RspClient) {
        let bus = EventBus::new().expect("should start bus");
        let target = Arc::new(FakeTarget::new());
        let session = DebugSession::builder(bus, Source::Target)
            .memory(target.clone())
            .registers(target.clone())
            .breakpoints(target.clone())
            .execution(target.clone())
            .build();
        let server =
            GdbServer::bind(&Endpoint::tcp("127.0.0.1", 0), session).expect("should bind");
        let stream = BridgeStream::connect(server.local_endpoint(), Some(Duration::from_secs(2)))
            .expect("should connect");
        let config = RspConfig::default().with_response_timeout(Duration::from_secs(2));
        let client = RspClient::connect(stream, config).expect("should start client");
        (server, target, client)
    }

    fn handler(target: &Arc<FakeTarget>) -> Handler {
        let bus = EventBus::new().expect("should start bus");
        Handler {
            session: DebugSession::builder(bus, Source::Target)
                .memory(target.clone())
                .registers(target.clone())
                .breakpoints(target.clone())
                .build(),
            breakpoints: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn register_values_are_little_endian() {
        let target = Arc::new(FakeTarget::new());
        let handler = handler(&target);
        target.set_register("r1", 0x1234_5678).expect("should seed");

        let reply = handler.handle("g").expect("should handle").expect("should reply");
        assert_eq!(reply.len(), 17 * 8);
        assert_eq!(&reply[8..16], "78563412");

        assert_eq!(handler.handle("p1").expect("should handle"), Some("78563412".into()));
        assert_eq!(handler.handle("Pf=00800000").expect("should handle"), Some("OK".into()));
        assert_eq!(target.get_register("pc").expect("should read"), 0x8000);
        handler.handle("P19=d3000000").expect("should handle");
        assert_eq!(target.get_register("cpsr").expect("should read"), 0xd3);
        assert_eq!(handler.handle("p19").expect("should handle"), Some("d3000000".into()));
        assert!(matches!(
            handler.handle("p1a"),
            Err(SessionError::UnknownRegister(_))
        ));
    }

    #[test]
    fn oversized_memory_lengths_are_rejected() {
        let target = Arc::new(FakeTarget::new());
        let handler = handler(&target);
        for packet in ["m0,ffffffffffffffff", "m0,80000000", "M0,10000:00"] {
            let err = handler.handle(packet).expect_err("should reject length");
            assert!(
                matches!(
                    err,
                    SessionError::Proto(ProtoError::InvalidField { field: "length", .. })
                ),
                "{packet}: {err}"
            );
        }
        let limit = format!("m0,{MAX_MEMORY_TRANSFER:x}");
        let reply = handler.handle(&limit).expect("should handle").expect("should reply");
        assert_eq!(reply.len(), MAX_MEMORY_TRANSFER * 2);
    }

    #[test]
    fn oversized_read_gets_error_reply() {
        let (server, _target, client) = serve();
        let err = client
            .read_memory(0, 0x8000_0000)
            .expect_err("server should answer E01");
        assert!(matches!(err, ProtoError::Gdb(_)), "{err}");
        // The server thread survives and keeps serving.
        assert_eq!(&client.read_memory(0, 1).expect("should read")[..], &[0]);
        client.stop();
        server.stop();
    }

    #[test]
    fn write_length_must_match_payload() {
        let target = Arc::new(FakeTarget::new());
        let handler = handler(&target);
        assert!(handler.handle("M100,4:0102").is_err());
        assert_eq!(handler.handle("M100,3:010203").expect("should handle"), Some("OK".into()));
        assert_eq!(target.read_typed(0x100, 4).expect("should read"), 0x030201);
    }

    #[test]
    fn queries_get_empty_replies() {
        let target = Arc::new(FakeTarget::new());
        let handler = handler(&target);
        assert_eq!(handler.handle("qSupported").expect("should handle"), Some(String::new()));
        assert_eq!(handler.handle("Hg0").expect("should handle"), Some(String::new()));
        assert_eq!(handler.handle("?").expect("should handle"), Some("S05".into()));
        assert_eq!(handler.handle("X0,0:").expect("should handle"), Some(String::new()));
    }

    #[test]
    fn serves_memory_to_rsp_client() {
        let (server, target, client) = serve();
        target.write_typed(0x2000, 4, 0xcafe_babe).expect("should seed");

        let bytes = client.read_memory(0x2000, 4).expect("should read");
        assert_eq!(&bytes[..], &[0xbe, 0xba, 0xfe, 0xca]);
        client
            .write_memory(0x3000, &[1, 2, 3, 4, 5])
            .expect("should write");
        assert_eq!(target.read_typed(0x3004, 1).expect("should read"), 5);
        let bytes = client.read_memory(0x3000, 5).expect("should read");
        assert_eq!(&bytes[..], &[1, 2, 3, 4, 5]);

        client.stop();
        server.stop();
    }

    #[test]
    fn breakpoints_and_stop_replies() {
        let (server, target, client) = serve();

        assert!(client
            .insert_breakpoint(BreakpointKind::Software, 0x8000, 4)
            .expect("should insert"));
        assert!(client
            .insert_breakpoint(BreakpointKind::Software, 0x8000, 4)
            .expect("should accept duplicate"));
        assert_eq!(lock(&target.breakpoints).len(), 1);

        client.cont(None).expect("should continue");
        server
            .session()
            .post(
                Event::new(Source::Target, [EventTag::Stopped, EventTag::Breakpoint])
                    .with_address(0x8000),
            )
            .expect("should post");
        let stop = client
            .wait_stop(Some(Duration::from_secs(2)))
            .expect("should report stop");
        assert_eq!(stop, StopReply::Signal(5));
        assert_eq!(target.resumed(), 1);

        assert!(client
            .remove_breakpoint(BreakpointKind::Software, 0x8000, 4)
            .expect("should remove"));
        assert!(lock(&target.breakpoints).is_empty());
        assert!(client
            .remove_breakpoint(BreakpointKind::Software, 0x8000, 4)
            .is_err());

        client.stop();
        server.stop();
    }

    #[test]
    fn stop_unblocks_idle_listener() {
        let bus = EventBus::new().expect("should start bus");
        let session = DebugSession::builder(bus, Source::Target).build();
        let server =
            GdbServer::bind(&Endpoint::tcp("127.0.0.1", 0), session).expect("should bind");
        server.stop();
        assert!(lock(&server.thread).is_none());
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fwbridge_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, RspCodec, RspFrame};
use fwbridge_transport::{BridgeStream, StopSignal};
use tracing::{debug, error, info, trace, warn};

use crate::correlator::{lock, Correlator};
use crate::error::{ProtoError, Result};

use super::hex::{decode_hex, encode_hex};
use super::stop::StopReply;

/// Remote protocol client settings.
#[derive(Debug, Clone)]
pub struct RspConfig {
    /// How long to wait for `+` after a packet. Default: 2 s.
    pub ack_timeout: Duration,
    /// How long to wait for a reply packet. Default: 10 s.
    pub response_timeout: Duration,
    pub frame: FrameConfig,
}

impl Default for RspConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(10),
            frame: FrameConfig::default(),
        }
    }
}

impl RspConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

/// `Z`/`z` breakpoint and watchpoint kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakpointKind {
    Software = 0,
    Hardware = 1,
    WriteWatch = 2,
    ReadWatch = 3,
    AccessWatch = 4,
}

#[derive(Default)]
struct StopQueue {
    replies: Mutex<VecDeque<Bytes>>,
    ready: Condvar,
}

struct Inner {
    writer: Mutex<FrameWriter<BridgeStream, RspCodec>>,
    turn: Mutex<()>,
    acks: Correlator<(), bool>,
    replies: Correlator<(), Bytes>,
    stops: StopQueue,
    stop: StopSignal,
    closer: BridgeStream,
    config: RspConfig,
}

impl Inner {
    fn write(&self, frame: &RspFrame) -> Result<()> {
        lock(&self.writer).send(frame)?;
        Ok(())
    }

    /// Send one packet and wait for its acknowledgement. Caller holds `turn`.
    fn send_acked(&self, payload: &[u8]) -> Result<()> {
        let ack = self.acks.register(())?;
        trace!(packet = %String::from_utf8_lossy(payload), "sending packet");
        self.write(&RspFrame::packet(Bytes::copy_from_slice(payload)))?;
        if ack.wait(Some(self.config.ack_timeout))? {
            Ok(())
        } else {
            Err(ProtoError::unexpected("+", "-"))
        }
    }

    fn dispatch(&self, frame: RspFrame) {
        match frame {
            RspFrame::Ack | RspFrame::Nack => {
                let acked = frame == RspFrame::Ack;
                if !self.acks.resolve(&(), acked) {
                    debug!(acked, "acknowledgement with no packet in flight");
                }
            }
            RspFrame::Interrupt => debug!("ignoring interrupt byte from target"),
            RspFrame::Packet(payload) => {
                if let Err(err) = self.write(&RspFrame::Ack) {
                    warn!(%err, "failed to acknowledge packet");
                }
                if self.replies.resolve(&(), payload.clone()) {
                    return;
                }
                if StopReply::is_stop_packet(&payload) {
                    debug!(packet = %String::from_utf8_lossy(&payload), "queued stop reply");
                    lock(&self.stops.replies).push_back(payload);
                    self.stops.ready.notify_all();
                } else {
                    warn!(packet = %String::from_utf8_lossy(&payload), "unsolicited packet");
                }
            }
        }
    }

    fn shut_down(&self) {
        self.stop.stop();
        self.acks.fail_all();
        self.replies.fail_all();
        {
            let _queue = lock(&self.stops.replies);
            self.stops.ready.notify_all();
        }
        if let Err(err) = self.closer.shutdown() {
            debug!(%err, "remote stream shutdown failed");
        }
    }
}

fn read_loop(inner: Arc<Inner>, mut reader: FrameReader<BridgeStream, RspCodec>) {
    loop {
        match reader.read_frame() {
            Ok(frame) => inner.dispatch(frame),
            Err(err @ (FrameError::ChecksumMismatch { .. } | FrameError::InvalidChecksumDigit(_))) => {
                warn!(%err, "corrupt packet, requesting retransmission");
                if let Err(err) = inner.write(&RspFrame::Nack) {
                    warn!(%err, "failed to send nack");
                }
            }
            Err(err) if err.is_frame_local() => warn!(%err, "dropping remote packet"),
            Err(FrameError::Stopped) => break,
            Err(FrameError::ConnectionClosed) => {
                info!("remote target closed the connection");
                break;
            }
            Err(err) => {
                error!(%err, "remote reader failed");
                break;
            }
        }
    }
    inner.shut_down();
}

fn check_ok(reply: &[u8]) -> Result<()> {
    match reply {
        b"OK" => Ok(()),
        other => Err(remote_failure(other)),
    }
}

fn remote_failure(reply: &[u8]) -> ProtoError {
    match reply {
        [b'E', code @ ..] if code.len() == 2 => {
            ProtoError::Gdb(format!("remote error E{}", String::from_utf8_lossy(code)))
        }
        [] => ProtoError::Unsupported("empty reply".into()),
        other => ProtoError::unexpected("OK", String::from_utf8_lossy(other)),
    }
}

fn hex_reply(reply: Bytes) -> Result<Bytes> {
    if reply.first() == Some(&b'E') && reply.len() == 3 {
        return Err(remote_failure(&reply));
    }
    decode_hex(&reply).map(Bytes::from)
}

/// Client for a GDB remote serial protocol server.
///
/// Every packet is acknowledged in both directions. Stop replies that arrive
/// while no request is waiting are queued for [`wait_stop`](Self::wait_stop).
pub struct RspClient {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RspClient {
    pub fn connect(stream: BridgeStream, config: RspConfig) -> Result<Self> {
        let reader = FrameReader::with_config_stream(stream.try_clone()?, RspCodec::new(), &config.frame)?;
        let writer = FrameWriter::with_config_stream(stream.try_clone()?, RspCodec::new(), &config.frame)?;
        let stop = StopSignal::new();
        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            turn: Mutex::new(()),
            acks: Correlator::new(),
            replies: Correlator::new(),
            stops: StopQueue::default(),
            stop: stop.clone(),
            closer: stream,
            config,
        });
        let handle = {
            let inner = Arc::clone(&inner);
            let reader = reader.with_stop(stop);
            thread::Builder::new()
                .name("fwbridge-rsp-reader".into())
                .spawn(move || read_loop(inner, reader))?
        };
        Ok(Self {
            inner,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Send a packet that has no reply and wait for `+`.
    ///
    /// A `-` is reported as an error; the packet is not retransmitted.
    pub fn send_packet(&self, payload: &[u8]) -> Result<()> {
        let _turn = lock(&self.inner.turn);
        self.inner.send_acked(payload)
    }

    /// Send a packet and return the reply payload.
    pub fn request(&self, payload: &[u8]) -> Result<Bytes> {
        let _turn = lock(&self.inner.turn);
        let reply = self.inner.replies.register(())?;
        self.inner.send_acked(payload)?;
        let reply = reply.wait(Some(self.inner.config.response_timeout))?;
        trace!(reply = %String::from_utf8_lossy(&reply), "remote reply");
        Ok(reply)
    }

    pub fn read_memory(&self, address: u64, len: usize) -> Result<Bytes> {
        let reply = self.request(format!("m{address:x},{len:x}").as_bytes())?;
        hex_reply(reply)
    }

    pub fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        let packet = format!("M{address:x},{:x}:{}", data.len(), encode_hex(data));
        check_ok(&self.request(packet.as_bytes())?)
    }

    /// All registers in the target's `g` layout.
    pub fn read_registers(&self) -> Result<Bytes> {
        hex_reply(self.request(b"g")?)
    }

    pub fn write_registers(&self, data: &[u8]) -> Result<()> {
        check_ok(&self.request(format!("G{}", encode_hex(data)).as_bytes())?)
    }

    /// One register, in target byte order.
    pub fn read_register(&self, number: u32) -> Result<Bytes> {
        hex_reply(self.request(format!("p{number:x}").as_bytes())?)
    }

    pub fn write_register(&self, number: u32, data: &[u8]) -> Result<()> {
        check_ok(&self.request(format!("P{number:x}={}", encode_hex(data)).as_bytes())?)
    }

    /// Resume, optionally at `address`. The stop reply comes later via
    /// [`wait_stop`](Self::wait_stop).
    pub fn cont(&self, address: Option<u64>) -> Result<()> {
        match address {
            Some(address) => self.send_packet(format!("c{address:x}").as_bytes()),
            None => self.send_packet(b"c"),
        }
    }

    pub fn step(&self, address: Option<u64>) -> Result<()> {
        match address {
            Some(address) => self.send_packet(format!("s{address:x}").as_bytes()),
            None => self.send_packet(b"s"),
        }
    }

    /// Ask the target to halt.
    pub fn interrupt(&self) -> Result<()> {
        self.inner.write(&RspFrame::Interrupt)
    }

    /// Returns `false` when the target does not support this kind.
    pub fn insert_breakpoint(&self, kind: BreakpointKind, address: u64, len: u32) -> Result<bool> {
        self.z_packet('Z', kind, address, len)
    }

    pub fn remove_breakpoint(&self, kind: BreakpointKind, address: u64, len: u32) -> Result<bool> {
        self.z_packet('z', kind, address, len)
    }

    fn z_packet(&self, op: char, kind: BreakpointKind, address: u64, len: u32) -> Result<bool> {
        let packet = format!("{op}{},{address:x},{len:x}", kind as u8);
        let reply = self.request(packet.as_bytes())?;
        if reply.is_empty() {
            info!(?kind, "target does not support {op} packets");
            return Ok(false);
        }
        check_ok(&reply).map(|()| true)
    }

    /// `?`: why the target is halted.
    pub fn query_halt_reason(&self) -> Result<StopReply> {
        StopReply::parse(&self.request(b"?")?)
    }

    /// Next queued stop reply. `None` waits until one arrives or the
    /// connection drops.
    pub fn wait_stop(&self, timeout: Option<Duration>) -> Result<StopReply> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = lock(&self.inner.stops.replies);
        loop {
            if let Some(payload) = queue.pop_front() {
                return StopReply::parse(&payload);
            }
            if self.inner.stop.is_stopped() {
                return Err(ProtoError::ConnectionLost);
            }
            queue = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ProtoError::Timeout(timeout.unwrap_or_default()));
                    }
                    self.inner
                        .stops
                        .ready
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .stops
                    .ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// `k`: kill the target.
    pub fn kill(&self) -> Result<()> {
        self.send_packet(b"k")
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.stop.is_stopped()
    }

    /// Kill the target, then stop the reader.
    pub fn close(&self) {
        if self.is_connected() {
            if let Err(err) = self.kill() {
                debug!(%err, "kill on close failed");
            }
        }
        self.stop();
    }

    pub fn stop(&self) {
        self.inner.shut_down();
        if let Some(handle) = lock(&self.reader).take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("remote reader panicked");
            }
        }
    }
}

impl Drop for RspClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RspClient")
            .field("connected", &self.is_connected())
            .finish()
    }
}

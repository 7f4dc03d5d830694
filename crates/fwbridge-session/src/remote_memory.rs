//! Line-delimited JSON side-channel through which an emulator forwards
//! memory accesses and CPU-state transfers to the target.
//!
//! Requests look like
//! `{"cmd": "read", "params": {"address": "0x1000", "size": "0x4"}, "cpu_state": {...}}`.
//! Numbers travel as hex strings. Only `read`, `set_cpu_state`,
//! `get_cpu_state`, `continue` and `get_checksum` are answered.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use fwbridge_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, LineCodec};
use fwbridge_proto::ProtoError;
use fwbridge_transport::{BridgeStream, Endpoint, RetryPolicy, StopSignal};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, trace, warn};

use crate::bus::{lock, EventBus};
use crate::error::{Result, SessionError};
use crate::event::{Event, EventTag, Source};
use crate::proxy::MemoryRequest;

pub const CHANNEL: &str = "remote_memory";

/// Services side-channel requests. Implemented by
/// [`CallProxy`](crate::CallProxy).
pub trait RemoteMemoryHandler: Send + Sync + 'static {
    fn read(&self, request: MemoryRequest) -> Result<u64>;
    fn write(&self, request: MemoryRequest) -> Result<()>;
    fn set_cpu_state(&self, state: &Map<String, Value>) -> Result<()>;
    fn get_cpu_state(&self) -> Result<Map<String, Value>>;
    fn cont(&self) -> Result<()>;
    fn checksum(&self, address: u64, size: u64) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct Request {
    cmd: String,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    cpu_state: Map<String, Value>,
}

/// Parse a hex number with or without a `0x` prefix.
pub(crate) fn parse_hex(text: &str) -> Option<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).ok()
}

fn hex_param(params: &Map<String, Value>, field: &'static str) -> Result<u64> {
    params
        .get(field)
        .and_then(Value::as_str)
        .and_then(parse_hex)
        .ok_or_else(|| {
            SessionError::Proto(ProtoError::InvalidField {
                field,
                reason: "missing or not a hex string".into(),
            })
        })
}

fn access_size(params: &Map<String, Value>) -> Result<u8> {
    let size = hex_param(params, "size")?;
    u8::try_from(size).map_err(|_| {
        SessionError::Proto(ProtoError::InvalidField {
            field: "size",
            reason: format!("{size} bytes"),
        })
    })
}

/// Handle one request line and return the reply to send, if any.
///
/// Read and write requests are posted on the bus before the handler runs.
pub fn handle_request(
    line: &str,
    handler: &dyn RemoteMemoryHandler,
    bus: &EventBus,
) -> Result<Option<Value>> {
    let request: Request = serde_json::from_str(line)?;
    trace!(cmd = %request.cmd, "remote memory request");
    match request.cmd.as_str() {
        "read" => {
            let address = hex_param(&request.params, "address")?;
            let size = access_size(&request.params)?;
            bus.post(
                Event::new(Source::Emulator, [EventTag::RequestReadMemory])
                    .with_channel(CHANNEL)
                    .with_address(address)
                    .with_size(u32::from(size)),
            )?;
            let value = handler.read(MemoryRequest {
                cpu_state: request.cpu_state,
                ..MemoryRequest::read(address, size)
            })?;
            Ok(Some(json!({"reply": "read", "value": format!("0x{value:x}")})))
        }
        "write" => {
            let address = hex_param(&request.params, "address")?;
            let size = access_size(&request.params)?;
            let value = hex_param(&request.params, "value")?;
            bus.post(
                Event::new(Source::Emulator, [EventTag::RequestWriteMemory])
                    .with_channel(CHANNEL)
                    .with_address(address)
                    .with_size(u32::from(size))
                    .with_value(value),
            )?;
            handler.write(MemoryRequest {
                cpu_state: request.cpu_state,
                ..MemoryRequest::write(address, size, value)
            })?;
            Ok(None)
        }
        "set_cpu_state" => {
            handler.set_cpu_state(&request.cpu_state)?;
            Ok(Some(json!({"reply": "done"})))
        }
        "get_cpu_state" => {
            let mut state = handler.get_cpu_state()?;
            state.insert("reply".into(), "get_cpu_state".into());
            Ok(Some(Value::Object(state)))
        }
        "continue" => {
            handler.cont()?;
            Ok(Some(json!({"reply": "done"})))
        }
        "get_checksum" => {
            let address = hex_param(&request.params, "address")?;
            let size = hex_param(&request.params, "size")?;
            let sum = handler.checksum(address, size)?;
            Ok(Some(json!({"reply": "done", "value": format!("0x{sum:08x}")})))
        }
        other => Err(SessionError::Proto(ProtoError::Unsupported(format!(
            "remote memory command {other:?}"
        )))),
    }
}

struct Shared {
    stop: StopSignal,
    /// Set once connected; used to unblock the reader on stop.
    closer: Mutex<Option<BridgeStream>>,
}

/// Serves a side-channel connection on a background thread.
pub struct RemoteMemoryChannel {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteMemoryChannel {
    /// Connect to the emulator plugin at `endpoint`, retrying per `retry`,
    /// then serve requests.
    pub fn connect(
        endpoint: Endpoint,
        retry: RetryPolicy,
        handler: Arc<dyn RemoteMemoryHandler>,
        bus: EventBus,
    ) -> Result<Self> {
        Self::spawn(handler, bus, move |stop| {
            debug!(%endpoint, "connecting to remote memory plugin");
            let stream = BridgeStream::connect_with_retry(&endpoint, &retry)?;
            if stop.is_stopped() {
                return Err(SessionError::Frame(FrameError::Stopped));
            }
            info!(%endpoint, "remote memory channel connected");
            Ok(stream)
        })
    }

    /// Serve requests on an already-connected stream.
    pub fn serve(
        stream: BridgeStream,
        handler: Arc<dyn RemoteMemoryHandler>,
        bus: EventBus,
    ) -> Result<Self> {
        Self::spawn(handler, bus, move |_| Ok(stream))
    }

    fn spawn<F>(handler: Arc<dyn RemoteMemoryHandler>, bus: EventBus, open: F) -> Result<Self>
    where
        F: FnOnce(&StopSignal) -> Result<BridgeStream> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            stop: StopSignal::new(),
            closer: Mutex::new(None),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("fwbridge-remote-memory".into())
                .spawn(move || match open(&shared.stop) {
                    Ok(stream) => {
                        if let Err(err) = serve_loop(&shared, stream, handler.as_ref(), &bus) {
                            error!(%err, "remote memory channel failed");
                        }
                    }
                    Err(err) => error!(%err, "remote memory channel could not connect"),
                })?
        };
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn is_running(&self) -> bool {
        lock(&self.thread)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop serving. A thread still connecting is detached and exits once
    /// its connect attempts end.
    pub fn stop(&self) {
        self.shared.stop.stop();
        let connected = match lock(&self.shared.closer).as_ref() {
            Some(stream) => {
                if let Err(err) = stream.shutdown() {
                    debug!(%err, "remote memory stream shutdown failed");
                }
                true
            }
            None => false,
        };
        let Some(handle) = lock(&self.thread).take() else {
            return;
        };
        if connected && handle.thread().id() != thread::current().id() && handle.join().is_err() {
            warn!("remote memory thread panicked");
        }
    }
}

impl Drop for RemoteMemoryChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for RemoteMemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMemoryChannel")
            .field("running", &self.is_running())
            .finish()
    }
}

fn serve_loop(
    shared: &Shared,
    stream: BridgeStream,
    handler: &dyn RemoteMemoryHandler,
    bus: &EventBus,
) -> Result<()> {
    let config = FrameConfig::default();
    let mut reader = FrameReader::with_config_stream(stream.try_clone()?, LineCodec::new(), &config)?
        .with_stop(shared.stop.clone());
    *lock(&shared.closer) = Some(stream.try_clone()?);
    let mut writer = FrameWriter::with_config_stream(stream, LineCodec::new(), &config)?;
    if shared.stop.is_stopped() {
        return Ok(());
    }

    loop {
        let line = match reader.read_frame() {
            Ok(line) => line,
            Err(err) if err.is_frame_local() => {
                warn!(%err, "dropping malformed remote memory line");
                continue;
            }
            Err(FrameError::Stopped) => return Ok(()),
            Err(FrameError::ConnectionClosed) => {
                info!("remote memory peer closed the connection");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        match handle_request(&line, handler, bus) {
            Ok(Some(reply)) => writer.send(reply.to_string().as_str())?,
            Ok(None) => {}
            Err(err) => error!(%err, request = %line, "remote memory request failed"),
        }
    }
}

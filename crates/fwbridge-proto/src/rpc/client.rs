use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use fwbridge_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, RpcCodec};
use fwbridge_transport::{BridgeStream, StopSignal};
use tracing::{debug, error, info, trace, warn};

use crate::correlator::{lock, Correlator};
use crate::error::{ProtoError, Result};
use crate::rpc::catalog::{MemoryMapEntry, Opcode, RpcMessage};
use crate::rpc::types::{EXCEPTION_VECTOR_COUNT, MAX_UNTYPED_TRANSFER};

/// How long a command waits for its reply by default.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Binary RPC client settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Deadline for each synchronous command. Default: 10 s.
    pub response_timeout: Duration,
    /// Stream settings for the reader and writer.
    pub frame: FrameConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            response_timeout: RESPONSE_TIMEOUT,
            frame: FrameConfig::default(),
        }
    }
}

impl RpcConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// Supplies page contents when the stub reports a page fault.
///
/// Runs on the pager thread. Returning `None` leaves the VM halted.
pub trait PageFaultHandler: Send + Sync + 'static {
    fn handle_page_fault(&self, page_address: u32) -> Option<Bytes>;
}

impl<F> PageFaultHandler for F
where
    F: Fn(u32) -> Option<Bytes> + Send + Sync + 'static,
{
    fn handle_page_fault(&self, page_address: u32) -> Option<Bytes> {
        self(page_address)
    }
}

/// Receives INFO_EXCEPTION notifications, inline on the reader thread.
pub trait ExceptionHandler: Send + Sync + 'static {
    fn handle_exception(&self, exception: u8);
}

impl<F> ExceptionHandler for F
where
    F: Fn(u8) + Send + Sync + 'static,
{
    fn handle_exception(&self, exception: u8) {
        self(exception)
    }
}

/// Receives every notification after the client has processed it.
///
/// Called on the reader thread; implementations must not block or issue
/// commands on the same client.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, message: &RpcMessage);
}

impl<F> NotificationSink for F
where
    F: Fn(&RpcMessage) + Send + Sync + 'static,
{
    fn notify(&self, message: &RpcMessage) {
        self(message)
    }
}

/// Callbacks installed before the reader starts.
#[derive(Clone, Default)]
pub struct RpcHandlers {
    page_fault: Option<Arc<dyn PageFaultHandler>>,
    exception: Option<Arc<dyn ExceptionHandler>>,
    notifications: Option<Arc<dyn NotificationSink>>,
}

impl RpcHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_page_fault(mut self, handler: impl PageFaultHandler) -> Self {
        self.page_fault = Some(Arc::new(handler));
        self
    }

    pub fn on_exception(mut self, handler: impl ExceptionHandler) -> Self {
        self.exception = Some(Arc::new(handler));
        self
    }

    pub fn on_notification(mut self, sink: impl NotificationSink) -> Self {
        self.notifications = Some(Arc::new(sink));
        self
    }
}

type BoxedWriter = FrameWriter<Box<dyn Write + Send>, RpcCodec>;

struct Inner {
    writer: Mutex<BoxedWriter>,
    /// Held for a whole command/reply exchange: the protocol has no tokens,
    /// so at most one command is outstanding.
    turn: Mutex<()>,
    replies: Correlator<(), RpcMessage>,
    state: Mutex<Option<u8>>,
    handlers: RpcHandlers,
    stop: StopSignal,
    closer: Option<BridgeStream>,
    config: RpcConfig,
}

impl Inner {
    fn send(&self, message: &RpcMessage) -> Result<()> {
        let frame = message.to_bytes()?;
        trace!(message = %message, "sending rpc message");
        lock(&self.writer).send(frame.as_ref())?;
        Ok(())
    }

    fn command(&self, request: RpcMessage, expected: Opcode) -> Result<RpcMessage> {
        let _turn = lock(&self.turn);
        let pending = self.replies.register(())?;
        self.send(&request)?;
        debug!(request = request.name(), "waiting for rpc reply");

        match pending.wait(Some(self.config.response_timeout))? {
            RpcMessage::ReplyError { error } => Err(ProtoError::Remote { code: error }),
            reply if reply.opcode() == expected => Ok(reply),
            other => Err(ProtoError::unexpected(
                format!("{expected} or {}", Opcode::ReplyError),
                other.name(),
            )),
        }
    }

    fn expect_ok(&self, request: RpcMessage) -> Result<()> {
        self.command(request, Opcode::ReplyOk).map(|_| ())
    }

    fn insert_page(&self, page_address: u32, data: Bytes) -> Result<()> {
        self.expect_ok(RpcMessage::InsertPage { page_address, data })
    }

    /// Route one decoded message. Runs on the reader thread in wire order.
    fn dispatch(&self, message: RpcMessage, pager: &Sender<u32>) {
        match message {
            RpcMessage::State { state } => {
                debug!(state, "vm state changed");
                *lock(&self.state) = Some(state);
            }
            RpcMessage::InfoException { exception } => {
                info!(exception, "stub reported exception");
                if let Some(handler) = &self.handlers.exception {
                    handler.handle_exception(exception);
                }
            }
            RpcMessage::PageFault { page_address } => {
                debug!(page_address = format_args!("0x{page_address:08x}"), "page fault");
                if pager.send(page_address).is_err() {
                    warn!("pager thread gone; page fault not serviced");
                }
            }
            reply => {
                let name = reply.name();
                if !self.replies.resolve(&(), reply) {
                    warn!(reply = name, "dropping rpc reply with no pending command");
                }
                return;
            }
        }

        if let Some(sink) = &self.handlers.notifications {
            sink.notify(&message);
        }
    }

    fn shut_down(&self) {
        self.stop.stop();
        self.replies.fail_all();
        if let Some(stream) = &self.closer {
            if let Err(err) = stream.shutdown() {
                debug!(%err, "rpc stream shutdown failed");
            }
        }
    }
}

fn read_loop<R: Read>(inner: Arc<Inner>, mut reader: FrameReader<R, RpcCodec>, pager: Sender<u32>) {
    loop {
        match reader.read_frame() {
            Ok(frame) => match RpcMessage::decode(&frame) {
                Ok(message) => inner.dispatch(message, &pager),
                Err(err) => warn!(%err, "dropping undecodable rpc message"),
            },
            Err(err) if err.is_frame_local() => {
                // No NACK exists in this protocol; the sender times out.
                warn!(%err, "dropping corrupt rpc frame");
            }
            Err(FrameError::Stopped) => {
                debug!("rpc reader stopped");
                break;
            }
            Err(FrameError::ConnectionClosed) => {
                info!("rpc peer closed the connection");
                break;
            }
            Err(err) => {
                error!(%err, "rpc reader failed");
                break;
            }
        }
    }
    inner.shut_down();
}

fn pager_loop(inner: Arc<Inner>, faults: Receiver<u32>) {
    for page_address in faults {
        let Some(handler) = inner.handlers.page_fault.clone() else {
            warn!(
                page_address = format_args!("0x{page_address:08x}"),
                "page fault with no handler installed"
            );
            continue;
        };
        let Some(page) = handler.handle_page_fault(page_address) else {
            error!(
                page_address = format_args!("0x{page_address:08x}"),
                "page fault handler returned no data"
            );
            continue;
        };
        if let Err(err) = inner.insert_page(page_address, page) {
            error!(%err, "inserting faulted page failed");
            continue;
        }
        if let Err(err) = inner.send(&RpcMessage::ContinueFromPagefault) {
            error!(%err, "continue after page fault failed");
        }
    }
    trace!("pager thread exiting");
}

/// Client for the on-target stub.
///
/// One reader thread decodes frames, updates the cached VM state, and hands
/// replies to the waiting command. Page faults are serviced on a separate
/// pager thread so that the reader stays free to deliver the INSERT_PAGE
/// reply.
pub struct RpcClient {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcClient {
    /// Start a client over a connected stream.
    pub fn connect(stream: BridgeStream, handlers: RpcHandlers, config: RpcConfig) -> Result<Self> {
        let reader = FrameReader::with_config_stream(stream.try_clone()?, RpcCodec::new(), &config.frame)?;
        stream.set_write_timeout(config.frame.write_timeout)?;
        let closer = stream.try_clone()?;
        Self::start(reader, Box::new(stream), Some(closer), handlers, config)
    }

    /// Start a client over any byte-stream pair.
    pub fn from_parts<R, W>(read: R, write: W, handlers: RpcHandlers, config: RpcConfig) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::start(FrameReader::new(read, RpcCodec::new()), Box::new(write), None, handlers, config)
    }

    fn start<R: Read + Send + 'static>(
        reader: FrameReader<R, RpcCodec>,
        writer: Box<dyn Write + Send>,
        closer: Option<BridgeStream>,
        handlers: RpcHandlers,
        config: RpcConfig,
    ) -> Result<Self> {
        let stop = StopSignal::new();
        let inner = Arc::new(Inner {
            writer: Mutex::new(FrameWriter::new(writer, RpcCodec::new())),
            turn: Mutex::new(()),
            replies: Correlator::new(),
            state: Mutex::new(None),
            handlers,
            stop: stop.clone(),
            closer,
            config,
        });

        let (pager_tx, pager_rx) = mpsc::channel();
        let pager = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("fwbridge-rpc-pager".into())
                .spawn(move || pager_loop(inner, pager_rx))?
        };
        let reader_thread = {
            let inner = Arc::clone(&inner);
            let reader = reader.with_stop(stop);
            thread::Builder::new()
                .name("fwbridge-rpc-reader".into())
                .spawn(move || read_loop(inner, reader, pager_tx))?
        };

        Ok(Self {
            inner,
            threads: Mutex::new(vec![reader_thread, pager]),
        })
    }

    /// Typed read of 1, 2 or 4 bytes.
    pub fn read_memory(&self, address: u32, size: u8) -> Result<u32> {
        match self
            .inner
            .command(RpcMessage::ReadMemory { address, size }, Opcode::ReplyReadMemory)?
        {
            RpcMessage::ReplyReadMemory { value, .. } => Ok(value),
            other => Err(ProtoError::unexpected(Opcode::ReplyReadMemory.name(), other.name())),
        }
    }

    /// Typed write of 1, 2 or 4 bytes.
    pub fn write_memory(&self, address: u32, size: u8, value: u32) -> Result<()> {
        self.inner.expect_ok(RpcMessage::WriteMemory {
            address,
            size,
            value,
        })
    }

    pub fn get_register(&self, register: u8) -> Result<u32> {
        match self
            .inner
            .command(RpcMessage::GetRegister { register }, Opcode::ReplyGetRegister)?
        {
            RpcMessage::ReplyGetRegister { value } => Ok(value),
            other => Err(ProtoError::unexpected(Opcode::ReplyGetRegister.name(), other.name())),
        }
    }

    pub fn set_register(&self, register: u8, value: u32) -> Result<()> {
        self.inner
            .expect_ok(RpcMessage::SetRegister { register, value })
    }

    /// Read up to 255 bytes in one message.
    pub fn read_untyped_memory(&self, address: u32, size: usize) -> Result<Bytes> {
        let size = u8::try_from(size).map_err(|_| ProtoError::InvalidField {
            field: "size",
            reason: format!("{size} exceeds {MAX_UNTYPED_TRANSFER}"),
        })?;
        match self.inner.command(
            RpcMessage::ReadUntypedMemory { address, size },
            Opcode::ReplyReadUntypedMemory,
        )? {
            RpcMessage::ReplyReadUntypedMemory { data } => Ok(data),
            other => Err(ProtoError::unexpected(
                Opcode::ReplyReadUntypedMemory.name(),
                other.name(),
            )),
        }
    }

    /// Write up to 255 bytes in one message.
    pub fn write_untyped_memory(&self, address: u32, data: &[u8]) -> Result<()> {
        if data.len() > MAX_UNTYPED_TRANSFER {
            return Err(ProtoError::InvalidField {
                field: "data",
                reason: format!("{} exceeds {MAX_UNTYPED_TRANSFER}", data.len()),
            });
        }
        self.inner.expect_ok(RpcMessage::WriteUntypedMemory {
            address,
            data: Bytes::copy_from_slice(data),
        })
    }

    /// Run the codelet at `address` and wait for it to finish.
    pub fn execute_codelet(&self, address: u32) -> Result<()> {
        self.inner
            .command(
                RpcMessage::CodeletExecute { address },
                Opcode::ReplyCodeletExecutionFinished,
            )
            .map(|_| ())
    }

    pub fn insert_page(&self, page_address: u32, data: &[u8]) -> Result<()> {
        self.inner
            .insert_page(page_address, Bytes::copy_from_slice(data))
    }

    pub fn extract_page(&self, page_address: u32) -> Result<Bytes> {
        match self
            .inner
            .command(RpcMessage::ExtractPage { page_address }, Opcode::ReplyExtractPage)?
        {
            RpcMessage::ReplyExtractPage { data } => Ok(data),
            other => Err(ProtoError::unexpected(Opcode::ReplyExtractPage.name(), other.name())),
        }
    }

    pub fn unmap_page(&self, page_address: u32) -> Result<()> {
        self.inner.expect_ok(RpcMessage::UnmapPage { page_address })
    }

    pub fn set_memory_map(&self, entries: &[MemoryMapEntry]) -> Result<()> {
        self.inner.expect_ok(RpcMessage::SetMemoryMap {
            entries: entries.to_vec(),
        })
    }

    pub fn get_dirty_pages(&self) -> Result<Vec<u32>> {
        match self
            .inner
            .command(RpcMessage::GetDirtyPages, Opcode::ReplyGetDirtyPages)?
        {
            RpcMessage::ReplyGetDirtyPages { addresses } => Ok(addresses),
            other => Err(ProtoError::unexpected(
                Opcode::ReplyGetDirtyPages.name(),
                other.name(),
            )),
        }
    }

    pub fn set_exception_config(
        &self,
        config: u32,
        irq_squelch: u16,
        fiq_squelch: u16,
        vectors: [u32; EXCEPTION_VECTOR_COUNT],
    ) -> Result<()> {
        self.inner.expect_ok(RpcMessage::SetExceptionConfig {
            config,
            irq_squelch,
            fiq_squelch,
            vectors,
        })
    }

    pub fn clear_exception(&self, exception: u8) -> Result<()> {
        self.inner.expect_ok(RpcMessage::ClearException { exception })
    }

    pub fn resume_vm(&self) -> Result<()> {
        self.inner.expect_ok(RpcMessage::ResumeVm)
    }

    /// Ask the stub for its VM state and refresh the cached value.
    pub fn query_state(&self) -> Result<u8> {
        match self
            .inner
            .command(RpcMessage::QueryState, Opcode::ReplyState)?
        {
            RpcMessage::ReplyState { state } => {
                *lock(&self.inner.state) = Some(state);
                Ok(state)
            }
            other => Err(ProtoError::unexpected(Opcode::ReplyState.name(), other.name())),
        }
    }

    /// Last VM state seen in a STATE or REPLY_STATE message.
    pub fn state(&self) -> Option<u8> {
        *lock(&self.inner.state)
    }

    /// Whether the reader is still running.
    pub fn is_connected(&self) -> bool {
        !self.inner.stop.is_stopped()
    }

    /// Stop the reader and pager threads and fail pending commands.
    ///
    /// Clients built with [`from_parts`](Self::from_parts) cannot interrupt a
    /// blocked read; their threads are detached and exit at the next EOF.
    pub fn stop(&self) {
        self.inner.shut_down();
        let threads: Vec<_> = lock(&self.threads).drain(..).collect();
        if self.inner.closer.is_none() {
            return;
        }
        for handle in threads {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!("rpc client thread panicked");
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("connected", &self.is_connected())
            .field("state", &self.state())
            .finish()
    }
}

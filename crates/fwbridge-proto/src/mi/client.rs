use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fwbridge_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, LineCodec};
use fwbridge_transport::{BridgeStream, StopSignal};
use tracing::{debug, error, info, trace, warn};

use crate::correlator::{lock, Correlator, PendingReply};
use crate::error::{ProtoError, Result};

use super::parser::parse_record;
use super::record::{AsyncKind, Record, ResultClass, StreamKind};
use super::value::Results;

/// Prompt GDB prints after each batch of output.
pub const DEFAULT_PROMPT: &str = "(gdb) ";

/// GDB/MI client settings.
#[derive(Debug, Clone)]
pub struct MiConfig {
    /// Prompt line to discard. Default: `"(gdb) "`.
    pub prompt: String,
    /// Deadline for [`MiClient::sync_command`]. `None` waits forever.
    pub command_timeout: Option<Duration>,
    /// Stream settings when running over a socket.
    pub frame: FrameConfig,
}

impl Default for MiConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            command_timeout: Some(Duration::from_secs(10)),
            frame: FrameConfig::default(),
        }
    }
}

impl MiConfig {
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

/// Receives `*`, `+` and `=` records on the reader thread.
pub trait AsyncHandler: Send + Sync + 'static {
    fn handle_async(&self, kind: AsyncKind, class: &str, results: &Results);
}

impl<F> AsyncHandler for F
where
    F: Fn(AsyncKind, &str, &Results) + Send + Sync + 'static,
{
    fn handle_async(&self, kind: AsyncKind, class: &str, results: &Results) {
        self(kind, class, results)
    }
}

/// Receives `~`, `@` and `&` text instead of the log.
pub trait StreamHandler: Send + Sync + 'static {
    fn handle_stream(&self, kind: StreamKind, text: &str);
}

impl<F> StreamHandler for F
where
    F: Fn(StreamKind, &str) + Send + Sync + 'static,
{
    fn handle_stream(&self, kind: StreamKind, text: &str) {
        self(kind, text)
    }
}

#[derive(Clone, Default)]
pub struct MiHandlers {
    on_async: Option<Arc<dyn AsyncHandler>>,
    on_stream: Option<Arc<dyn StreamHandler>>,
}

impl MiHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_async(mut self, handler: impl AsyncHandler) -> Self {
        self.on_async = Some(Arc::new(handler));
        self
    }

    pub fn on_stream(mut self, handler: impl StreamHandler) -> Self {
        self.on_stream = Some(Arc::new(handler));
        self
    }
}

type PendingResult = PendingReply<u64, (ResultClass, Results)>;

struct Writer {
    frames: FrameWriter<Box<dyn Write + Send>, LineCodec>,
    next_token: u64,
}

struct Inner {
    writer: Mutex<Writer>,
    results: Correlator<u64, (ResultClass, Results)>,
    handlers: MiHandlers,
    stop: StopSignal,
    closer: Option<BridgeStream>,
    config: MiConfig,
}

impl Inner {
    /// Allocate a token and write `"{token}{command}\n"`. With `register`,
    /// the waiter exists before the line hits the wire.
    fn write_command(
        &self,
        command: &str,
        register: bool,
    ) -> Result<(u64, Option<PendingResult>)> {
        let mut writer = lock(&self.writer);
        let token = writer.next_token;
        writer.next_token += 1;
        let pending = if register {
            Some(self.results.register(token)?)
        } else {
            None
        };
        let line = format!("{token}{command}");
        trace!(%line, "sending mi command");
        writer.frames.send(line.as_str())?;
        Ok((token, pending))
    }

    fn dispatch(&self, line: &str) {
        if line.is_empty() || line.trim_end() == self.config.prompt.trim_end() {
            return;
        }
        if line == "^done" {
            trace!("discarding untokened ^done");
            return;
        }
        let record = match parse_record(line) {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "unparseable mi line");
                return;
            }
        };
        match record {
            Record::Result {
                token: Some(token),
                class,
                results,
            } => {
                if !self.results.resolve(&token, (class, results)) {
                    debug!(token, %class, "mi result with no waiter");
                }
            }
            Record::Result { token: None, class, .. } => {
                debug!(%class, "ignoring untokened mi result");
            }
            Record::Async {
                kind,
                class,
                results,
            } => match &self.handlers.on_async {
                Some(handler) => handler.handle_async(kind, &class, &results),
                None => debug!(%class, "unhandled mi async record"),
            },
            Record::Stream { kind, text } => match &self.handlers.on_stream {
                Some(handler) => handler.handle_stream(kind, &text),
                None => match kind {
                    StreamKind::Console => info!(text = text.trim_end(), "gdb"),
                    StreamKind::Target => info!(text = text.trim_end(), "gdb target"),
                    StreamKind::Log => warn!(text = text.trim_end(), "gdb log"),
                },
            },
        }
    }

    fn shut_down(&self) {
        self.stop.stop();
        self.results.fail_all();
        if let Some(stream) = &self.closer {
            if let Err(err) = stream.shutdown() {
                debug!(%err, "mi stream shutdown failed");
            }
        }
    }
}

fn read_loop<R: Read>(inner: Arc<Inner>, mut reader: FrameReader<R, LineCodec>) {
    loop {
        match reader.read_frame() {
            Ok(line) => inner.dispatch(&line),
            Err(err) if err.is_frame_local() => warn!(%err, "dropping mi line"),
            Err(FrameError::Stopped) => {
                debug!("mi reader stopped");
                break;
            }
            Err(FrameError::ConnectionClosed) => {
                info!("gdb closed its output");
                break;
            }
            Err(err) => {
                error!(%err, "mi reader failed");
                break;
            }
        }
    }
    inner.shut_down();
}

/// Line-oriented GDB/MI client.
///
/// Commands are prefixed with an increasing token; a reader thread parses
/// each output line and hands tokened result records to the waiting caller.
pub struct MiClient {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl MiClient {
    /// Start over a pipe pair, such as a child GDB's stdout and stdin.
    pub fn start<R, W>(read: R, write: W, handlers: MiHandlers, config: MiConfig) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::spawn(FrameReader::new(read, LineCodec::new()), Box::new(write), None, handlers, config)
    }

    /// Start over a connected socket.
    pub fn connect(stream: BridgeStream, handlers: MiHandlers, config: MiConfig) -> Result<Self> {
        let reader = FrameReader::with_config_stream(stream.try_clone()?, LineCodec::new(), &config.frame)?;
        stream.set_write_timeout(config.frame.write_timeout)?;
        let closer = stream.try_clone()?;
        Self::spawn(reader, Box::new(stream), Some(closer), handlers, config)
    }

    fn spawn<R: Read + Send + 'static>(
        reader: FrameReader<R, LineCodec>,
        writer: Box<dyn Write + Send>,
        closer: Option<BridgeStream>,
        handlers: MiHandlers,
        config: MiConfig,
    ) -> Result<Self> {
        let stop = StopSignal::new();
        let inner = Arc::new(Inner {
            writer: Mutex::new(Writer {
                frames: FrameWriter::new(writer, LineCodec::new()),
                next_token: 1,
            }),
            results: Correlator::new(),
            handlers,
            stop: stop.clone(),
            closer,
            config,
        });
        let handle = {
            let inner = Arc::clone(&inner);
            let reader = reader.with_stop(stop);
            thread::Builder::new()
                .name("fwbridge-mi-reader".into())
                .spawn(move || read_loop(inner, reader))?
        };
        Ok(Self {
            inner,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Send without waiting. The eventual result record is discarded.
    pub fn send_command(&self, command: &str) -> Result<u64> {
        if self.inner.stop.is_stopped() {
            return Err(ProtoError::ConnectionLost);
        }
        self.inner.write_command(command, false).map(|(token, _)| token)
    }

    /// Send and wait for the result with the same token.
    ///
    /// `^error` becomes [`ProtoError::Gdb`] with GDB's message; any other
    /// class than `expected` is [`ProtoError::UnexpectedReply`].
    pub fn sync_command(&self, command: &str, expected: ResultClass) -> Result<Results> {
        let (token, pending) = self.inner.write_command(command, true)?;
        let pending = pending.ok_or(ProtoError::ConnectionLost)?;
        debug!(token, command, "waiting for mi result");

        match pending.wait(self.inner.config.command_timeout)? {
            (class, results) if class == expected => Ok(results),
            (ResultClass::Error, results) => Err(ProtoError::Gdb(
                results.get_str("msg").unwrap_or("unknown error").to_string(),
            )),
            (class, _) => Err(ProtoError::unexpected(expected.as_str(), class.as_str())),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.stop.is_stopped()
    }

    /// Stop the reader and fail waiting commands.
    ///
    /// A pipe-backed reader cannot be interrupted; it is detached and exits
    /// once GDB closes its output.
    pub fn stop(&self) {
        self.inner.shut_down();
        let handle = lock(&self.reader).take();
        if self.inner.closer.is_none() {
            return;
        }
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("mi reader panicked");
            }
        }
    }
}

impl Drop for MiClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiClient")
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};
    use std::sync::mpsc;

    use super::*;

    /// Plays GDB: `respond(token, command)` returns the lines to emit.
    fn fake_gdb<F>(stream: BridgeStream, mut respond: F) -> JoinHandle<Vec<String>>
    where
        F: FnMut(&str, &str) -> Vec<String> + Send + 'static,
    {
        thread::spawn(move || {
            let mut out = stream.try_clone().unwrap();
            let mut seen = Vec::new();
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                let split = line.find(|c: char| !c.is_ascii_digit()).unwrap_or(line.len());
                let (token, command) = line.split_at(split);
                for reply in respond(token, command) {
                    out.write_all(reply.as_bytes()).unwrap();
                    out.write_all(b"\n").unwrap();
                }
                seen.push(line);
            }
            seen
        })
    }

    fn quick() -> MiConfig {
        MiConfig::default().with_command_timeout(Some(Duration::from_millis(300)))
    }

    #[test]
    fn tokens_start_at_one_and_prompt_is_swallowed() {
        let (host, gdb) = BridgeStream::pair().unwrap();
        let gdb = fake_gdb(gdb, |token, _| {
            vec![
                "^done".to_string(),
                format!("{token}^done,value=\"42\""),
                "(gdb) ".to_string(),
            ]
        });
        let client = MiClient::connect(host, MiHandlers::new(), quick()).unwrap();

        let results = client
            .sync_command("-gdb-show remote checksum 1000 4", ResultClass::Done)
            .expect("should succeed");
        assert_eq!(results.get_str("value"), Some("42"));
        let results = client
            .sync_command("-exec-interrupt", ResultClass::Done)
            .expect("should succeed");
        assert_eq!(results.get_str("value"), Some("42"));
        client.stop();

        let seen = gdb.join().unwrap();
        assert_eq!(
            seen,
            vec!["1-gdb-show remote checksum 1000 4", "2-exec-interrupt"]
        );
    }

    #[test]
    fn error_class_carries_message() {
        let (host, gdb) = BridgeStream::pair().unwrap();
        let _gdb = fake_gdb(gdb, |token, _| {
            vec![format!("{token}^error,msg=\"No symbol \\\"foo\\\" in current context.\"")]
        });
        let client = MiClient::connect(host, MiHandlers::new(), quick()).unwrap();
        let err = client
            .sync_command("-data-evaluate-expression foo", ResultClass::Done)
            .unwrap_err();
        assert!(
            matches!(err, ProtoError::Gdb(ref msg) if msg == "No symbol \"foo\" in current context."),
            "{err:?}"
        );
    }

    #[test]
    fn class_mismatch_is_unexpected_reply() {
        let (host, gdb) = BridgeStream::pair().unwrap();
        let _gdb = fake_gdb(gdb, |token, _| vec![format!("{token}^done")]);
        let client = MiClient::connect(host, MiHandlers::new(), quick()).unwrap();
        let err = client
            .sync_command("-exec-continue", ResultClass::Running)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtoError::UnexpectedReply { ref expected, ref received }
                if expected == "running" && received == "done"
        ));
    }

    #[test]
    fn async_records_reach_handler_in_order() {
        let (host, gdb) = BridgeStream::pair().unwrap();
        let _gdb = fake_gdb(gdb, |token, _| {
            vec![
                format!("{token}^running"),
                "*running,thread-id=\"all\"".to_string(),
                "~\"garbage line\\n\"".to_string(),
                "not mi at all".to_string(),
                "*stopped,reason=\"breakpoint-hit\",bkptno=\"1\"".to_string(),
            ]
        });

        let (tx, rx) = mpsc::channel();
        let handlers = MiHandlers::new().on_async(move |kind: AsyncKind, class: &str, results: &Results| {
            let _ = tx.send((kind, class.to_string(), results.get_str("reason").map(str::to_string)));
        });
        let client = MiClient::connect(host, handlers, quick()).unwrap();
        client
            .sync_command("-exec-continue", ResultClass::Running)
            .expect("should run");

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, (AsyncKind::Exec, "running".to_string(), None));
        assert_eq!(
            second,
            (
                AsyncKind::Exec,
                "stopped".to_string(),
                Some("breakpoint-hit".to_string())
            )
        );
    }

    #[test]
    fn stream_handler_receives_text() {
        let (host, gdb) = BridgeStream::pair().unwrap();
        let _gdb = fake_gdb(gdb, |token, _| {
            vec!["&\"warning\\n\"".to_string(), format!("{token}^done")]
        });
        let (tx, rx) = mpsc::channel();
        let handlers = MiHandlers::new().on_stream(move |kind: StreamKind, text: &str| {
            let _ = tx.send((kind, text.to_string()));
        });
        let client = MiClient::connect(host, handlers, quick()).unwrap();
        client.sync_command("-gdb-version", ResultClass::Done).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            (StreamKind::Log, "warning\n".to_string())
        );
    }

    #[test]
    fn silent_gdb_times_out() {
        let (host, gdb) = BridgeStream::pair().unwrap();
        let _gdb = fake_gdb(gdb, |_, _| Vec::new());
        let client = MiClient::connect(host, MiHandlers::new(), quick()).unwrap();
        let err = client.sync_command("-exec-interrupt", ResultClass::Done).unwrap_err();
        assert!(matches!(err, ProtoError::Timeout(_)));
    }

    #[test]
    fn send_command_does_not_wait() {
        let (host, gdb) = BridgeStream::pair().unwrap();
        let gdb = fake_gdb(gdb, |token, _| vec![format!("{token}^done")]);
        let client = MiClient::connect(host, MiHandlers::new(), quick()).unwrap();
        assert_eq!(client.send_command("-gdb-set confirm off").unwrap(), 1);
        assert_eq!(client.send_command("-gdb-set pagination off").unwrap(), 2);
        let results = client.sync_command("-list-features", ResultClass::Done).unwrap();
        assert!(results.is_empty());
        client.stop();
        assert_eq!(gdb.join().unwrap().len(), 3);
    }

    #[test]
    fn gdb_exit_fails_waiter() {
        let (host, gdb) = BridgeStream::pair().unwrap();
        let closer = thread::spawn(move || {
            let mut line = String::new();
            BufReader::new(gdb.try_clone().unwrap()).read_line(&mut line).unwrap();
            gdb.shutdown().unwrap();
        });
        let client = MiClient::connect(host, MiHandlers::new(), MiConfig::default()).unwrap();
        let err = client.sync_command("-gdb-exit", ResultClass::Exit).unwrap_err();
        assert!(matches!(err, ProtoError::ConnectionLost));
        closer.join().unwrap();
        assert!(!client.is_connected());
    }

    #[test]
    fn works_over_plain_pipes() {
        let (ours, theirs) = BridgeStream::pair().unwrap();
        let _gdb = fake_gdb(theirs, |token, _| vec![format!("{token}^connected")]);
        let client = MiClient::start(
            ours.try_clone().unwrap(),
            ours,
            MiHandlers::new(),
            quick(),
        )
        .unwrap();
        client
            .sync_command("-target-select remote tcp:127.0.0.1:3333", ResultClass::Connected)
            .expect("should connect");
    }
}

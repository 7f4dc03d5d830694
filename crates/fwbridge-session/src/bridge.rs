//! Wires a configured target backend to the optional GDB server and
//! emulator side-channel.

use std::fmt;
use std::sync::Arc;

use fwbridge_proto::mi::MiConfig;
use fwbridge_proto::rpc::RpcConfig;
use fwbridge_proto::rsp::RspConfig;
use fwbridge_transport::{BridgeStream, Endpoint};
use tracing::{debug, info};

use crate::backends::{GdbMiTarget, RemoteTarget, StubTarget};
use crate::bus::EventBus;
use crate::config::{BridgeConfig, TargetKind};
use crate::error::Result;
use crate::event::Source;
use crate::gdb_server::GdbServer;
use crate::proxy::CallProxy;
use crate::remote_memory::{RemoteMemoryChannel, RemoteMemoryHandler};
use crate::session::DebugSession;

enum Backend {
    Stub(Arc<StubTarget>),
    Remote(Arc<RemoteTarget>),
    Mi(Arc<GdbMiTarget>),
}

impl Backend {
    fn stop(&self) {
        match self {
            Self::Stub(target) => target.stop(),
            Self::Remote(target) => target.stop(),
            Self::Mi(target) => target.stop(),
        }
    }

    fn kind(&self) -> TargetKind {
        match self {
            Self::Stub(_) => TargetKind::AvatarStub,
            Self::Remote(_) => TargetKind::GdbRemote,
            Self::Mi(_) => TargetKind::GdbMi,
        }
    }
}

/// A running bridge. Components stop in reverse start order on
/// [`stop`](Self::stop) or drop.
pub struct Bridge {
    bus: EventBus,
    backend: Backend,
    session: DebugSession,
    proxy: Arc<CallProxy>,
    gdb_server: Option<GdbServer>,
    remote_memory: Option<RemoteMemoryChannel>,
}

impl Bridge {
    pub fn start(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::new()?;
        let endpoint = config.target_endpoint()?;
        let retry = config.retry_policy();
        info!(%endpoint, kind = ?config.target.kind, "connecting to target");
        let stream = BridgeStream::connect_with_retry(&endpoint, &retry)?;
        let timeout = config.response_timeout();

        let (backend, session) = match config.target.kind {
            TargetKind::AvatarStub => {
                let rpc = RpcConfig::default().with_response_timeout(timeout);
                let target = StubTarget::start(stream, bus.clone(), rpc)?;
                let session = target.session();
                (Backend::Stub(target), session)
            }
            TargetKind::GdbRemote => {
                let rsp = RspConfig::default().with_response_timeout(timeout);
                let target = RemoteTarget::start(stream, bus.clone(), Source::Target, rsp)?;
                let session = target.session();
                (Backend::Remote(target), session)
            }
            TargetKind::GdbMi => {
                let mi = MiConfig::default().with_command_timeout(Some(timeout));
                let target = GdbMiTarget::start(stream, bus.clone(), Source::Target, mi)?;
                if let Some(attach) = config.attach_endpoint()? {
                    target.attach(&attach)?;
                }
                let session = target.session();
                (Backend::Mi(target), session)
            }
        };

        let mut bridge = Self {
            bus: bus.clone(),
            proxy: Arc::new(CallProxy::new(session.clone())),
            backend,
            session,
            gdb_server: None,
            remote_memory: None,
        };

        if let Some(endpoint) = config.gdb_server_endpoint()? {
            bridge.gdb_server = Some(GdbServer::bind(&endpoint, bridge.session.clone())?);
        }
        if let Some(endpoint) = config.remote_memory_endpoint()? {
            let handler: Arc<dyn RemoteMemoryHandler> = bridge.proxy.clone();
            bridge.remote_memory = Some(RemoteMemoryChannel::connect(
                endpoint, retry, handler, bus,
            )?);
        }
        info!(kind = ?bridge.backend.kind(), "bridge started");
        Ok(bridge)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn session(&self) -> &DebugSession {
        &self.session
    }

    pub fn proxy(&self) -> &Arc<CallProxy> {
        &self.proxy
    }

    pub fn gdb_server_endpoint(&self) -> Option<&Endpoint> {
        self.gdb_server.as_ref().map(GdbServer::local_endpoint)
    }

    pub fn stop(&mut self) {
        if let Some(channel) = self.remote_memory.take() {
            channel.stop();
        }
        if let Some(server) = self.gdb_server.take() {
            server.stop();
        }
        self.proxy.stop();
        self.backend.stop();
        self.bus.shutdown();
        debug!("bridge stopped");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("kind", &self.backend.kind())
            .field("session", &self.session)
            .field("gdb_server", &self.gdb_server_endpoint())
            .field("remote_memory", &self.remote_memory)
            .finish()
    }
}

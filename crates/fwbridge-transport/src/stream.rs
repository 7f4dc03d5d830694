use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};

/// A connected byte stream: implements `Read + Write`.
///
/// This is the I/O type every protocol client and server is built on.
pub struct BridgeStream {
    inner: StreamInner,
    label: String,
}

enum StreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

/// Bounded retry for establishing a connection at startup.
///
/// Only used before a session exists. A connection that fails later is never
/// re-established by the protocol engine.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total connect attempts (at least one is always made).
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
    /// Per-attempt TCP connect timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(3),
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with no delay.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

impl Read for BridgeStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for BridgeStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl BridgeStream {
    /// Connect to an endpoint (blocking).
    pub fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { .. } => {
                let addr = endpoint
                    .socket_addr_string()
                    .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;
                let stream = connect_tcp(&addr, timeout).map_err(|source| {
                    TransportError::Connect {
                        endpoint: endpoint.to_string(),
                        source,
                    }
                })?;
                debug!(%endpoint, "connected");
                Ok(Self::from_tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let _ = timeout;
                let stream = std::os::unix::net::UnixStream::connect(path).map_err(|source| {
                    TransportError::Connect {
                        endpoint: endpoint.to_string(),
                        source,
                    }
                })?;
                debug!(?path, "connected to unix domain socket");
                Ok(Self::from_unix(stream, endpoint.to_string()))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ),
            }),
        }
    }

    /// Connect, retrying according to `policy`.
    ///
    /// Returns the last connect error once all attempts are exhausted.
    pub fn connect_with_retry(endpoint: &Endpoint, policy: &RetryPolicy) -> Result<Self> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::connect(endpoint, policy.connect_timeout) {
                Ok(stream) => {
                    info!(%endpoint, attempt, "connection established");
                    return Ok(stream);
                }
                Err(err) if attempt < attempts => {
                    warn!(%endpoint, attempt, attempts, error = %err, "connect failed, retrying");
                    std::thread::sleep(policy.delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Wrap an already-connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let label = stream
            .peer_addr()
            .map(|addr| format!("tcp:{addr}"))
            .unwrap_or_else(|_| "tcp:unknown".to_string());
        Self {
            inner: StreamInner::Tcp(stream),
            label,
        }
    }

    /// Wrap an already-connected Unix stream.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream, label: impl Into<String>) -> Self {
        Self {
            inner: StreamInner::Unix(stream),
            label: label.into(),
        }
    }

    /// A connected pair of in-process streams.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((
            Self::from_unix(left, "unix:pair-left"),
            Self::from_unix(right, "unix:pair-right"),
        ))
    }

    /// Human-readable peer description for logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new descriptor for the same socket).
    pub fn try_clone(&self) -> Result<Self> {
        let inner = match &self.inner {
            StreamInner::Tcp(stream) => StreamInner::Tcp(stream.try_clone()?),
            #[cfg(unix)]
            StreamInner::Unix(stream) => StreamInner::Unix(stream.try_clone()?),
        };
        Ok(Self {
            inner,
            label: self.label.clone(),
        })
    }

    /// Shut down both directions. Blocked readers on any clone observe EOF.
    pub fn shutdown(&self) -> Result<()> {
        let result = match &self.inner {
            StreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for BridgeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            StreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            StreamInner::Unix(_) => "unix",
        };
        f.debug_struct("BridgeStream")
            .field("type", &kind)
            .field("peer", &self.label)
            .finish()
    }
}

fn connect_tcp(addr: &str, timeout: Option<Duration>) -> std::io::Result<TcpStream> {
    let Some(timeout) = timeout else {
        return TcpStream::connect(addr);
    };

    let mut last_err = None;
    for candidate in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "endpoint resolved to no addresses",
        )
    }))
}

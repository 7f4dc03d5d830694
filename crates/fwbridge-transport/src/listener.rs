use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
#[cfg(unix)]
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::BridgeStream;

/// Listening socket that hands out [`BridgeStream`]s.
///
/// Used by the remote-debug server side. Unix socket files created by `bind`
/// are removed on drop, unless the path was replaced in the meantime.
pub struct BridgeListener {
    inner: ListenerInner,
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: std::os::unix::net::UnixListener,
        path: PathBuf,
        created_inode: Option<(u64, u64)>,
    },
}

impl BridgeListener {
    /// Default permission mode for created socket paths.
    #[cfg(unix)]
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 elsewhere.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on an endpoint.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { .. } => {
                let addr = endpoint
                    .socket_addr_string()
                    .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;
                let listener = TcpListener::bind(&addr).map_err(|source| TransportError::Bind {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
                info!(%endpoint, "listening on tcp");
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                })
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Self::bind_unix(path),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Bind {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ),
            }),
        }
    }

    #[cfg(unix)]
    fn bind_unix(path: &Path) -> Result<Self> {
        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path: path.to_path_buf(),
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        let path = path.to_path_buf();
        let bind_err = |source: std::io::Error| TransportError::Bind {
            endpoint: format!("unix:{}", path.display()),
            source,
        };

        // Remove a stale socket, but never a regular file.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(Self::DEFAULT_SOCKET_MODE),
        )
        .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");
        Ok(Self {
            inner: ListenerInner::Unix {
                listener,
                path,
                created_inode: Some((created.dev(), created.ino())),
            },
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<BridgeStream> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!(%addr, "accepted tcp connection");
                Ok(BridgeStream::from_tcp(stream))
            }
            #[cfg(unix)]
            ListenerInner::Unix { listener, path, .. } => {
                let (stream, _addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!(?path, "accepted unix connection");
                Ok(BridgeStream::from_unix(
                    stream,
                    format!("unix:{}", path.display()),
                ))
            }
        }
    }

    /// The endpoint actually bound (resolves port 0 for TCP).
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::tcp(addr.ip().to_string(), addr.port()))
            }
            #[cfg(unix)]
            ListenerInner::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }
}

impl Drop for BridgeListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let ListenerInner::Unix {
                path,
                created_inode: Some((dev, ino)),
                ..
            } = &self.inner
            {
                remove_if_unchanged(path, *dev, *ino);
            }
        }
    }
}

#[cfg(unix)]
fn remove_if_unchanged(path: &Path, expected_dev: u64, expected_ino: u64) {
    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if metadata.file_type().is_socket()
            && metadata.dev() == expected_dev
            && metadata.ino() == expected_ino
        {
            debug!(?path, "cleaning up socket file");
            let _ = std::fs::remove_file(path);
        } else {
            debug!(?path, "socket path identity changed; skipping cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn tcp_bind_port_zero_reports_local_endpoint() {
        let listener =
            BridgeListener::bind(&Endpoint::tcp("127.0.0.1", 0)).expect("listener should bind");
        let endpoint = listener.local_endpoint().expect("should report endpoint");
        let Endpoint::Tcp { host, port } = &endpoint else {
            panic!("expected tcp endpoint");
        };
        assert_eq!(host, "127.0.0.1");
        assert_ne!(*port, 0);

        let client = std::thread::spawn(move || {
            let mut stream =
                BridgeStream::connect(&endpoint, None).expect("client should connect");
            stream.write_all(b"gdb").expect("should write");
        });

        let mut server = listener.accept().expect("should accept");
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).expect("should read");
        assert_eq!(&buf, b"gdb");
        client.join().expect("client thread should complete");
    }

    #[cfg(unix)]
    #[test]
    fn unix_bind_accept_connect_and_cleanup() {
        let dir = std::env::temp_dir().join(format!("fwbridge-listener-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let sock_path = dir.join("test.sock");
        let endpoint = Endpoint::unix(&sock_path);

        let listener = BridgeListener::bind(&endpoint).expect("listener should bind");
        assert!(sock_path.exists());
        let mode = std::fs::metadata(&sock_path)
            .expect("socket metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);

        let client_endpoint = endpoint.clone();
        let handle = std::thread::spawn(move || {
            let mut client =
                BridgeStream::connect(&client_endpoint, None).expect("client should connect");
            client.write_all(b"hello").expect("should write");
        });

        let mut server = listener.accept().expect("should accept");
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).expect("should read");
        assert_eq!(&buf, b"hello");
        handle.join().expect("client thread should complete");

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be removed on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn unix_path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = BridgeListener::bind(&Endpoint::unix(long_path));
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn unix_bind_rejects_regular_file() {
        let dir = std::env::temp_dir().join(format!("fwbridge-bind-file-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let sock_path = dir.join("not-a-socket.sock");
        std::fs::write(&sock_path, b"regular-file").expect("file should be writable");

        let result = BridgeListener::bind(&Endpoint::unix(&sock_path));
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

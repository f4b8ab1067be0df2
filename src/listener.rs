//! Listening sockets and the per-connection stream wrapper.
//!
//! The daemon listens on TCP (`host:port`) or on a Unix domain socket (an
//! absolute path). Both stream flavors expose the same readiness-based,
//! non-blocking surface, which is all the session layer ever uses: a
//! session task awaits `readable()`/`writable()` and then issues
//! `try_read`/`try_write` calls that never suspend.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// Errors binding a listening socket.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("another daemon is already listening on {0}")]
    AddrInUse(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An accepted connection: TCP or Unix, one non-blocking surface.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Wait for the socket to become readable.
    pub async fn readable(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.readable().await,
            Stream::Unix(s) => s.readable().await,
        }
    }

    /// Wait for the socket to become writable.
    pub async fn writable(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.writable().await,
            Stream::Unix(s) => s.writable().await,
        }
    }

    /// Non-blocking read; `WouldBlock` if the socket has no data ready.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_read(buf),
            Stream::Unix(s) => s.try_read(buf),
        }
    }

    /// Non-blocking write; `WouldBlock` if the socket buffer is full.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_write(buf),
            Stream::Unix(s) => s.try_write(buf),
        }
    }
}

/// Identity of the peer behind an accepted connection.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Display form of the peer address.
    pub addr: String,
    /// The peer process's uid, obtainable only on Unix-socket connections.
    pub uid: Option<u32>,
}

/// A listening socket yielding [`Stream`]s.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind the configured address: an absolute path binds a Unix domain
    /// socket, anything else is parsed as `host:port`.
    pub async fn bind(addr: &str) -> Result<Self, ListenerError> {
        if addr.starts_with('/') {
            Self::bind_unix(Path::new(addr))
        } else {
            Ok(Listener::Tcp(TcpListener::bind(addr).await?))
        }
    }

    /// Bind a Unix domain socket, removing a stale socket file if no other
    /// daemon is actually listening on it.
    fn bind_unix(path: &Path) -> Result<Self, ListenerError> {
        if path.exists() {
            match std::os::unix::net::UnixStream::connect(path) {
                Ok(_) => return Err(ListenerError::AddrInUse(path.to_path_buf())),
                Err(_) => {
                    // Socket exists but nothing is listening -- stale, safe to remove
                    std::fs::remove_file(path)?;
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;

        // Restrict socket permissions to owner only (0600): the control
        // protocol carries admin verbs.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Listener::Unix {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// The bound TCP address, if this is a TCP listener. Useful when
    /// binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }

    /// Accept one connection, resolving the peer's identity.
    pub async fn accept(&self) -> io::Result<(Stream, Peer)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                let peer = Peer {
                    addr: addr.to_string(),
                    uid: None,
                };
                Ok((Stream::Tcp(stream), peer))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                let uid = stream.peer_cred().ok().map(|cred| cred.uid());
                let peer = Peer {
                    addr: "local connection".to_string(),
                    uid,
                };
                Ok((Stream::Unix(stream), peer))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn tcp_bind_reports_local_addr() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().expect("TCP listener has an address");
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn tcp_accept_yields_unknown_uid() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, peer) = listener.accept().await.unwrap();
        client.await.unwrap();

        assert!(peer.uid.is_none());
        assert!(peer.addr.starts_with("127.0.0.1:"));
    }

    #[tokio::test]
    async fn unix_accept_resolves_peer_uid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("melodyd.sock");
        let listener = Listener::bind(path.to_str().unwrap()).await.unwrap();

        let connect_path = path.clone();
        let client = tokio::spawn(async move {
            let mut s = UnixStream::connect(&connect_path).await.unwrap();
            s.write_all(b"x").await.unwrap();
            s
        });

        let (_stream, peer) = listener.accept().await.unwrap();
        client.await.unwrap();

        assert_eq!(peer.addr, "local connection");
        // We connected to ourselves, so the peer uid is our own.
        assert_eq!(peer.uid, Some(current_uid()));
    }

    #[tokio::test]
    async fn stale_unix_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("melodyd.sock");
        std::fs::write(&path, b"").unwrap();

        let listener = Listener::bind(path.to_str().unwrap()).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn unix_socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("melodyd.sock");
        let _listener = Listener::bind(path.to_str().unwrap()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn socket_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("melodyd.sock");

        let listener = Listener::bind(path.to_str().unwrap()).await.unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_unix_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("melodyd.sock");

        let _first = Listener::bind(path.to_str().unwrap()).await.unwrap();
        let second = Listener::bind(path.to_str().unwrap()).await;
        assert!(matches!(second, Err(ListenerError::AddrInUse(_))));
    }

    fn current_uid() -> u32 {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0)
    }
}

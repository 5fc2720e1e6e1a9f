use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use uptermd_common::UptermdError;

use crate::memory_listener::{MemoryListener, MemoryNetwork};

/// Anything that behaves like a full-duplex byte stream, regardless of
/// whether it's backed by a UNIX socket or an in-memory duplex pair.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

const SSHD_SOCKET_NAME: &str = "__sshd__";

/// The singleton UNIX-socket (or in-memory) rendezvous the internal SSHD
/// listens on; the dialer connects to it to hand a host connection to the
/// SSHD loopback.
pub enum SshdListener {
    Unix(UnixListener),
    Memory(MemoryListener),
}

impl SshdListener {
    pub async fn accept(&mut self) -> Result<BoxedConn, UptermdError> {
        match self {
            SshdListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            SshdListener::Memory(listener) => listener
                .accept()
                .await
                .map(|s| Box::new(s) as BoxedConn)
                .ok_or_else(|| UptermdError::Directory("sshd listener closed".into())),
        }
    }
}

/// Per-session rendezvous listener: the host blocks `Accept` here, and each
/// admitted client connection to the owning node manifests as one accept.
pub enum SessionListener {
    Unix { listener: UnixListener, path: PathBuf },
    Memory(MemoryListener),
}

impl SessionListener {
    pub async fn accept(&mut self) -> Result<BoxedConn, UptermdError> {
        match self {
            SessionListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            SessionListener::Memory(listener) => listener
                .accept()
                .await
                .map(|s| Box::new(s) as BoxedConn)
                .ok_or_else(|| UptermdError::Directory("session listener closed".into())),
        }
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        if let SessionListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// The network backend chosen at startup: every session rendezvous and the
/// SSHD loopback are created through this one provider.
#[derive(Clone)]
pub enum NetworkProvider {
    Memory(MemoryNetwork),
    Unix { socket_dir: PathBuf },
}

impl NetworkProvider {
    pub fn memory() -> Self {
        NetworkProvider::Memory(MemoryNetwork::new())
    }

    pub fn unix(socket_dir: PathBuf) -> Self {
        NetworkProvider::Unix { socket_dir }
    }
}

/// The fixed singleton endpoint the internal SSHD binds and the dialer
/// connects to.
pub trait SshdProvider {
    async fn listen_sshd(&self) -> Result<SshdListener, UptermdError>;
    async fn dial_sshd(&self) -> Result<BoxedConn, UptermdError>;
}

/// Per-id rendezvous endpoints for session joins.
pub trait SessionProvider {
    async fn listen_session(&self, id: &str) -> Result<SessionListener, UptermdError>;
    async fn dial_session(&self, id: &str) -> Result<BoxedConn, UptermdError>;
}

impl SshdProvider for NetworkProvider {
    async fn listen_sshd(&self) -> Result<SshdListener, UptermdError> {
        match self {
            NetworkProvider::Memory(net) => {
                Ok(SshdListener::Memory(net.listen(SSHD_SOCKET_NAME).await?))
            }
            NetworkProvider::Unix { socket_dir } => {
                std::fs::create_dir_all(socket_dir)?;
                let path = socket_dir.join("sshd.sock");
                let _ = std::fs::remove_file(&path);
                Ok(SshdListener::Unix(UnixListener::bind(path)?))
            }
        }
    }

    async fn dial_sshd(&self) -> Result<BoxedConn, UptermdError> {
        match self {
            NetworkProvider::Memory(net) => {
                Ok(Box::new(net.dial(SSHD_SOCKET_NAME).await?) as BoxedConn)
            }
            NetworkProvider::Unix { socket_dir } => {
                let path = socket_dir.join("sshd.sock");
                Ok(Box::new(UnixStream::connect(path).await?) as BoxedConn)
            }
        }
    }
}

impl SessionProvider for NetworkProvider {
    async fn listen_session(&self, id: &str) -> Result<SessionListener, UptermdError> {
        match self {
            NetworkProvider::Memory(net) => {
                Ok(SessionListener::Memory(net.listen(id).await?))
            }
            NetworkProvider::Unix { socket_dir } => {
                std::fs::create_dir_all(socket_dir)?;
                let path = socket_dir.join(format!("{id}.sock"));
                if path.exists() {
                    return Err(UptermdError::AlreadyExists(id.to_string()));
                }
                let listener = UnixListener::bind(&path)?;
                Ok(SessionListener::Unix { listener, path })
            }
        }
    }

    async fn dial_session(&self, id: &str) -> Result<BoxedConn, UptermdError> {
        match self {
            NetworkProvider::Memory(net) => Ok(Box::new(net.dial(id).await?) as BoxedConn),
            NetworkProvider::Unix { socket_dir } => {
                let path = socket_dir.join(format!("{id}.sock"));
                if !path.exists() {
                    return Err(UptermdError::NotFound(id.to_string()));
                }
                Ok(Box::new(UnixStream::connect(path).await?) as BoxedConn)
            }
        }
    }
}

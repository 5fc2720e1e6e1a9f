use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use uptermd_common::UptermdError;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// A process-wide registry of named in-memory listeners. `Listen(name)`
/// registers a slot that `Dial(name)` can connect to; the two ends of a
/// successful dial are a pair of `tokio::io::duplex` halves, so the caller
/// sees an ordinary `AsyncRead + AsyncWrite` stream with no OS socket
/// involved.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>>,
}

/// The listening half of a named in-memory rendezvous. Dropping it removes
/// the name from the registry.
pub struct MemoryListener {
    name: String,
    registry: Arc<Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>>,
    incoming: mpsc::Receiver<DuplexStream>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn listen(&self, name: impl Into<String>) -> Result<MemoryListener, UptermdError> {
        let name = name.into();
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&name) {
            return Err(UptermdError::AlreadyExists(name));
        }
        let (tx, rx) = mpsc::channel(8);
        listeners.insert(name.clone(), tx);
        Ok(MemoryListener {
            name,
            registry: self.listeners.clone(),
            incoming: rx,
        })
    }

    pub async fn dial(&self, name: &str) -> Result<DuplexStream, UptermdError> {
        let sender = {
            let listeners = self.listeners.lock().await;
            listeners
                .get(name)
                .cloned()
                .ok_or_else(|| UptermdError::NotFound(name.to_string()))?
        };
        let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);
        sender
            .send(theirs)
            .await
            .map_err(|_| UptermdError::NotFound(name.to_string()))?;
        Ok(ours)
    }
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.incoming.recv().await
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            registry.lock().await.remove(&name);
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn dial_without_listener_is_not_found() {
        let net = MemoryNetwork::new();
        assert!(matches!(
            net.dial("nope").await,
            Err(UptermdError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_listen_is_already_exists() {
        let net = MemoryNetwork::new();
        let _first = net.listen("s1").await.unwrap();
        assert!(matches!(
            net.listen("s1").await,
            Err(UptermdError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn dial_and_accept_splice_bytes() {
        let net = MemoryNetwork::new();
        let mut listener = net.listen("s1").await.unwrap();

        let dial_net = net.clone();
        let dialer = tokio::spawn(async move { dial_net.dial("s1").await.unwrap() });

        let mut server_side = listener.accept().await.unwrap();
        let mut client_side = dialer.await.unwrap();

        client_side.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}

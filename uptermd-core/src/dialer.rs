use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;
use uptermd_common::identifier::IdentifierKind;
use uptermd_common::{Identifier, UptermdError};

use crate::directory::{DirectoryBackend, SessionDirectory};
use crate::network::{BoxedConn, NetworkProvider, SessionProvider, SshdProvider};

/// Resolves a decoded SSH identifier to the right upstream connection: the
/// local SSHD loopback for a host publish, the local session rendezvous for
/// a client whose session lives here, or a TCP hop to the node that does own
/// it (a "sideways" forward).
pub struct ConnectionDialer {
    network: NetworkProvider,
    directory: Arc<SessionDirectory>,
    own_addr: String,
}

impl ConnectionDialer {
    pub fn new(network: NetworkProvider, directory: Arc<SessionDirectory>, own_addr: String) -> Self {
        Self {
            network,
            directory,
            own_addr,
        }
    }

    pub fn own_addr(&self) -> &str {
        &self.own_addr
    }

    pub async fn dial(&self, identifier: &Identifier) -> Result<BoxedConn, UptermdError> {
        if identifier.kind == IdentifierKind::Host {
            debug!(id = %identifier.id, "dialing local sshd loopback for host publish");
            return self.network.dial_sshd().await;
        }

        let target = self.resolve_target(identifier).await?;

        if target == self.own_addr {
            debug!(id = %identifier.id, "dialing local session rendezvous");
            return self.network.dial_session(&identifier.id).await;
        }

        if target.is_empty() {
            return Err(UptermdError::RoutingLoop(identifier.id.clone()));
        }

        debug!(id = %identifier.id, %target, "hopping to the node that owns this session");
        let stream = TcpStream::connect(&target)
            .await
            .map_err(UptermdError::Io)?;
        Ok(Box::new(stream))
    }

    async fn resolve_target(&self, identifier: &Identifier) -> Result<String, UptermdError> {
        if let Some(node_addr) = &identifier.node_addr {
            if !node_addr.is_empty() {
                return Ok(node_addr.clone());
            }
        }
        let session = self.directory.get(&identifier.id).await?;
        Ok(session.node_addr)
    }
}

#[cfg(test)]
mod tests {
    use uptermd_common::identifier::IdentifierKind;

    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::session::Session;

    fn host_identifier() -> Identifier {
        Identifier::new("s1", IdentifierKind::Host, None)
    }

    #[tokio::test]
    async fn host_publish_dials_local_sshd() {
        let network = NetworkProvider::memory();
        let directory = Arc::new(SessionDirectory::Memory(MemoryDirectory::new()));
        let dialer = ConnectionDialer::new(network.clone(), directory, "node-a:22".into());

        let mut sshd = network.listen_sshd().await.unwrap();
        let dial = tokio::spawn(async move { dialer.dial(&host_identifier()).await });
        let _accepted = sshd.accept().await.unwrap();
        dial.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn client_for_unknown_session_is_not_found() {
        let network = NetworkProvider::memory();
        let directory = Arc::new(SessionDirectory::Memory(MemoryDirectory::new()));
        let dialer = ConnectionDialer::new(network, directory, "node-a:22".into());

        let identifier = Identifier::new("missing", IdentifierKind::Client, None);
        let err = dialer.dial(&identifier).await.unwrap_err();
        assert!(matches!(err, UptermdError::NotFound(_)));
    }

    #[tokio::test]
    async fn client_for_locally_owned_session_dials_rendezvous() {
        let network = NetworkProvider::memory();
        let directory = Arc::new(SessionDirectory::Memory(MemoryDirectory::new()));
        directory
            .store(Session {
                id: "s1".into(),
                node_addr: "node-a:22".into(),
                host_user: "alice".into(),
                host_public_keys: vec![],
                client_authorized_keys: vec![],
            })
            .await
            .unwrap();
        let dialer = ConnectionDialer::new(network.clone(), directory, "node-a:22".into());

        let mut rendezvous = network.listen_session("s1").await.unwrap();
        let identifier = Identifier::new("s1", IdentifierKind::Client, None);
        let dial = tokio::spawn(async move { dialer.dial(&identifier).await });
        let _accepted = rendezvous.accept().await.unwrap();
        dial.await.unwrap().unwrap();
    }
}

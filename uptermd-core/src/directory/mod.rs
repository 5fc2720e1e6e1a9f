mod etcd;
mod memory;

pub use etcd::EtcdDirectory;
pub use memory::MemoryDirectory;
use uptermd_common::UptermdError;

use crate::session::Session;

/// The `SessionStore` capability from the spec: the only thing the rest of
/// the system needs to know about where sessions live.
pub trait DirectoryBackend: Send + Sync {
    async fn store(&self, session: Session) -> Result<(), UptermdError>;
    async fn get(&self, id: &str) -> Result<Session, UptermdError>;
    async fn delete(&self, id: &str) -> Result<(), UptermdError>;
    async fn list(&self) -> Result<Vec<Session>, UptermdError>;
    async fn batch_delete(&self, ids: &[String]) -> Result<(), UptermdError>;
}

/// Picks and owns one concrete directory backend for the process's lifetime.
pub enum SessionDirectory {
    Memory(MemoryDirectory),
    Etcd(EtcdDirectory),
}

impl DirectoryBackend for SessionDirectory {
    async fn store(&self, session: Session) -> Result<(), UptermdError> {
        match self {
            SessionDirectory::Memory(d) => d.store(session).await,
            SessionDirectory::Etcd(d) => d.store(session).await,
        }
    }

    async fn get(&self, id: &str) -> Result<Session, UptermdError> {
        match self {
            SessionDirectory::Memory(d) => d.get(id).await,
            SessionDirectory::Etcd(d) => d.get(id).await,
        }
    }

    async fn delete(&self, id: &str) -> Result<(), UptermdError> {
        match self {
            SessionDirectory::Memory(d) => d.delete(id).await,
            SessionDirectory::Etcd(d) => d.delete(id).await,
        }
    }

    async fn list(&self) -> Result<Vec<Session>, UptermdError> {
        match self {
            SessionDirectory::Memory(d) => d.list().await,
            SessionDirectory::Etcd(d) => d.list().await,
        }
    }

    async fn batch_delete(&self, ids: &[String]) -> Result<(), UptermdError> {
        match self {
            SessionDirectory::Memory(d) => d.batch_delete(ids).await,
            SessionDirectory::Etcd(d) => d.batch_delete(ids).await,
        }
    }
}

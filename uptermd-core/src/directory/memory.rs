use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uptermd_common::UptermdError;

use crate::directory::DirectoryBackend;
use crate::session::Session;

/// A single-node, in-memory session directory. Used when the deployment is
/// a lone node or tests don't need cross-node replication.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DirectoryBackend for MemoryDirectory {
    async fn store(&self, session: Session) -> Result<(), UptermdError> {
        self.sessions.write().await.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Session, UptermdError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| UptermdError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<(), UptermdError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Session>, UptermdError> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }

    async fn batch_delete(&self, ids: &[String]) -> Result<(), UptermdError> {
        let mut sessions = self.sessions.write().await;
        for id in ids {
            sessions.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, node: &str) -> Session {
        Session {
            id: id.into(),
            node_addr: node.into(),
            host_user: "alice".into(),
            host_public_keys: vec![],
            client_authorized_keys: vec![],
        }
    }

    #[tokio::test]
    async fn store_then_get_is_immediately_visible() {
        let dir = MemoryDirectory::new();
        dir.store(session("s1", "node-a:22")).await.unwrap();
        let got = dir.get("s1").await.unwrap();
        assert_eq!(got.node_addr, "node-a:22");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let dir = MemoryDirectory::new();
        assert!(matches!(dir.get("nope").await, Err(UptermdError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = MemoryDirectory::new();
        dir.store(session("s1", "node-a:22")).await.unwrap();
        dir.delete("s1").await.unwrap();
        dir.delete("s1").await.unwrap();
        assert!(dir.get("s1").await.is_err());
    }

    #[tokio::test]
    async fn batch_delete_removes_only_owned_sessions() {
        let dir = MemoryDirectory::new();
        dir.store(session("s1", "node-a:22")).await.unwrap();
        dir.store(session("s2", "node-b:22")).await.unwrap();
        dir.batch_delete(&["s1".to_string()]).await.unwrap();
        assert!(dir.get("s1").await.is_err());
        assert!(dir.get("s2").await.is_ok());
    }
}

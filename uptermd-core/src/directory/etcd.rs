use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Client, Compare, GetOptions, PutOptions, Txn, TxnOp, WatchOptions};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uptermd_common::UptermdError;

use crate::directory::DirectoryBackend;
use crate::session::Session;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);
const BATCH_DELETE_CHUNK: usize = 64;

/// Session directory backed by etcd: each session is a lease-owned key, so a
/// crashed node's sessions disappear on their own once the lease expires. A
/// background watch mirrors the whole prefix into a local cache so `get`
/// usually never leaves the process.
pub struct EtcdDirectory {
    client: Client,
    prefix: String,
    ttl_secs: i64,
    cache: Arc<RwLock<HashMap<String, Session>>>,
    watch_task: tokio::task::JoinHandle<()>,
}

impl EtcdDirectory {
    pub async fn connect(
        endpoints: Vec<String>,
        prefix: String,
        ttl: Duration,
    ) -> Result<Self, UptermdError> {
        let mut client = Client::connect(endpoints, None)
            .await
            .map_err(|e| UptermdError::Directory(e.to_string()))?;

        let cache = Arc::new(RwLock::new(HashMap::new()));
        let session_prefix = format!("{prefix}/sessions/");

        // Prime the cache before the watch starts so `get` is never wrong
        // about keys that already existed.
        let initial = client
            .get(
                session_prefix.clone(),
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(|e| UptermdError::Directory(e.to_string()))?;
        {
            let mut cache = cache.write().await;
            for kv in initial.kvs() {
                if let Ok(session) = serde_json::from_slice::<Session>(kv.value()) {
                    cache.insert(session.id.clone(), session);
                }
            }
        }

        let (mut watcher, mut stream) = client
            .watch(
                session_prefix.clone(),
                Some(WatchOptions::new().with_prefix()),
            )
            .await
            .map_err(|e| UptermdError::Directory(e.to_string()))?;
        // Keep the watch id alive for the lifetime of the task; nothing
        // cancels it explicitly, it ends when the task is aborted.
        let _ = watcher.watch_id();

        let watch_cache = cache.clone();
        let watch_task = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(resp) = stream.next().await {
                match resp {
                    Ok(resp) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            match event.event_type() {
                                etcd_client::EventType::Put => {
                                    if let Ok(session) =
                                        serde_json::from_slice::<Session>(kv.value())
                                    {
                                        watch_cache
                                            .write()
                                            .await
                                            .insert(session.id.clone(), session);
                                    }
                                }
                                etcd_client::EventType::Delete => {
                                    if let Some(id) = kv
                                        .key_str()
                                        .ok()
                                        .and_then(|k| k.rsplit('/').next())
                                    {
                                        watch_cache.write().await.remove(id);
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "etcd watch stream error, continuing");
                    }
                }
            }
            debug!("etcd watch stream ended");
        });

        Ok(Self {
            client,
            prefix,
            ttl_secs: ttl.as_secs().max(1) as i64,
            cache,
            watch_task,
        })
    }

    fn key_for(&self, id: &str) -> String {
        format!("{}/sessions/{id}", self.prefix)
    }

    async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, UptermdError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, etcd_client::Error>>,
    {
        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < RETRY_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(UptermdError::Directory(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

impl Drop for EtcdDirectory {
    fn drop(&mut self) {
        self.watch_task.abort();
    }
}

impl DirectoryBackend for EtcdDirectory {
    async fn store(&self, session: Session) -> Result<(), UptermdError> {
        let key = self.key_for(&session.id);
        let value = serde_json::to_vec(&session).map_err(|e| UptermdError::Directory(e.to_string()))?;

        // A lease binds the key to its creator, so an update must drop the
        // old lease first rather than overwrite in place.
        let _ = self.client.clone().delete(key.clone(), None).await;

        let mut client = self.client.clone();
        let ttl_secs = self.ttl_secs;
        let lease = self
            .retry(|| {
                let mut client = client.clone();
                async move { client.lease_grant(ttl_secs, None).await }
            })
            .await?;
        let lease_id = lease.id();

        self.retry(|| {
            let mut client = client.clone();
            let key = key.clone();
            let value = value.clone();
            async move {
                client
                    .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
                    .await
            }
        })
        .await?;

        self.cache.write().await.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Session, UptermdError> {
        if let Some(session) = self.cache.read().await.get(id).cloned() {
            return Ok(session);
        }

        let key = self.key_for(id);
        let mut client = self.client.clone();
        let resp = self
            .retry(|| {
                let mut client = client.clone();
                let key = key.clone();
                async move { client.get(key, None).await }
            })
            .await?;
        let kv = resp.kvs().first().ok_or_else(|| UptermdError::NotFound(id.to_string()))?;
        let session: Session =
            serde_json::from_slice(kv.value()).map_err(|e| UptermdError::Directory(e.to_string()))?;
        self.cache.write().await.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn delete(&self, id: &str) -> Result<(), UptermdError> {
        let key = self.key_for(id);
        let mut client = self.client.clone();
        self.retry(|| {
            let mut client = client.clone();
            let key = key.clone();
            async move { client.delete(key, None).await }
        })
        .await?;
        self.cache.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Session>, UptermdError> {
        Ok(self.cache.read().await.values().cloned().collect())
    }

    async fn batch_delete(&self, ids: &[String]) -> Result<(), UptermdError> {
        for chunk in ids.chunks(BATCH_DELETE_CHUNK) {
            let ops: Vec<TxnOp> = chunk
                .iter()
                .map(|id| TxnOp::delete(self.key_for(id), None))
                .collect();
            let txn = Txn::new()
                .when(Vec::<Compare>::new())
                .and_then(ops)
                .or_else(Vec::<TxnOp>::new());
            let mut client = self.client.clone();
            self.retry(|| {
                let mut client = client.clone();
                let txn = txn.clone();
                async move { client.txn(txn).await }
            })
            .await?;
        }
        let mut cache = self.cache.write().await;
        for id in ids {
            cache.remove(id);
        }
        Ok(())
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use data_encoding::BASE64URL_NOPAD;
use russh::server::{Auth, Config as RusshConfig, Handle, Handler, Msg, Server as RusshServer, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uptermd_common::version::server_version;
use uptermd_core::directory::DirectoryBackend;
use uptermd_core::network::{NetworkProvider, SessionProvider};
use uptermd_core::session::Session as DirectorySession;
use uptermd_core::SessionDirectory;

/// Only the host-facing server. Refuses every interactive channel; accepts
/// reverse port forwards keyed by session id and nothing else.
pub struct SshdServer {
    network: NetworkProvider,
    directory: Arc<SessionDirectory>,
    own_addr: String,
}

impl SshdServer {
    pub fn new(network: NetworkProvider, directory: Arc<SessionDirectory>, own_addr: String) -> Self {
        Self {
            network,
            directory,
            own_addr,
        }
    }
}

impl RusshServer for SshdServer {
    type Handler = SshdHandler;

    fn new_client(&mut self, addr: Option<std::net::SocketAddr>) -> SshdHandler {
        debug!(?addr, "new sshd client");
        SshdHandler {
            network: self.network.clone(),
            directory: self.directory.clone(),
            own_addr: self.own_addr.clone(),
            authenticated_user: None,
            host_public_keys: Vec::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct SshdHandler {
    network: NetworkProvider,
    directory: Arc<SessionDirectory>,
    own_addr: String,
    authenticated_user: Option<String>,
    host_public_keys: Vec<Vec<u8>>,
    active: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl Handler for SshdHandler {
    type Error = anyhow::Error;

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // The SSHD only ever talks global requests to hosts; no shells, no
        // subsystems.
        Ok(false)
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Permissive by design: the SSHD's own key check is not where
        // authorization happens. A joining client is only let through once
        // the auth piper (C7) checks its key against the session's allow
        // list, which is enforced on the other, client-facing listener.
        self.authenticated_user = Some(user.to_string());
        if let Ok(openssh) = key.to_openssh() {
            self.host_public_keys.push(openssh.into_bytes());
        }
        Ok(Auth::Accept)
    }

    async fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (id, client_authorized_keys) = parse_socket_path(socket_path);
        let handle = session.handle();

        let mut listener = match self.network.listen_session(&id).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(%id, %err, "rejecting duplicate streamlocal-forward");
                return Ok(false);
            }
        };

        let directory_session = DirectorySession {
            id: id.clone(),
            node_addr: self.own_addr.clone(),
            host_user: self.authenticated_user.clone().unwrap_or_default(),
            host_public_keys: self.host_public_keys.clone(),
            client_authorized_keys,
        };
        self.directory.store(directory_session).await?;
        info!(%id, "session published");

        let socket_path_for_task = id.clone();
        let task_handle = tokio::spawn(async move {
            loop {
                let conn = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let handle = handle.clone();
                let socket_path = socket_path_for_task.clone();
                tokio::spawn(async move {
                    if let Err(err) = relay_to_host(handle, socket_path.clone(), conn).await {
                        debug!(id = %socket_path, %err, "rendezvous relay ended");
                    }
                });
            }
        });

        self.active.lock().await.insert(id, task_handle);
        Ok(true)
    }

    async fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (id, _) = parse_socket_path(socket_path);
        if let Some(task) = self.active.lock().await.remove(&id) {
            task.abort();
        }
        self.directory.delete(&id).await?;
        info!(%id, "session forward cancelled");
        Ok(true)
    }
}

impl Drop for SshdHandler {
    fn drop(&mut self) {
        let active = self.active.clone();
        let directory = self.directory.clone();
        tokio::spawn(async move {
            let ids: Vec<String> = {
                let mut active = active.lock().await;
                active.values().for_each(|h| h.abort());
                active.drain().map(|(id, _)| id).collect()
            };
            if !ids.is_empty() {
                let _ = directory.batch_delete(&ids).await;
            }
        });
    }
}

/// Relays raw bytes, full duplex, between a session-rendezvous connection
/// (the joining client's leg, already dialed through the routing layer) and
/// a fresh `forwarded-streamlocal` channel opened back to the host. Neither
/// side is SSH-aware here — the actual SSH handshake between client and host
/// happens end to end, through this tunnel.
async fn relay_to_host(
    handle: Handle,
    socket_path: String,
    mut conn: uptermd_core::network::BoxedConn,
) -> anyhow::Result<()> {
    let mut channel = handle.channel_open_forwarded_streamlocal(socket_path).await?;

    let mut buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            read = conn.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let _ = channel.eof().await;
                        break;
                    }
                    Ok(n) => channel.data(&buf[..n]).await?,
                    Err(err) => return Err(err.into()),
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(russh::ChannelMsg::Data { data }) => {
                        conn.write_all(&data).await?;
                    }
                    Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }
    }
    Ok(())
}

pub fn sshd_config(keys: Vec<russh::keys::PrivateKey>, keepalive: std::time::Duration) -> RusshConfig {
    RusshConfig {
        server_id: russh::SshId::Standard(server_version()),
        keys,
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        keepalive_interval: Some(keepalive),
        ..<_>::default()
    }
}

/// Splits a `streamlocal-forward@openssh.com` `SocketPath` into the bare
/// session id and an optional client-authorized-keys list the host declares
/// at publish time. The host's own client embeds the list the same way the
/// SSH `user` string embeds a node address: `"<id>;" + base64url(keys)`,
/// where `keys` is each OpenSSH-format public key on its own line. A plain
/// `SocketPath` with no `;` means "anyone may join" (empty allow list).
fn parse_socket_path(socket_path: &str) -> (String, Vec<Vec<u8>>) {
    let Some((id, encoded_keys)) = socket_path.split_once(';') else {
        return (socket_path.to_string(), Vec::new());
    };
    let keys = BASE64URL_NOPAD
        .decode(encoded_keys.as_bytes())
        .ok()
        .map(|blob| {
            blob.split(|&b| b == b'\n')
                .filter(|line| !line.is_empty())
                .map(|line| line.to_vec())
                .collect()
        })
        .unwrap_or_default();
    (id.to_string(), keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_socket_path_without_keys_is_plain_id() {
        let (id, keys) = parse_socket_path("abc123");
        assert_eq!(id, "abc123");
        assert!(keys.is_empty());
    }

    #[test]
    fn parse_socket_path_decodes_authorized_keys() {
        let blob = b"ssh-ed25519 AAAA1\nssh-ed25519 AAAA2".to_vec();
        let encoded = BASE64URL_NOPAD.encode(&blob);
        let socket_path = format!("abc123;{encoded}");
        let (id, keys) = parse_socket_path(&socket_path);
        assert_eq!(id, "abc123");
        assert_eq!(keys, vec![b"ssh-ed25519 AAAA1".to_vec(), b"ssh-ed25519 AAAA2".to_vec()]);
    }

    #[test]
    fn parse_socket_path_tolerates_malformed_suffix() {
        let (id, keys) = parse_socket_path("abc123;not-base64url!!!");
        assert_eq!(id, "abc123");
        assert!(keys.is_empty());
    }
}

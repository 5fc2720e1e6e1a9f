use std::collections::HashMap;
use std::sync::Arc;

use russh::keys::PrivateKey;
use russh::server::{Auth, Handle as ServerHandle, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uptermd_common::identifier::{Identifier, IdentifierCodec, IdentifierKind};
use uptermd_common::types::AuthRequest;
use uptermd_core::dialer::ConnectionDialer;
use uptermd_core::directory::{DirectoryBackend, SessionDirectory};

use crate::keys::{decode_auth_cert, mint_auth_cert};
use crate::piper::channel::{spawn_piper_channel, PiperOperation};
use crate::piper::client_handler::PiperClientHandler;

/// The client-facing half of the auth piper. Terminates the downstream SSH
/// connection, validates the joining key against the session's allow list,
/// then opens a brand new upstream SSH client handshake — straight through
/// the raw rendezvous tunnel to the host's own embedded SSH server — and
/// relays every subsequent channel operation between the two.
pub struct PiperHandler {
    pub dialer: Arc<ConnectionDialer>,
    pub directory: Arc<SessionDirectory>,
    pub identifier_codec: IdentifierCodec,
    pub signers: Arc<Vec<PrivateKey>>,
    pub client_version: String,
    pub remote_addr: String,

    identifier: Option<Identifier>,
    /// The raw SSH `user` string the connection authenticated with —
    /// `connection.User()` in spec terms, used verbatim as the minted
    /// certificate's principal and as the upstream auth username. This is
    /// not the host's own username; it's whatever the downstream presented.
    raw_user: Option<String>,
    presented_key: Option<Vec<u8>>,
    upstream: Option<russh::client::Handle<PiperClientHandler>>,
    channels: Arc<Mutex<HashMap<ChannelId, UnboundedSender<PiperOperation>>>>,
}

impl PiperHandler {
    pub fn new(
        dialer: Arc<ConnectionDialer>,
        directory: Arc<SessionDirectory>,
        identifier_codec: IdentifierCodec,
        signers: Arc<Vec<PrivateKey>>,
        client_version: String,
        remote_addr: String,
    ) -> Self {
        Self {
            dialer,
            directory,
            identifier_codec,
            signers,
            client_version,
            remote_addr,
            identifier: None,
            raw_user: None,
            presented_key: None,
            upstream: None,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn send_op(&self, channel: ChannelId, op: PiperOperation) {
        if let Some(tx) = self.channels.lock().await.get(&channel) {
            let _ = tx.send(op);
        }
    }
}

impl Handler for PiperHandler {
    type Error = anyhow::Error;

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
        let identifier = match self.identifier_codec.decode(user, &self.client_version) {
            Ok(identifier) => identifier,
            Err(_) => {
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        };
        if identifier.kind != IdentifierKind::Client {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        let session = match self.directory.get(&identifier.id).await {
            Ok(session) => session,
            Err(_) => {
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        };

        // A presented key that is itself a certificate signed by one of our
        // own host signers and carrying the AuthRequest extension is a
        // sideways hop: a peer node already authenticated the real client
        // and re-piped the connection to us. Decode the original presented
        // key out of the extension instead of treating the cert as a fresh
        // client key.
        let presented_key =
            if let ssh_key::public::KeyData::Certificate(cert) = key.key_data() {
                let ca_key = cert.signature_key().to_openssh().unwrap_or_default();
                let signed_by_us = self.signers.iter().any(|signer| {
                    russh::keys::PublicKey::from(signer.public_key().clone())
                        .to_openssh()
                        .map(|ours| ours == ca_key)
                        .unwrap_or(false)
                });
                if !signed_by_us {
                    return Ok(Auth::Reject {
                        proceed_with_methods: None,
                    });
                }
                let Some(auth_request) = decode_auth_cert(cert) else {
                    return Ok(Auth::Reject {
                        proceed_with_methods: None,
                    });
                };
                auth_request.authorized_key
            } else {
                key.to_openssh().unwrap_or_default().into_bytes()
            };

        // Allow-list enforcement only happens on the node that owns the
        // session; a sideways hop defers to whichever node actually owns it.
        if session.node_addr == self.dialer.own_addr() && !session.is_client_key_allowed(&presented_key) {
            debug!(id = %identifier.id, "client key not in session allow list");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        self.identifier = Some(identifier);
        self.raw_user = Some(user.to_string());
        self.presented_key = Some(presented_key);
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        let identifier = self
            .identifier
            .clone()
            .ok_or_else(|| anyhow::anyhow!("auth succeeded without a decoded identifier"))?;
        let principal = self
            .raw_user
            .clone()
            .ok_or_else(|| anyhow::anyhow!("auth succeeded without the connection's raw user"))?;

        let session_record = self.directory.get(&identifier.id).await?;
        // The final hop trusts one of the session's declared host keys; a
        // sideways hop trusts one of our own signers (the peer we forwarded
        // to is itself a piper, not yet the real host).
        let mut expected_host_keys: Vec<String> = session_record
            .host_public_keys
            .iter()
            .filter_map(|k| String::from_utf8(k.clone()).ok())
            .collect();
        for signer in self.signers.iter() {
            if let Ok(openssh) = russh::keys::PublicKey::from(signer.public_key().clone()).to_openssh() {
                expected_host_keys.push(openssh);
            }
        }

        let conn = self.dialer.dial(&identifier).await?;

        let auth_request = AuthRequest {
            client_version: self.client_version.clone(),
            remote_addr: self.remote_addr.clone(),
            authorized_key: self.presented_key.clone().unwrap_or_default(),
        };

        let client_config = Arc::new(russh::client::Config::default());
        let client_handler = PiperClientHandler {
            expected_host_keys,
        };
        let handle = russh::client::connect_stream(client_config, conn, client_handler).await?;

        // Try each configured signer in turn: the upstream may only trust
        // one of our certificate authorities.
        let mut authed = false;
        for signer in self.signers.iter() {
            let cert = mint_auth_cert(signer, &principal, &identifier.id, &auth_request)?;
            let mut signed = signer.clone();
            signed.set_certificate(cert)?;
            if handle
                .authenticate_publickey(principal.clone(), Arc::new(signed))
                .await?
            {
                authed = true;
                break;
            }
        }
        if !authed {
            return Err(anyhow::anyhow!("upstream host rejected the piped credential"));
        }

        info!(id = %identifier.id, "piped connection established");
        self.upstream = Some(handle);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(upstream) = &self.upstream else {
            return Ok(false);
        };
        let downstream_handle = session.handle();
        let downstream_id = channel.id();
        let upstream_channel = upstream.channel_open_session().await?;
        let tx = spawn_piper_channel(upstream_channel, downstream_handle, downstream_id);
        self.channels.lock().await.insert(downstream_id, tx);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let modes = modes
            .iter()
            .take_while(|m| (m.0 as u8) > 0 && (m.0 as u8) < 160)
            .cloned()
            .collect();
        self.send_op(
            channel,
            PiperOperation::PtyRequest {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            },
        )
        .await;
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.send_op(channel, PiperOperation::Shell).await;
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_op(channel, PiperOperation::Exec(data.to_vec())).await;
        session.channel_success(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_op(channel, PiperOperation::Subsystem(name.to_string())).await;
        session.channel_success(channel)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_op(
            channel,
            PiperOperation::Env {
                name: variable_name.to_string(),
                value: variable_value.to_string(),
            },
        )
        .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_op(
            channel,
            PiperOperation::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn signal(&mut self, channel: ChannelId, signal_name: Sig, _session: &mut Session) -> Result<(), Self::Error> {
        self.send_op(channel, PiperOperation::Signal(signal_name)).await;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_op(
            channel,
            PiperOperation::X11Request {
                single_connection,
                auth_protocol: x11_auth_protocol.to_string(),
                auth_cookie: x11_auth_cookie.to_string(),
                screen_number: x11_screen_number,
            },
        )
        .await;
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        self.send_op(channel, PiperOperation::Data(data.to_vec())).await;
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_op(
            channel,
            PiperOperation::ExtendedData {
                ext: code,
                data: data.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.send_op(channel, PiperOperation::Eof).await;
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.send_op(channel, PiperOperation::Close).await;
        self.channels.lock().await.remove(&channel);
        Ok(())
    }
}

impl Drop for PiperHandler {
    fn drop(&mut self) {
        debug!("piped connection torn down");
    }
}

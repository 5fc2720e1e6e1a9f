use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uptermd_common::identifier::{classify_client_version, IdentifierCodec, IdentifierKind};
use uptermd_common::version::server_version;
use uptermd_core::dialer::ConnectionDialer;
use uptermd_core::directory::SessionDirectory;
use uptermd_core::metrics::Metrics;
use uptermd_core::network::{NetworkProvider, SshdProvider};

use crate::piper::PiperHandler;

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BANNER_LEN: usize = 4096;

/// Wraps a stream whose first bytes were already consumed by the routing
/// peek, re-serving them before resuming reads from the real socket. Nothing
/// downstream — neither the raw host splice nor russh's own handshake
/// reader — ever finds out the prefix was buffered.
struct PeekedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S: Unpin> AsyncRead for PeekedStream<S>
where
    S: AsyncRead,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: Unpin> AsyncWrite for PeekedStream<S>
where
    S: AsyncWrite,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Peeks the cleartext SSH identification line (RFC 4253 §4.2, sent before
/// any key exchange) off `stream`, without losing a single byte of it: the
/// bytes read here are handed back wrapped in a `PeekedStream`.
async fn peek_identification<S>(mut stream: S) -> io::Result<(String, PeekedStream<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if prefix.len() >= MAX_BANNER_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "identification line too long"));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before banner"));
        }
        prefix.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    let line = String::from_utf8_lossy(&prefix).trim_end().to_string();
    Ok((line, PeekedStream { prefix, pos: 0, inner: stream }))
}

pub struct SshFrontend {
    network: NetworkProvider,
    directory: Arc<SessionDirectory>,
    dialer: Arc<ConnectionDialer>,
    identifier_codec: IdentifierCodec,
    signers: Arc<Vec<PrivateKey>>,
    handshake_timeout: Duration,
    keepalive_interval: Duration,
    metrics: Arc<Metrics>,
}

impl SshFrontend {
    pub fn new(
        network: NetworkProvider,
        directory: Arc<SessionDirectory>,
        dialer: Arc<ConnectionDialer>,
        identifier_codec: IdentifierCodec,
        signers: Arc<Vec<PrivateKey>>,
        handshake_timeout: Duration,
        keepalive_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            network,
            directory,
            dialer,
            identifier_codec,
            signers,
            handshake_timeout,
            keepalive_interval,
            metrics,
        }
    }

    pub async fn run(self, listen: std::net::SocketAddr, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(listen).await?;
        info!(%listen, "ssh routing frontend listening");
        let this = Arc::new(self);

        let mut backoff = MIN_BACKOFF;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("ssh frontend shutting down");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            backoff = MIN_BACKOFF;
                            let _ = stream.set_nodelay(true);
                            let this = this.clone();
                            tokio::spawn(async move {
                                this.metrics.routing_connections_count.inc();
                                this.metrics.routing_active_connections_count.inc();
                                let started = Instant::now();

                                let result = tokio::time::timeout(
                                    this.handshake_timeout,
                                    this.handle_connection(stream, remote_addr.to_string()),
                                )
                                .await;

                                this.metrics.routing_active_connections_count.dec();
                                this.metrics
                                    .routing_connection_duration_seconds
                                    .observe(started.elapsed().as_secs_f64());

                                match result {
                                    Err(_) => {
                                        this.metrics.routing_connection_timeout_count.inc();
                                        warn!(%remote_addr, "connection exceeded handshake deadline");
                                    }
                                    Ok(Err(err)) => {
                                        this.metrics.routing_errors_count.inc();
                                        debug!(%remote_addr, %err, "connection ended in error");
                                    }
                                    Ok(Ok(())) => {}
                                }
                            });
                        }
                        Err(err) => {
                            error!(%err, "accept failed, backing off");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream, remote_addr: String) -> anyhow::Result<()> {
        let (client_version, stream) = peek_identification(stream).await?;
        let kind = classify_client_version(&client_version);

        match kind {
            IdentifierKind::Host => {
                debug!(%remote_addr, "routing raw host connection to local sshd");
                let upstream = self.network.dial_sshd().await?;
                splice(stream, upstream).await
            }
            IdentifierKind::Client => {
                debug!(%remote_addr, "terminating client connection at the auth piper");
                let config = Arc::new(piper_config((*self.signers).clone(), self.keepalive_interval));
                let handler = PiperHandler::new(
                    self.dialer.clone(),
                    self.directory.clone(),
                    self.identifier_codec,
                    self.signers.clone(),
                    client_version,
                    remote_addr,
                );
                let session = russh::server::run_stream(config, stream, handler).await?;
                session.await?;
                Ok(())
            }
        }
    }
}

async fn splice<A, B>(mut a: A, mut b: B) -> anyhow::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::io::copy_bidirectional(&mut a, &mut b).await?;
    Ok(())
}

fn piper_config(keys: Vec<PrivateKey>, keepalive: Duration) -> russh::server::Config {
    russh::server::Config {
        server_id: russh::SshId::Standard(server_version()),
        keys,
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        keepalive_interval: Some(keepalive),
        ..<_>::default()
    }
}

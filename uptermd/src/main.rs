use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use poem::listener::TcpListener;
use poem::{get, handler, EndpointExt, Route, Server};
use tracing::{error, info, warn};
use uptermd_common::config::{Config, DirectoryConfig, NetworkConfig};
use uptermd_core::directory::{DirectoryBackend, EtcdDirectory, MemoryDirectory, SessionDirectory};
use uptermd_core::dialer::ConnectionDialer;
use uptermd_core::metrics::Metrics;
use uptermd_core::network::NetworkProvider;
use uptermd_ssh::keys::{generate_host_keys, load_host_keys};
use uptermd_ssh::sshd::{sshd_config, SshdServer};
use uptermd_ssh::SshFrontend;

mod cli;
mod config;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    uptermd_common::logging::init_logging(cli.debug, cli.log_format.unwrap_or_default());

    let config = config::load_config(&cli.config).context("loading configuration")?;
    let config = config::apply_cli_overrides(config, &cli);

    match cli.command {
        Commands::GenerateHostKeys => generate_host_keys_command(&config),
        Commands::Run => run(config).await,
    }
}

fn generate_host_keys_command(config: &Config) -> Result<()> {
    let keys_dir = config.resolve_path(&config.store.ssh.host_keys_dir);
    generate_host_keys(&keys_dir).context("generating host keys")?;
    info!(dir = %keys_dir.display(), "host keys are ready");
    Ok(())
}

/// Wires up C1-C9 (network provider, directory, dialer, SSHD, routing
/// frontend, WS adapter, metrics) and runs them until a shutdown signal
/// arrives, then winds everything down within the configured deadline.
async fn run(config: Config) -> Result<()> {
    let keys_dir = config.resolve_path(&config.store.ssh.host_keys_dir);
    let signers = load_host_keys(&keys_dir).with_context(|| {
        format!(
            "loading host keys from {} (run `uptermd generate-host-keys` first)",
            keys_dir.display()
        )
    })?;
    if signers.is_empty() {
        bail!("no host keys found in {}", keys_dir.display());
    }
    let signers = Arc::new(signers);

    let ssh_listen = config.store.ssh.listen.clone();
    let own_addr = config.store.node_addr.clone().unwrap_or_else(|| ssh_listen.clone());
    info!(%own_addr, "this node's address for routing and session ownership");

    let network = match &config.store.network {
        NetworkConfig::Memory => NetworkProvider::memory(),
        NetworkConfig::Unix { socket_dir } => NetworkProvider::unix(config.resolve_path(socket_dir)),
    };

    let directory: Arc<SessionDirectory> = match &config.store.directory {
        DirectoryConfig::Embedded => Arc::new(SessionDirectory::Memory(MemoryDirectory::new())),
        DirectoryConfig::Etcd { endpoints, prefix } => {
            let backend = EtcdDirectory::connect(
                endpoints.clone(),
                prefix.clone(),
                config.store.session_ttl,
            )
            .await
            .context("connecting to the session directory backend")?;
            Arc::new(SessionDirectory::Etcd(backend))
        }
    };
    let identifier_codec = config.store.directory.identifier_codec();

    let metrics = Arc::new(Metrics::new().context("registering metrics")?);
    let dialer = Arc::new(ConnectionDialer::new(network.clone(), directory.clone(), own_addr.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sshd_task = tokio::spawn(run_sshd(
        network.clone(),
        directory.clone(),
        own_addr.clone(),
        signers.clone(),
        config.store.ssh.keepalive_interval,
        shutdown_rx.clone(),
    ));

    let frontend = SshFrontend::new(
        network.clone(),
        directory.clone(),
        dialer.clone(),
        identifier_codec,
        signers.clone(),
        config.store.ssh.handshake_timeout,
        config.store.ssh.keepalive_interval,
        metrics.clone(),
    );
    let ssh_addr = ssh_listen.parse().context("parsing ssh listen address")?;
    let frontend_task = tokio::spawn(frontend.run(ssh_addr, shutdown_rx.clone()));

    let ws_addr = config.store.ws.listen.parse().context("parsing websocket listen address")?;
    let ws_task = tokio::spawn(uptermd_ws::run(ws_addr, dialer.clone(), directory.clone(), identifier_codec));

    let metrics_addr = config.store.metrics.listen.clone();
    let metrics_task = tokio::spawn(run_metrics_server(metrics_addr, metrics.clone()));

    #[cfg(target_os = "linux")]
    if let Ok(true) = sd_notify::booted() {
        let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);
    }

    tokio::select! {
        result = frontend_task => log_component_exit("ssh routing frontend", result),
        result = ws_task => log_component_exit("websocket adapter", result),
        result = metrics_task => log_component_exit("metrics server", result),
        result = sshd_task => log_component_exit("internal sshd", result),
        _ = wait_for_shutdown_signal() => info!("shutdown signal received"),
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(config.store.shutdown_deadline).await;

    if let Ok(sessions) = directory.list().await {
        let owned: Vec<String> = sessions
            .into_iter()
            .filter(|s| s.node_addr == own_addr)
            .map(|s| s.id)
            .collect();
        if !owned.is_empty() {
            if let Err(err) = directory.batch_delete(&owned).await {
                warn!(%err, "failed to clean up sessions owned by this node");
            }
        }
    }

    Ok(())
}

fn log_component_exit(name: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!(component = name, "exited"),
        Ok(Err(err)) => error!(component = name, %err, "exited with error"),
        Err(err) => error!(component = name, %err, "panicked"),
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// The internal SSHD (C5): accepts only reverse-port-forward requests from
/// hosts, one connection at a time off the network provider's loopback.
async fn run_sshd(
    network: NetworkProvider,
    directory: Arc<SessionDirectory>,
    own_addr: String,
    signers: Arc<Vec<russh::keys::PrivateKey>>,
    keepalive: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    use uptermd_core::network::SshdProvider;

    let mut listener = network.listen_sshd().await.context("binding internal sshd loopback")?;
    let config = Arc::new(sshd_config((*signers).clone(), keepalive));
    let mut server = SshdServer::new(network, directory, own_addr);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("internal sshd shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let conn = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                        return Err(err.into());
                    }
                };
                let handler = russh::server::Server::new_client(&mut server, None);
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(err) = russh::server::run_stream(config, conn, handler).await {
                        warn!(%err, "internal sshd connection ended in error");
                    }
                });
            }
        }
    }
}

async fn run_metrics_server(listen: String, metrics: Arc<Metrics>) -> Result<()> {
    let addr = listen.parse().context("parsing metrics listen address")?;
    let app = Route::new().at("/metrics", get(render_metrics)).data(metrics);
    info!(%listen, "metrics server listening");
    Server::new(TcpListener::bind(addr)).run(app).await?;
    Ok(())
}

#[handler]
fn render_metrics(metrics: poem::web::Data<&Arc<Metrics>>) -> poem::Result<Vec<u8>> {
    metrics
        .render()
        .map_err(|err| poem::Error::from_string(err.to_string(), poem::http::StatusCode::INTERNAL_SERVER_ERROR))
}

mod adapter;

use std::net::SocketAddr;
use std::sync::Arc;

use poem::{get, Route, Server};
use poem::listener::TcpListener;
use poem::EndpointExt;
use tracing::info;
use uptermd_common::identifier::IdentifierCodec;
use uptermd_core::dialer::ConnectionDialer;
use uptermd_core::directory::SessionDirectory;

pub use adapter::WsState;

pub async fn run(
    listen: SocketAddr,
    dialer: Arc<ConnectionDialer>,
    directory: Arc<SessionDirectory>,
    identifier_codec: IdentifierCodec,
) -> anyhow::Result<()> {
    let state = Arc::new(WsState {
        dialer,
        directory,
        identifier_codec,
    });

    let app = Route::new()
        .at("/getting-started", get(adapter::getting_started))
        .at("/getting-started/*rest", get(adapter::getting_started))
        .at("/", get(adapter::join_session))
        .data(state);

    info!(%listen, "websocket adapter listening");
    Server::new(TcpListener::bind(listen)).run(app).await?;
    Ok(())
}

use std::sync::Arc;

use data_encoding::BASE64;
use futures::{SinkExt, StreamExt};
use http::StatusCode;
use poem::web::websocket::{Message, WebSocket};
use poem::web::Data;
use poem::{handler, Body, IntoResponse, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uptermd_common::identifier::IdentifierCodec;
use uptermd_common::UptermdError;
use uptermd_core::dialer::ConnectionDialer;
use uptermd_core::directory::{DirectoryBackend, SessionDirectory};

const CLIENT_VERSION_HEADER: &str = "Upterm-Client-Version";

pub struct WsState {
    pub dialer: Arc<ConnectionDialer>,
    pub directory: Arc<SessionDirectory>,
    pub identifier_codec: IdentifierCodec,
}

fn basic_auth(req: &Request) -> Option<(String, String)> {
    let value = req.headers().get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// The WebSocket entrypoint a client joins a session through: HTTP Basic
/// auth carries the encoded identifier as the username, the client's
/// identification string rides along in a header since there's no SSH
/// handshake here to carry it in-band.
#[handler]
pub async fn join_session(req: &Request, ws: WebSocket, state: Data<&Arc<WsState>>) -> poem::Result<Response> {
    let Some((user, password)) = basic_auth(req) else {
        return Ok(unauthorized());
    };
    let client_version = req
        .headers()
        .get(CLIENT_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("SSH-2.0-uptermd-ws")
        .to_string();

    // HTTP Basic Auth's single-colon split reproduces the encoded identifier
    // exactly: in embedded mode `user` is the session id and `password` is
    // the base64url node address, so rejoining them on ':' reconstructs
    // `"<id>:" + base64url(nodeAddr)` verbatim.
    let encoded_identifier = format!("{user}:{password}");
    let identifier = match state.identifier_codec.decode(&encoded_identifier, &client_version) {
        Ok(identifier) => identifier,
        Err(_) => return Ok(unauthorized()),
    };

    let session = match state.directory.get(&identifier.id).await {
        Ok(session) => session,
        Err(UptermdError::NotFound(_)) => {
            return Ok(Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()))
        }
        Err(err) => {
            warn!(%err, "session directory lookup failed");
            return Ok(Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty()));
        }
    };
    let _ = session;

    let state = state.clone();
    let identifier_for_dial = identifier.clone();
    let response = ws.on_upgrade(move |socket| async move {
        let conn = match state.dialer.dial(&identifier_for_dial).await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(id = %identifier_for_dial.id, %err, "dial failed for websocket join");
                return;
            }
        };
        if let Err(err) = splice(socket, conn).await {
            debug!(id = %identifier_for_dial.id, %err, "websocket relay ended");
        }
    });

    Ok(response.into_response())
}

async fn splice(
    socket: poem::web::websocket::WebSocketStream,
    mut conn: uptermd_core::network::BoxedConn,
) -> anyhow::Result<()> {
    let (mut sink, mut stream) = socket.split();
    let mut buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            read = conn.read(&mut buf) => {
                match read? {
                    0 => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    n => sink.send(Message::Binary(buf[..n].to_vec())).await?,
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => conn.write_all(&data).await?,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }
    Ok(())
}

fn unauthorized() -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(http::header::WWW_AUTHENTICATE, "Basic realm=\"uptermd\"")
        .body(Body::empty())
}

/// Served at `/getting-started*` for a plain `curl`/browser hit with no
/// WebSocket upgrade — same banner upterm's own server prints.
#[handler]
pub fn getting_started() -> impl IntoResponse {
    concat!(
        "Upterm-compatible terminal-sharing server.\n",
        "Join a session with: ssh <id>@<host> -p <port>\n",
    )
}

use russh::client::Msg as ClientMsg;
use russh::server::Handle as ServerHandle;
use russh::{Channel, ChannelId, ChannelMsg, Pty, Sig};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Everything a downstream channel request can turn into on the upstream
/// leg. One of these is sent per downstream `Handler` callback; the relay
/// task below applies it to the real upstream channel.
#[derive(Debug)]
pub enum PiperOperation {
    Data(Vec<u8>),
    ExtendedData { ext: u32, data: Vec<u8> },
    PtyRequest {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    Env { name: String, value: String },
    Signal(Sig),
    X11Request {
        single_connection: bool,
        auth_protocol: String,
        auth_cookie: String,
        screen_number: u32,
    },
    Eof,
    Close,
}

/// Spawns the task that owns the upstream channel: it drains `ops` onto the
/// channel and pumps every upstream `ChannelMsg` back to the matching
/// downstream channel through `downstream`. Mirrors a session channel
/// splicing one local operation queue against one remote event stream, just
/// generalized past PTY/shell to every request the piper tunnels.
pub fn spawn_piper_channel(
    mut upstream: Channel<ClientMsg>,
    downstream: ServerHandle,
    downstream_id: ChannelId,
) -> UnboundedSender<PiperOperation> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PiperOperation>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                op = rx.recv() => {
                    let Some(op) = op else { break };
                    if let Err(err) = apply(&mut upstream, op).await {
                        debug!(%err, "upstream channel op failed");
                        break;
                    }
                }
                event = upstream.wait() => {
                    match event {
                        Some(ChannelMsg::Data { data }) => {
                            let _ = downstream.data(downstream_id, data).await;
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            let _ = downstream.extended_data(downstream_id, ext, data).await;
                        }
                        Some(ChannelMsg::Eof) => {
                            let _ = downstream.eof(downstream_id).await;
                        }
                        Some(ChannelMsg::Close) => {
                            let _ = downstream.close(downstream_id).await;
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            let _ = downstream.exit_status_request(downstream_id, exit_status).await;
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, core_dumped, error_message, lang_tag }) => {
                            let _ = downstream
                                .exit_signal_request(downstream_id, signal_name, core_dumped, error_message, lang_tag)
                                .await;
                        }
                        Some(ChannelMsg::Success) => {
                            let _ = downstream.channel_success(downstream_id);
                        }
                        Some(ChannelMsg::Failure) => {
                            let _ = downstream.channel_failure(downstream_id);
                        }
                        Some(other) => {
                            warn!(?other, "unhandled upstream channel message");
                        }
                        None => {
                            let _ = downstream.close(downstream_id).await;
                            break;
                        }
                    }
                }
            }
        }
    });

    tx
}

async fn apply(channel: &mut Channel<ClientMsg>, op: PiperOperation) -> Result<(), russh::Error> {
    match op {
        PiperOperation::Data(data) => channel.data(&*data).await,
        PiperOperation::ExtendedData { ext, data } => channel.extended_data(ext, &*data).await,
        PiperOperation::PtyRequest {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            channel
                .request_pty(true, &term, col_width, row_height, pix_width, pix_height, &modes)
                .await
        }
        PiperOperation::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => channel.window_change(col_width, row_height, pix_width, pix_height).await,
        PiperOperation::Shell => channel.request_shell(true).await,
        PiperOperation::Exec(command) => channel.exec(true, command).await,
        PiperOperation::Subsystem(name) => channel.request_subsystem(true, &name).await,
        PiperOperation::Env { name, value } => channel.set_env(true, name, value).await,
        PiperOperation::Signal(signal) => channel.signal(signal).await,
        PiperOperation::X11Request {
            single_connection,
            auth_protocol,
            auth_cookie,
            screen_number,
        } => {
            channel
                .request_x11(true, single_connection, auth_protocol, auth_cookie, screen_number)
                .await
        }
        PiperOperation::Eof => channel.eof().await,
        PiperOperation::Close => channel.close().await,
    }
}

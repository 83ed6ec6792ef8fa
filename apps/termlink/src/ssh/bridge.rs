//! Per-channel relay between a client session channel and its upstream twin.

use log::debug;
use russh::client;
use russh::server::Handle;
use russh::{Channel, ChannelId, ChannelMsg, Pty};
use tokio::sync::mpsc;

/// Client-side channel activity, replayed on the upstream channel.
#[derive(Debug)]
pub enum ChannelCommand {
    Data(Vec<u8>),
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Env {
        name: String,
        value: String,
    },
    Subsystem(String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Eof,
    Close,
}

/// Client commands queued per channel before the piper stops reading from the client.
pub const COMMAND_QUEUE_DEPTH: usize = 64;

enum Event {
    Command(Option<ChannelCommand>),
    Upstream(Option<ChannelMsg>),
}

/// Queue carrying client activity into a bridge.
pub fn command_queue() -> (mpsc::Sender<ChannelCommand>, mpsc::Receiver<ChannelCommand>) {
    mpsc::channel(COMMAND_QUEUE_DEPTH)
}

/// Start relaying between `client_channel` and `upstream`.
///
/// The returned sender feeds client activity to the relay; sending waits while
/// the upstream channel is not draining. Dropping it closes the upstream
/// channel.
///
/// Writes toward the client go through the piper's session loop, so they run on
/// their own task and never hold up the command side.
pub fn spawn_bridge(
    upstream: Channel<client::Msg>,
    client: Handle,
    client_channel: ChannelId,
) -> mpsc::Sender<ChannelCommand> {
    let (tx, rx) = command_queue();
    let (to_client, from_upstream) = mpsc::unbounded_channel();
    tokio::spawn(run_bridge(upstream, client_channel, rx, to_client));
    tokio::spawn(relay_to_client(client, client_channel, from_upstream));
    tx
}

async fn run_bridge(
    mut upstream: Channel<client::Msg>,
    id: ChannelId,
    mut commands: mpsc::Receiver<ChannelCommand>,
    to_client: mpsc::UnboundedSender<ChannelMsg>,
) {
    loop {
        let event = tokio::select! {
            command = commands.recv() => Event::Command(command),
            msg = upstream.wait() => Event::Upstream(msg),
        };

        match event {
            Event::Command(Some(ChannelCommand::Close)) | Event::Command(None) => {
                let _ = upstream.close().await;
                break;
            }
            Event::Command(Some(command)) => {
                if let Err(e) = apply(&mut upstream, command).await {
                    debug!("Upstream channel for {:?} failed: {}", id, e);
                    let _ = to_client.send(ChannelMsg::Close);
                    break;
                }
            }
            Event::Upstream(Some(msg)) => {
                let closed = matches!(msg, ChannelMsg::Close);
                if to_client.send(msg).is_err() || closed {
                    break;
                }
            }
            Event::Upstream(None) => {
                let _ = to_client.send(ChannelMsg::Close);
                break;
            }
        }
    }
    debug!("Bridge for channel {:?} finished", id);
}

async fn relay_to_client(client: Handle, id: ChannelId, mut messages: mpsc::UnboundedReceiver<ChannelMsg>) {
    while let Some(msg) = messages.recv().await {
        if !relay(&client, id, msg).await {
            break;
        }
    }
}

async fn apply(upstream: &mut Channel<client::Msg>, command: ChannelCommand) -> Result<(), russh::Error> {
    match command {
        ChannelCommand::Data(data) => upstream.data(&data[..]).await,
        ChannelCommand::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            upstream
                .request_pty(false, &term, col_width, row_height, pix_width, pix_height, &modes)
                .await
        }
        ChannelCommand::Shell => upstream.request_shell(false).await,
        ChannelCommand::Exec(command) => upstream.exec(false, command).await,
        ChannelCommand::Env { name, value } => upstream.set_env(false, name, value).await,
        ChannelCommand::Subsystem(name) => upstream.request_subsystem(false, name).await,
        ChannelCommand::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            upstream
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        ChannelCommand::Eof => upstream.eof().await,
        ChannelCommand::Close => upstream.close().await,
    }
}

/// Forward one upstream message to the client. Returns false once the channel is done.
async fn relay(client: &Handle, id: ChannelId, msg: ChannelMsg) -> bool {
    match msg {
        ChannelMsg::Data { data } => client.data(id, data).await.is_ok(),
        ChannelMsg::ExtendedData { data, ext } => client.extended_data(id, ext, data).await.is_ok(),
        ChannelMsg::Eof => {
            let _ = client.eof(id).await;
            true
        }
        ChannelMsg::ExitStatus { exit_status } => {
            let _ = client.exit_status_request(id, exit_status).await;
            true
        }
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            lang_tag,
        } => {
            let _ = client
                .exit_signal_request(id, signal_name, core_dumped, error_message, lang_tag)
                .await;
            true
        }
        ChannelMsg::Close => {
            let _ = client.close(id).await;
            false
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_stalled_upstream_holds_bounded_commands() {
        let (tx, mut rx) = command_queue();
        for _ in 0..COMMAND_QUEUE_DEPTH {
            tx.send(ChannelCommand::Data(vec![0; 1024])).await.unwrap();
        }
        assert_eq!(tx.capacity(), 0);

        // Nothing drains the queue, so the next write waits instead of buffering.
        let blocked = timeout(
            Duration::from_millis(50),
            tx.send(ChannelCommand::Data(vec![0; 1024])),
        )
        .await;
        assert!(blocked.is_err());

        assert!(matches!(rx.recv().await, Some(ChannelCommand::Data(_))));
        timeout(Duration::from_secs(1), tx.send(ChannelCommand::Eof))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_closes_when_bridge_is_gone() {
        let (tx, rx) = command_queue();
        drop(rx);
        assert!(tx.send(ChannelCommand::Shell).await.is_err());
    }
}

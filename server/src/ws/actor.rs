use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::auth::session::Identity;
use crate::state::AppState;
use crate::ws::hub::{ConnectionHandle, ConnectionId, HubHandle};
use crate::ws::protocol::{self, Frame};

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, drains the hub-fed outbound queue
/// - Ping task: keep-alive, gives up when a pong does not come back in time
/// - Reader (this task): decodes inbound frames and hands them to the hub
///
/// Whichever finishes first ends the connection. Cleanup always unregisters
/// the connection from the hub, so no registry entry outlives its socket.
pub async fn run_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let (ws_sender, ws_receiver) = socket.split();
    let (handle, outbound_rx) =
        ConnectionHandle::new(identity.clone(), state.realtime.outbound_queue_capacity);
    let connection_id = handle.id;

    // Control frames (pings) bypass the hub queue
    let (control_tx, control_rx) = mpsc::unbounded_channel::<Message>();
    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();

    state.hub.register(handle);

    tracing::info!(
        connection_id = %connection_id,
        user_id = identity.user_id,
        nickname = %identity.nickname,
        "WebSocket actor started"
    );

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, outbound_rx, control_rx));
    let mut ping_handle = tokio::spawn(ping_task(
        control_tx,
        pong_rx,
        Duration::from_secs(state.realtime.ping_interval_secs.max(1)),
        Duration::from_secs(state.realtime.pong_timeout_secs.max(1)),
    ));

    tokio::select! {
        _ = read_loop(ws_receiver, &state.hub, &identity, connection_id, pong_tx) => {}
        _ = &mut writer_handle => {
            tracing::debug!(connection_id = %connection_id, "Writer finished first");
        }
        ended = &mut ping_handle => match ended {
            Ok(KeepAliveEnd::PongTimeout) => {
                tracing::warn!(connection_id = %connection_id, "Pong timeout, closing connection");
            }
            Ok(KeepAliveEnd::WriterGone) | Err(_) => {
                tracing::debug!(connection_id = %connection_id, "Keep-alive stopped");
            }
        }
    }

    writer_handle.abort();
    ping_handle.abort();

    state.hub.unregister(connection_id);

    tracing::info!(
        connection_id = %connection_id,
        user_id = identity.user_id,
        "WebSocket actor stopped"
    );
}

/// Reader loop: returns on close, stream end or transport error.
async fn read_loop(
    mut ws_receiver: SplitStream<WebSocket>,
    hub: &HubHandle,
    identity: &Identity,
    connection_id: ConnectionId,
    pong_tx: mpsc::UnboundedSender<()>,
) {
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_message(text.as_str(), hub, identity);
                }
                Message::Binary(data) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        bytes = data.len(),
                        "Ignoring binary frame"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                // tungstenite answers pings on its own
                Message::Ping(_) => {}
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = %connection_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(connection_id = %connection_id, "WebSocket stream ended");
                break;
            }
        }
    }
}

/// Writer task: forwards hub frames and control messages to the sink.
///
/// Ends when the outbound queue closes (the hub dropped this connection) or
/// on the first failed write.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    mut control: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let msg = tokio::select! {
            Some(msg) = control.recv() => msg,
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
        };

        if let Err(e) = ws_sender.send(msg).await {
            tracing::debug!(error = %e, "WebSocket send failed");
            break;
        }
    }
}

/// Why the keep-alive task stopped.
#[derive(Debug, PartialEq, Eq)]
enum KeepAliveEnd {
    PongTimeout,
    /// The writer dropped its control queue
    WriterGone,
}

/// Sends a ping every `every` and returns once a pong is missed.
async fn ping_task(
    control: mpsc::UnboundedSender<Message>,
    mut pong_rx: mpsc::UnboundedReceiver<()>,
    every: Duration,
    pong_timeout: Duration,
) -> KeepAliveEnd {
    let mut ping_timer = interval(every);
    // Skip the first immediate tick
    ping_timer.tick().await;

    loop {
        ping_timer.tick().await;

        // Pongs that arrived unprompted do not count for this round
        while pong_rx.try_recv().is_ok() {}

        if control.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
            return KeepAliveEnd::WriterGone;
        }

        match timeout(pong_timeout, pong_rx.recv()).await {
            Ok(Some(())) => {}
            _ => return KeepAliveEnd::PongTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_missed_pong_is_reported_as_timeout() {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (_pong_tx, pong_rx) = mpsc::unbounded_channel();

        let ended = ping_task(control_tx, pong_rx, TICK, TICK).await;
        assert_eq!(ended, KeepAliveEnd::PongTimeout);
        assert!(matches!(control_rx.try_recv(), Ok(Message::Ping(_))));
    }

    #[tokio::test]
    async fn test_closed_control_queue_is_not_a_timeout() {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (_pong_tx, pong_rx) = mpsc::unbounded_channel();
        drop(control_rx);

        let ended = ping_task(control_tx, pong_rx, TICK, Duration::from_secs(60)).await;
        assert_eq!(ended, KeepAliveEnd::WriterGone);
    }

    #[tokio::test]
    async fn test_answered_pings_keep_running() {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();

        // Answer every ping, like a healthy client
        let responder = tokio::spawn(async move {
            while let Some(Message::Ping(_)) = control_rx.recv().await {
                if pong_tx.send(()).is_err() {
                    break;
                }
            }
        });

        let result = timeout(
            Duration::from_millis(100),
            ping_task(control_tx, pong_rx, TICK, Duration::from_secs(5)),
        )
        .await;
        assert!(result.is_err(), "keep-alive ended while pongs were arriving");
        responder.abort();
    }
}

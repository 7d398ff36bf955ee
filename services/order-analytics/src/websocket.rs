//! Live subscriber endpoint
//!
//! Each upgraded connection registers one subscriber and runs two halves:
//! a writer draining the subscriber's outbound queue into the socket (each
//! write bounded by the write timeout) and a reader that only watches for
//! the client going away. Whichever half ends first ends the connection,
//! and the subscriber is deregistered.
//!
//! Flow: connect → receive a `RealtimeStats` message every broadcast period.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::broadcast::{SubscriberId, SubscriberRegistry};

/// Why a writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The registry dropped the subscriber (lagging or shutdown)
    QueueClosed,
    SocketClosed,
    WriteTimedOut,
}

/// `GET /ws/realtime`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.broadcaster.registry();
    let write_timeout = state.write_timeout;
    ws.on_upgrade(move |socket| serve_subscriber(socket, registry, write_timeout))
}

async fn serve_subscriber(
    socket: WebSocket,
    registry: Arc<SubscriberRegistry>,
    write_timeout: Duration,
) {
    let (id, mut outbound) = registry.register();
    let (mut sink, mut stream) = socket.split();

    let writer = pump(id, &mut outbound, &mut sink, write_timeout);
    let reader = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                // Clients have nothing to say; pings are answered by axum.
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        exit = writer => debug!(subscriber_id = id, ?exit, "Writer finished"),
        _ = reader => debug!(subscriber_id = id, "Client went away"),
    }

    registry.remove(id);
    let _ = sink.close().await;
}

/// Forward queued payloads to `sink` until something gives out.
pub async fn pump<S>(
    id: SubscriberId,
    outbound: &mut mpsc::Receiver<Arc<str>>,
    sink: &mut S,
    write_timeout: Duration,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
{
    while let Some(payload) = outbound.recv().await {
        let frame = Message::Text(payload.to_string());
        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return WriterExit::SocketClosed,
            Err(_) => {
                warn!(
                    subscriber_id = id,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "Write to subscriber timed out"
                );
                return WriterExit::WriteTimedOut;
            }
        }
    }
    WriterExit::QueueClosed
}

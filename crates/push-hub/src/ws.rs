//! WebSocket adapter for the hub.
//!
//! `GET /ws/:entity_id` upgrades to a socket and registers it as the
//! entity's push connection. A writer task owns the sink; the read side only
//! watches for close, oversize frames and idleness, then detaches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::connection::PushConnection;
use crate::error::PushError;
use crate::hub::ConnectionHub;

#[derive(Clone)]
struct WsState {
    hub: ConnectionHub,
    max_message_size: usize,
    idle_timeout: Duration,
}

/// Router serving push sockets for `hub`.
pub fn router(hub: ConnectionHub, config: &HubConfig) -> Router {
    let state = WsState {
        hub,
        max_message_size: config.max_message_size,
        idle_timeout: config.idle_timeout,
    };
    Router::new()
        .route("/ws/:entity_id", get(upgrade))
        .with_state(state)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(entity_id): Path<Uuid>,
    State(state): State<WsState>,
) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, entity_id, state))
}

enum Outbound {
    Payload(String, oneshot::Sender<Result<(), PushError>>),
    Close(oneshot::Sender<()>),
}

/// Push connection writing to a socket through its writer task.
pub struct WsConnection {
    entity_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl PushConnection for WsConnection {
    fn entity_id(&self) -> Uuid {
        self.entity_id
    }

    async fn send(&self, payload: &Value) -> Result<(), PushError> {
        let text =
            serde_json::to_string(payload).map_err(|e| PushError::Encode(e.to_string()))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Payload(text, ack_tx))
            .map_err(|_| PushError::Closed)?;
        ack_rx.await.map_err(|_| PushError::Closed)?
    }

    async fn close(&self) -> Result<(), PushError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Outbound::Close(ack_tx)).is_err() {
            // Writer already gone.
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }
}

async fn write_loop<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Outbound>, entity_id: Uuid)
where
    S: futures::Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display + Send,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Payload(text, ack) => {
                let result = sink
                    .send(Message::Text(text))
                    .await
                    .map_err(|e| PushError::Io(e.to_string()));
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    debug!(entity_id = %entity_id, "Socket write failed, stopping writer");
                    break;
                }
            }
            Outbound::Close(ack) => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                let _ = ack.send(());
                break;
            }
        }
    }
}

async fn serve_socket(socket: WebSocket, entity_id: Uuid, state: WsState) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(sink, rx, entity_id));

    let conn: Arc<dyn PushConnection> = Arc::new(WsConnection { entity_id, tx });
    if let Err(e) = state.hub.add(Arc::clone(&conn)).await {
        warn!(entity_id = %entity_id, error = %e, "Rejected push socket");
        let _ = conn.close().await;
        return;
    }
    info!(entity_id = %entity_id, "Push socket connected");

    loop {
        let next = match tokio::time::timeout(state.idle_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!(entity_id = %entity_id, "Closing idle push socket");
                break;
            }
        };

        match next {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Text(text))) if text.len() > state.max_message_size => {
                warn!(entity_id = %entity_id, size = text.len(), "Inbound frame too large");
                break;
            }
            Some(Ok(Message::Binary(data))) if data.len() > state.max_message_size => {
                warn!(entity_id = %entity_id, size = data.len(), "Inbound frame too large");
                break;
            }
            // Push only; inbound frames just keep the socket alive.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(entity_id = %entity_id, error = %e, "Socket read error");
                break;
            }
        }
    }

    if state.hub.detach(entity_id, &conn) {
        info!(entity_id = %entity_id, "Push socket disconnected");
    }
    let _ = conn.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use serde_json::json;

    fn socket_pair(entity_id: Uuid) -> (WsConnection, fmpsc::UnboundedReceiver<Message>) {
        let (sink, frames) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, rx, entity_id));
        (WsConnection { entity_id, tx }, frames)
    }

    #[tokio::test]
    async fn test_payload_written_as_text_frame() {
        let (conn, mut frames) = socket_pair(Uuid::new_v4());

        conn.send(&json!({"ride_id": "r-1"})).await.unwrap();

        match frames.next().await {
            Some(Message::Text(text)) => {
                assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!({"ride_id": "r-1"}));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, mut frames) = socket_pair(Uuid::new_v4());

        conn.close().await.unwrap();
        assert!(matches!(frames.next().await, Some(Message::Close(None))));

        assert_eq!(conn.send(&json!(1)).await, Err(PushError::Closed));
        // Closing twice is harmless.
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_registers_with_hub_like_any_connection() {
        let hub = ConnectionHub::default();
        let rider = Uuid::new_v4();
        let _ = hub.send_to(rider, json!("buffered")).await;

        let (conn, mut frames) = socket_pair(rider);
        let outcome = hub.add(Arc::new(conn)).await.unwrap().await.unwrap();

        assert_eq!(outcome.delivered, 1);
        assert!(matches!(frames.next().await, Some(Message::Text(t)) if t == "\"buffered\""));
    }
}

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::{recipient_identity, verify_session_token};
use crate::metrics;
use crate::state::AppState;
use crate::websocket::messages::{ClientFrame, ServerFrame};
use crate::websocket::{
    ConnectionClosed, ConnectionHandle, RegisterOutcome, SendOutcome, SessionRegistry,
};

/// `GET /ws` — upgrade and hand the socket to the session loop.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Registry-facing side of one live socket. The sink is shared between the
/// session loop and fan-out pushes, so writes go through a mutex.
pub struct WsHandle {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsHandle {
    fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(sink),
        })
    }
}

#[async_trait::async_trait]
impl ConnectionHandle for WsHandle {
    async fn send_text(&self, text: String) -> Result<(), ConnectionClosed> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|_| ConnectionClosed)
    }

    async fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.sink.lock().await.send(Message::Close(Some(frame))).await;
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let handle = WsHandle::new(sink);
    let conn: Arc<dyn ConnectionHandle> = handle.clone();

    let registered = session_loop(stream, &conn, &state).await;

    if let Some(recipient_id) = registered {
        state.registry.deregister(recipient_id, &conn).await;
        tracing::info!(recipient = %recipient_id, "session ended");
    }
}

/// Drive one socket until it closes. Returns the identity this connection
/// registered as owner of, if any, so the caller can deregister it.
async fn session_loop(
    mut stream: SplitStream<WebSocket>,
    conn: &Arc<dyn ConnectionHandle>,
    state: &AppState,
) -> Option<Uuid> {
    let mut owner: Option<Uuid> = None;

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            // Pings are answered by axum; other frame types are ignored.
            Ok(_) => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring unparseable client frame");
                continue;
            }
        };

        match frame {
            ClientFrame::Register { token } => {
                let claims = match verify_session_token(&token, &state.config.jwt_secret) {
                    Ok(claims) => claims,
                    Err(_) => {
                        tracing::warn!("rejecting session with invalid token");
                        conn.close(close_code::POLICY, "invalid_token").await;
                        return owner;
                    }
                };
                let recipient_id = match recipient_identity(&claims) {
                    Ok(id) => id,
                    Err(_) => {
                        conn.close(close_code::POLICY, "invalid_token").await;
                        return owner;
                    }
                };

                match state.registry.register(recipient_id, conn.clone()).await {
                    RegisterOutcome::Registered => {
                        owner = Some(recipient_id);
                        tracing::info!(recipient = %recipient_id, "session registered");
                    }
                    RegisterOutcome::AlreadyConnected => {
                        tracing::debug!(recipient = %recipient_id, "duplicate registration");
                    }
                    RegisterOutcome::Rejected => {
                        conn.close(close_code::RESTART, "server_shutdown").await;
                        return owner;
                    }
                }
                // Replay runs on every registration attempt; the guarded
                // delivered flag keeps it idempotent under duplicates.
                replay_backlog(&state.registry, state.store.as_ref(), recipient_id).await;
            }
            ClientFrame::Logout => {
                conn.close(close_code::NORMAL, "logout").await;
                break;
            }
        }
    }

    owner
}

/// Push the recipient's undelivered backlog in creation order, oldest first.
/// Each record is fetched fresh, sent, then flipped to delivered; the first
/// failed send stops the replay so remaining records survive for the next
/// session.
pub async fn replay_backlog(
    registry: &SessionRegistry,
    store: &dyn crate::services::DeliveryStore,
    recipient_id: Uuid,
) {
    let mut replayed = 0u64;
    loop {
        let record = match store.next_undelivered(recipient_id).await {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(recipient = %recipient_id, error = %e, "backlog fetch failed");
                break;
            }
        };

        let frame = ServerFrame::from_record(&record).to_json();
        match registry.send(recipient_id, &frame).await {
            SendOutcome::Delivered => {}
            SendOutcome::NotConnected => break,
        }

        match store.mark_delivered(record.id).await {
            Ok(true) => {
                replayed += 1;
                metrics::BACKLOG_REPLAYED_TOTAL.inc();
            }
            // Someone else flipped it first; the next fetch moves past it.
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    recipient = %recipient_id,
                    record = %record.id,
                    error = %e,
                    "could not mark replayed record delivered"
                );
                break;
            }
        }
    }
    if replayed > 0 {
        tracing::info!(recipient = %recipient_id, replayed, "backlog replayed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::testing::InMemoryDeliveryStore;
    use crate::services::DeliveryStore;
    use crate::websocket::testing::FakeConnection;

    #[tokio::test]
    async fn test_replay_sends_backlog_oldest_first_and_marks_delivered() {
        let registry = SessionRegistry::new();
        let store = InMemoryDeliveryStore::new();
        let recipient = Uuid::new_v4();
        store.seed(recipient, "first");
        store.seed(recipient, "second");

        let conn = FakeConnection::new();
        registry.register(recipient, conn.clone()).await;

        replay_backlog(&registry, &store, recipient).await;

        let frames = conn.sent_frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("first"));
        assert!(frames[1].contains("second"));
        assert_eq!(store.delivered_count(recipient), 2);
    }

    #[tokio::test]
    async fn test_replay_stops_on_first_send_failure() {
        let registry = SessionRegistry::new();
        let store = InMemoryDeliveryStore::new();
        let recipient = Uuid::new_v4();
        store.seed(recipient, "first");
        store.seed(recipient, "second");
        store.seed(recipient, "third");

        registry
            .register(recipient, FakeConnection::failing_after(1))
            .await;

        replay_backlog(&registry, &store, recipient).await;

        assert_eq!(store.delivered_count(recipient), 1);
        let pending = store.next_undelivered(recipient).await.unwrap().unwrap();
        assert_eq!(pending.message_text, "second");
    }

    #[tokio::test]
    async fn test_replay_with_empty_backlog_sends_nothing() {
        let registry = SessionRegistry::new();
        let store = InMemoryDeliveryStore::new();
        let recipient = Uuid::new_v4();

        let conn = FakeConnection::new();
        registry.register(recipient, conn.clone()).await;

        replay_backlog(&registry, &store, recipient).await;
        assert!(conn.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_replay_skips_concurrently_delivered_records() {
        let registry = SessionRegistry::new();
        let store = InMemoryDeliveryStore::new();
        let recipient = Uuid::new_v4();
        let first = store.seed(recipient, "first");
        store.seed(recipient, "second");
        store.mark_delivered(first).await.unwrap();

        let conn = FakeConnection::new();
        registry.register(recipient, conn.clone()).await;

        replay_backlog(&registry, &store, recipient).await;

        let frames = conn.sent_frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("second"));
    }
}

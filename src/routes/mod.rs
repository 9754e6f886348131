use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::broker::event::{EventPayload, RoutingKey};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::state::AppState;
use crate::websocket::handlers::ws_handler;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/notify/publish", post(publish_handler))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn(metrics::track_http_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness plus a real broker round trip, so a wedged broker connection
/// shows up here and not only in consumer logs.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.broker.check().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "up"}))),
        Err(e) => {
            tracing::warn!(error = %e, "health check broker round trip failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "down", "error": e.to_string()})),
            )
        }
    }
}

/// `POST /notify/publish` — validate and append an event to its stream.
/// Producers normally publish directly; this is the HTTP ingress for the
/// ones that cannot.
async fn publish_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<impl IntoResponse> {
    let (routing_key, payload) = parse_publish_request(&body)?;
    state.broker.publish(routing_key, &payload).await?;
    Ok((
        StatusCode::OK,
        Json(json!({"status": "ok", "routing_key": routing_key.as_str()})),
    ))
}

fn parse_publish_request(body: &Value) -> AppResult<(RoutingKey, String)> {
    let key_str = body
        .get("routing_key")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("missing routing_key".into()))?;
    let routing_key = RoutingKey::parse(key_str)
        .ok_or_else(|| AppError::BadRequest(format!("unknown routing_key: {key_str}")))?;

    let message = body
        .get("message")
        .ok_or_else(|| AppError::BadRequest("missing message".into()))?;
    serde_json::from_value::<EventPayload>(message.clone())
        .map_err(|e| AppError::BadRequest(format!("invalid message: {e}")))?;

    Ok((routing_key, message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn valid_message() -> Value {
        json!({
            "timestamp": "2025-03-01T12:00:00Z",
            "notify_type": "add_submission",
            "community_id": Uuid::new_v4(),
            "sender_identity": Uuid::new_v4(),
            "message_text": "new submission",
        })
    }

    #[test]
    fn test_parse_publish_request_accepts_valid_body() {
        let body = json!({"routing_key": "add_submission", "message": valid_message()});
        let (key, payload) = parse_publish_request(&body).unwrap();
        assert_eq!(key, RoutingKey::AddSubmission);
        assert!(EventPayload::decode(&payload).is_ok());
    }

    #[test]
    fn test_parse_publish_request_rejects_missing_routing_key() {
        let body = json!({"message": valid_message()});
        assert!(matches!(
            parse_publish_request(&body),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_publish_request_rejects_unknown_routing_key() {
        let body = json!({"routing_key": "community_leave", "message": valid_message()});
        assert!(matches!(
            parse_publish_request(&body),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_publish_request_rejects_invalid_payload() {
        let body = json!({"routing_key": "add_submission", "message": {"notify_type": "x"}});
        assert!(matches!(
            parse_publish_request(&body),
            Err(AppError::BadRequest(_))
        ));
    }
}

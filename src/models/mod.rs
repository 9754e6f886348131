use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::event::EventPayload;

/// Persisted per-recipient delivery record.
///
/// `delivered` only ever transitions false -> true: the fan-out coordinator
/// flips it after a confirmed live push, the gateway flips it during backlog
/// replay. Records are never deleted by this service.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub message_text: String,
    pub notify_type: String,
    pub read: bool,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert form of a notification record, one per (event, recipient) pair.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient_id: Uuid,
    pub message_text: String,
    pub notify_type: String,
}

impl NewNotification {
    pub fn from_event(recipient_id: Uuid, event: &EventPayload) -> Self {
        Self {
            recipient_id,
            message_text: event.message_text.clone(),
            notify_type: event.notify_type.clone(),
        }
    }
}

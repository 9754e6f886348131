use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::event::EventPayload;
use crate::models::NotificationRecord;

/// Frames a client may send on the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Bind this socket to the identity in the token and trigger backlog
    /// replay.
    Register { token: String },
    /// Voluntary end of session; the server closes the socket.
    Logout,
}

/// Frames the gateway pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    Notification(NotificationData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationData {
    pub notify_msg: String,
    pub notify_timestamp: DateTime<Utc>,
    pub notify_type: String,
    pub notify_read: bool,
    pub notify_delivered: bool,
}

impl ServerFrame {
    /// Live-push form, straight from a consumed event.
    pub fn from_event(event: &EventPayload) -> Self {
        ServerFrame::Notification(NotificationData {
            notify_msg: event.message_text.clone(),
            notify_timestamp: event.timestamp,
            notify_read: event.notify_read,
            notify_delivered: event.notify_delivered,
            notify_type: event.notify_type.clone(),
        })
    }

    /// Replay form, from a persisted record.
    pub fn from_record(record: &NotificationRecord) -> Self {
        ServerFrame::Notification(NotificationData {
            notify_msg: record.message_text.clone(),
            notify_timestamp: record.created_at,
            notify_read: record.read,
            notify_delivered: record.delivered,
            notify_type: record.notify_type.clone(),
        })
    }

    pub fn to_json(&self) -> String {
        // Serialization of these enums cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

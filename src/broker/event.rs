use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::AppError;

/// Routing keys producers may publish on. Each key maps to one durable
/// stream; only the keys in [`RoutingKey::ENABLED`] get a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    AddSubmission,
    CommunityJoin,
    SubmissionUpvote,
    SubmissionMention,
}

impl RoutingKey {
    /// Keys a consumer is started for at process start.
    pub const ENABLED: &'static [RoutingKey] = &[RoutingKey::AddSubmission];

    pub fn as_str(self) -> &'static str {
        match self {
            RoutingKey::AddSubmission => "add_submission",
            RoutingKey::CommunityJoin => "community_join",
            RoutingKey::SubmissionUpvote => "submission_upvote",
            RoutingKey::SubmissionMention => "submission_mention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add_submission" => Some(RoutingKey::AddSubmission),
            "community_join" => Some(RoutingKey::CommunityJoin),
            "submission_upvote" => Some(RoutingKey::SubmissionUpvote),
            "submission_mention" => Some(RoutingKey::SubmissionMention),
            _ => None,
        }
    }

    /// Durable stream key backing this routing key.
    pub fn stream_key(self) -> String {
        format!("notify:stream:{}", self.as_str())
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form of a fan-out event. Produced once per domain action; never
/// stored itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub timestamp: DateTime<Utc>,
    pub notify_type: String,
    #[serde(default)]
    pub notify_read: bool,
    #[serde(default)]
    pub notify_delivered: bool,
    pub community_id: Uuid,
    pub sender_identity: Uuid,
    pub message_text: String,
}

impl EventPayload {
    pub fn decode(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|e| AppError::Decode(e.to_string()))
    }
}

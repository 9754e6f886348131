use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

use crate::broker::event::{EventPayload, RoutingKey};
use crate::error::AppResult;
use crate::metrics;
use crate::models::NewNotification;
use crate::services::{DeliveryStore, MembershipResolver};
use crate::websocket::{SendOutcome, SessionRegistry};
use crate::websocket::messages::ServerFrame;

/// How a single recipient's copy of an event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Persisted and pushed live.
    Delivered,
    /// Persisted; recipient offline, record waits for replay.
    Stored,
    /// Persistence failed; nothing recorded for this recipient.
    Skipped,
}

/// Fans one consumed event out to every community member except the sender.
///
/// Per recipient, persistence and live push run concurrently; the delivered
/// flag is flipped only after both have succeeded. One recipient's failure
/// never blocks the others.
pub struct FanoutCoordinator {
    store: Arc<dyn DeliveryStore>,
    membership: Arc<dyn MembershipResolver>,
    registry: SessionRegistry,
}

impl FanoutCoordinator {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        membership: Arc<dyn MembershipResolver>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            store,
            membership,
            registry,
        }
    }

    /// Process one raw event. `Err` means the event must be redelivered:
    /// the payload did not decode or membership could not be resolved.
    pub async fn handle(&self, routing_key: RoutingKey, raw: &str) -> AppResult<()> {
        let event = match EventPayload::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(%routing_key, error = %e, "undecodable event");
                metrics::EVENTS_CONSUMED_TOTAL
                    .with_label_values(&[routing_key.as_str(), "decode_error"])
                    .inc();
                return Err(e);
            }
        };

        let members = self.membership.members_of(event.community_id).await?;
        let recipients: Vec<Uuid> = members
            .into_iter()
            .filter(|id| *id != event.sender_identity)
            .collect();

        tracing::debug!(
            %routing_key,
            community = %event.community_id,
            recipients = recipients.len(),
            "fanning out event"
        );

        let outcomes = join_all(
            recipients
                .iter()
                .map(|recipient| self.deliver(*recipient, &event)),
        )
        .await;

        let delivered = outcomes
            .iter()
            .filter(|o| **o == DeliveryOutcome::Delivered)
            .count();
        tracing::info!(
            %routing_key,
            community = %event.community_id,
            recipients = outcomes.len(),
            delivered,
            "event fanned out"
        );
        metrics::EVENTS_CONSUMED_TOTAL
            .with_label_values(&[routing_key.as_str(), "processed"])
            .inc();
        Ok(())
    }

    /// One recipient's delivery: persist and push concurrently, then flip
    /// the delivered flag only when the push was confirmed and the record
    /// exists. An offline recipient leaves the record undelivered.
    async fn deliver(&self, recipient_id: Uuid, event: &EventPayload) -> DeliveryOutcome {
        let new = NewNotification::from_event(recipient_id, event);
        let frame = ServerFrame::from_event(event).to_json();

        let (inserted, pushed) = tokio::join!(
            self.store.insert(&new),
            self.registry.send(recipient_id, &frame),
        );

        let record_id = match inserted {
            Ok(id) => {
                metrics::NOTIFICATIONS_PERSISTED_TOTAL.inc();
                id
            }
            Err(e) => {
                tracing::error!(recipient = %recipient_id, error = %e, "failed to persist notification");
                return DeliveryOutcome::Skipped;
            }
        };

        match pushed {
            SendOutcome::Delivered => {
                metrics::LIVE_PUSH_TOTAL.with_label_values(&["delivered"]).inc();
                match self.store.mark_delivered(record_id).await {
                    Ok(_) => DeliveryOutcome::Delivered,
                    Err(e) => {
                        tracing::error!(
                            recipient = %recipient_id,
                            record = %record_id,
                            error = %e,
                            "pushed but could not mark delivered, record will be replayed"
                        );
                        DeliveryOutcome::Stored
                    }
                }
            }
            SendOutcome::NotConnected => {
                metrics::LIVE_PUSH_TOTAL.with_label_values(&["offline"]).inc();
                DeliveryOutcome::Stored
            }
        }
    }
}

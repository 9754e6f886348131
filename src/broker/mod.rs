pub mod event;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::services::FanoutCoordinator;
use event::RoutingKey;

/// Startup connection: bounded, a dead broker at boot is reported upward.
const CONNECT_MAX_ATTEMPTS: u32 = 5;
const CONNECT_RETRY: Duration = Duration::from_secs(3);

/// Consumer reconnection: unbounded exponential backoff with a ceiling, so a
/// long broker outage never kills the consumer.
const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// An entry sits in the pending list this long before another consumer may
/// claim it.
const CLAIM_MIN_IDLE_MS: usize = 10_000;
const READ_BLOCK_MS: usize = 5_000;

/// One consumed, not-yet-acknowledged stream entry.
#[derive(Debug, Clone)]
struct InFlight {
    id: String,
    payload: String,
}

/// Where a consumer gets its entries and confirms them. Backed by a consumer
/// group in production; the seam keeps the one-in-flight ack discipline
/// testable without a broker.
#[async_trait]
trait StreamSource: Send {
    /// Oldest abandoned pending entry, if one is claimable.
    async fn claim_abandoned(&mut self) -> AppResult<Option<InFlight>>;
    /// Next never-delivered entry; may block briefly.
    async fn read_next(&mut self) -> AppResult<Option<InFlight>>;
    async fn ack(&mut self, id: &str) -> AppResult<()>;
}

/// Durable event transport on Redis streams. One stream per routing key,
/// one consumer group shared by all replicas; unacknowledged entries stay
/// in the group's pending list until claimed and re-processed.
pub struct BrokerManager {
    client: redis::Client,
    consumer_group: String,
    consumer_name: String,
}

impl BrokerManager {
    pub fn new(redis_url: &str, consumer_group: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            consumer_group: consumer_group.to_string(),
            consumer_name: format!("notify-{}", uuid::Uuid::new_v4()),
        })
    }

    /// Startup handshake: connect (retrying a few times), verify the broker
    /// answers, and declare every enabled stream + group. Failure is
    /// returned, not fatal here; callers decide.
    pub async fn connect(&self) -> AppResult<()> {
        let mut last_err: Option<redis::RedisError> = None;
        for attempt in 1..=CONNECT_MAX_ATTEMPTS {
            match self.open_connection().await {
                Ok(mut conn) => {
                    self.declare_streams(&mut conn).await?;
                    tracing::info!(group = %self.consumer_group, "broker connected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, max = CONNECT_MAX_ATTEMPTS, error = %e, "broker connect failed");
                    last_err = Some(e);
                    if attempt < CONNECT_MAX_ATTEMPTS {
                        tokio::time::sleep(CONNECT_RETRY).await;
                    }
                }
            }
        }
        Err(AppError::StartServer(format!(
            "broker unreachable after {CONNECT_MAX_ATTEMPTS} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Single-attempt round trip for the health endpoint.
    pub async fn check(&self) -> AppResult<()> {
        let mut conn = self.open_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    /// Append an event to the routing key's stream.
    pub async fn publish(&self, routing_key: RoutingKey, payload: &str) -> AppResult<()> {
        let mut conn = self.open_connection().await?;
        let id: String = conn
            .xadd(routing_key.stream_key(), "*", &[("payload", payload)])
            .await?;
        tracing::debug!(%routing_key, entry = %id, "event published");
        Ok(())
    }

    async fn open_connection(&self) -> Result<ConnectionManager, redis::RedisError> {
        let mut conn = ConnectionManager::new(self.client.clone()).await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(conn)
    }

    async fn declare_streams(&self, conn: &mut ConnectionManager) -> AppResult<()> {
        for key in RoutingKey::ENABLED {
            let created: Result<String, redis::RedisError> = conn
                .xgroup_create_mkstream(key.stream_key(), &self.consumer_group, "$")
                .await;
            match created {
                Ok(_) => {
                    tracing::debug!(routing_key = %key, "consumer group created");
                }
                Err(e) if e.to_string().contains("BUSYGROUP") => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Consumer loop for one routing key. Runs until shutdown is signalled;
    /// any failed cycle waits out the backoff before the next attempt, so a
    /// broker that answers PING but lost its groups cannot hot-loop.
    pub async fn consume(
        self: Arc<Self>,
        routing_key: RoutingKey,
        coordinator: Arc<FanoutCoordinator>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = RECONNECT_BACKOFF_START;
        while !*shutdown.borrow() {
            match self
                .connect_and_consume(routing_key, &coordinator, &mut shutdown, &mut backoff)
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(%routing_key, error = %e, wait = ?backoff, "consumer lost broker");
                    if sleep_or_shutdown(backoff, &mut shutdown).await {
                        break;
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_CEILING);
                }
            }
        }
        tracing::info!(%routing_key, "consumer stopped");
    }

    /// Full reconnect, not just a ping: the stream and group are re-declared
    /// every time, so a broker that came back without persisted state is
    /// rebuilt before reads resume.
    async fn connect_and_consume(
        &self,
        routing_key: RoutingKey,
        coordinator: &FanoutCoordinator,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> AppResult<()> {
        let mut conn = self.open_connection().await?;
        self.declare_streams(&mut conn).await?;
        tracing::info!(%routing_key, consumer = %self.consumer_name, "consumer started");

        let mut source = GroupConsumer {
            conn: &mut conn,
            stream: routing_key.stream_key(),
            group: &self.consumer_group,
            consumer: &self.consumer_name,
        };
        self.consume_with(&mut source, routing_key, coordinator, shutdown, backoff)
            .await
    }

    /// One entry at a time: abandoned pending entries first, then new ones.
    /// An entry is acknowledged only after the coordinator accepts it; a
    /// rejected entry stays pending and comes back through the claim path.
    /// Backoff resets only once a read cycle completes, never on a bare
    /// reconnect.
    async fn consume_with<S: StreamSource>(
        &self,
        source: &mut S,
        routing_key: RoutingKey,
        coordinator: &FanoutCoordinator,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> AppResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let entry = match source.claim_abandoned().await? {
                Some(entry) => Some(entry),
                None => {
                    tokio::select! {
                        read = source.read_next() => read?,
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
            };
            *backoff = RECONNECT_BACKOFF_START;
            let Some(entry) = entry else {
                continue;
            };

            match coordinator.handle(routing_key, &entry.payload).await {
                Ok(()) => source.ack(&entry.id).await?,
                Err(e) => {
                    // Left unacknowledged on purpose; the pending list is
                    // the redelivery queue.
                    tracing::warn!(%routing_key, entry = %entry.id, error = %e, "event left pending for redelivery");
                    metrics::EVENTS_CONSUMED_TOTAL
                        .with_label_values(&[routing_key.as_str(), "requeued"])
                        .inc();
                }
            }
        }
    }
}

/// Production [`StreamSource`]: one consumer group member on one stream.
struct GroupConsumer<'a> {
    conn: &'a mut ConnectionManager,
    stream: String,
    group: &'a str,
    consumer: &'a str,
}

#[async_trait]
impl StreamSource for GroupConsumer<'_> {
    /// Take over the oldest pending entry that has sat idle long enough,
    /// from any consumer in the group (including a previous life of this
    /// one).
    async fn claim_abandoned(&mut self) -> AppResult<Option<InFlight>> {
        let pending: StreamPendingCountReply = self
            .conn
            .xpending_count(&self.stream, self.group, "-", "+", 1)
            .await?;
        let Some(candidate) = pending.ids.first() else {
            return Ok(None);
        };
        if candidate.last_delivered_ms < CLAIM_MIN_IDLE_MS {
            return Ok(None);
        }

        let claimed: StreamClaimReply = self
            .conn
            .xclaim(
                &self.stream,
                self.group,
                self.consumer,
                CLAIM_MIN_IDLE_MS,
                &[&candidate.id],
            )
            .await?;
        let Some(entry) = claimed.ids.into_iter().next() else {
            // Another consumer won the claim race.
            return Ok(None);
        };

        tracing::debug!(
            entry = %entry.id,
            redeliveries = candidate.times_delivered,
            "claimed abandoned entry"
        );
        extract(entry).map(Some)
    }

    /// Block for the next never-delivered entry.
    async fn read_next(&mut self) -> AppResult<Option<InFlight>> {
        let opts = StreamReadOptions::default()
            .group(self.group, self.consumer)
            .count(1)
            .block(READ_BLOCK_MS);
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await?;

        let entry = reply
            .keys
            .into_iter()
            .next()
            .and_then(|key| key.ids.into_iter().next());
        match entry {
            Some(entry) => extract(entry).map(Some),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, id: &str) -> AppResult<()> {
        let _: i64 = self.conn.xack(&self.stream, self.group, &[id]).await?;
        Ok(())
    }
}

fn extract(entry: StreamId) -> AppResult<InFlight> {
    let value = entry
        .map
        .get("payload")
        .ok_or_else(|| AppError::Decode("stream entry missing payload field".into()))?;
    let payload: String = redis::from_redis_value(value)
        .map_err(|e| AppError::Decode(format!("stream payload not a string: {e}")))?;
    Ok(InFlight {
        id: entry.id,
        payload,
    })
}

/// Returns true when shutdown was signalled during the wait.
async fn sleep_or_shutdown(wait: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::membership::testing::FakeMembership;
    use crate::services::store::testing::InMemoryDeliveryStore;
    use crate::websocket::SessionRegistry;
    use std::collections::VecDeque;
    use uuid::Uuid;

    #[test]
    fn test_reconnect_backoff_doubles_to_ceiling() {
        let mut backoff = RECONNECT_BACKOFF_START;
        let mut steps = vec![backoff];
        for _ in 0..8 {
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CEILING);
            steps.push(backoff);
        }

        assert_eq!(steps[0], Duration::from_millis(500));
        assert_eq!(steps[1], Duration::from_secs(1));
        assert_eq!(steps[6], Duration::from_secs(30));
        assert!(steps.iter().all(|s| *s <= RECONNECT_BACKOFF_CEILING));
    }

    #[test]
    fn test_consumer_names_are_unique_per_instance() {
        let a = BrokerManager::new("redis://127.0.0.1:6379", "g").unwrap();
        let b = BrokerManager::new("redis://127.0.0.1:6379", "g").unwrap();
        assert_ne!(a.consumer_name, b.consumer_name);
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown_observes_signal() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }

    /// In-memory source mirroring the pending-list semantics: entries read
    /// or claimed stay unacked until `ack`, and unacked entries come back
    /// through `claim_abandoned`. Signals shutdown once drained.
    struct FakeSource {
        fresh: VecDeque<InFlight>,
        unacked: Vec<InFlight>,
        log: Vec<String>,
        drained: watch::Sender<bool>,
    }

    impl FakeSource {
        fn new(payloads: Vec<String>, drained: watch::Sender<bool>) -> Self {
            let fresh = payloads
                .into_iter()
                .enumerate()
                .map(|(i, payload)| InFlight {
                    id: format!("{}-0", i + 1),
                    payload,
                })
                .collect();
            Self {
                fresh,
                unacked: Vec::new(),
                log: Vec::new(),
                drained,
            }
        }
    }

    #[async_trait]
    impl StreamSource for FakeSource {
        async fn claim_abandoned(&mut self) -> AppResult<Option<InFlight>> {
            match self.unacked.first().cloned() {
                Some(entry) => {
                    self.log.push(format!("claim:{}", entry.id));
                    Ok(Some(entry))
                }
                None => Ok(None),
            }
        }

        async fn read_next(&mut self) -> AppResult<Option<InFlight>> {
            match self.fresh.pop_front() {
                Some(entry) => {
                    self.log.push(format!("read:{}", entry.id));
                    self.unacked.push(entry.clone());
                    Ok(Some(entry))
                }
                None => {
                    let _ = self.drained.send(true);
                    Ok(None)
                }
            }
        }

        async fn ack(&mut self, id: &str) -> AppResult<()> {
            self.log.push(format!("ack:{id}"));
            self.unacked.retain(|e| e.id != id);
            Ok(())
        }
    }

    fn event_json() -> String {
        serde_json::json!({
            "timestamp": "2025-03-01T12:00:00Z",
            "notify_type": "add_submission",
            "community_id": Uuid::new_v4(),
            "sender_identity": Uuid::new_v4(),
            "message_text": "new submission",
        })
        .to_string()
    }

    fn test_broker() -> BrokerManager {
        BrokerManager::new("redis://127.0.0.1:6379", "test-group").unwrap()
    }

    fn coordinator_with(membership: Arc<FakeMembership>) -> FanoutCoordinator {
        FanoutCoordinator::new(
            Arc::new(InMemoryDeliveryStore::new()),
            membership,
            SessionRegistry::new(),
        )
    }

    #[tokio::test]
    async fn test_second_entry_not_read_before_first_ack() {
        let (tx, mut rx) = watch::channel(false);
        let mut source = FakeSource::new(vec![event_json(), event_json()], tx);
        let coordinator = coordinator_with(Arc::new(FakeMembership::new()));
        let broker = test_broker();
        let mut backoff = RECONNECT_BACKOFF_CEILING;

        broker
            .consume_with(
                &mut source,
                RoutingKey::AddSubmission,
                &coordinator,
                &mut rx,
                &mut backoff,
            )
            .await
            .unwrap();

        let ack_first = source.log.iter().position(|l| l == "ack:1-0").unwrap();
        let read_second = source.log.iter().position(|l| l == "read:2-0").unwrap();
        assert!(ack_first < read_second);
        assert!(source.unacked.is_empty());
        // A completed read cycle resets the reconnect backoff.
        assert_eq!(backoff, RECONNECT_BACKOFF_START);
    }

    #[tokio::test]
    async fn test_rejected_entry_is_redelivered_then_acked() {
        let (tx, mut rx) = watch::channel(false);
        let mut source = FakeSource::new(vec![event_json()], tx);
        let membership = Arc::new(FakeMembership::new());
        membership.fail_next(1);
        let coordinator = coordinator_with(membership);
        let broker = test_broker();
        let mut backoff = RECONNECT_BACKOFF_START;

        broker
            .consume_with(
                &mut source,
                RoutingKey::AddSubmission,
                &coordinator,
                &mut rx,
                &mut backoff,
            )
            .await
            .unwrap();

        assert_eq!(source.log, vec!["read:1-0", "claim:1-0", "ack:1-0"]);
        assert!(source.unacked.is_empty());
    }
}

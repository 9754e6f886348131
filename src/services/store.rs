use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{NewNotification, NotificationRecord};

/// Persistence seam for notification records.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert a record with `delivered = false`, returning its id.
    async fn insert(&self, new: &NewNotification) -> AppResult<Uuid>;

    /// Flip `delivered` to true. Returns false when the record was already
    /// delivered (or does not exist), so the flag stays monotonic under
    /// concurrent replay and fan-out.
    async fn mark_delivered(&self, id: Uuid) -> AppResult<bool>;

    /// Oldest undelivered record for a recipient, if any. Fetched one at a
    /// time so replay always sees fresh delivery state.
    async fn next_undelivered(&self, recipient_id: Uuid) -> AppResult<Option<NotificationRecord>>;
}

pub struct PostgresDeliveryStore {
    pool: PgPool,
}

impl PostgresDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    async fn insert(&self, new: &NewNotification) -> AppResult<Uuid> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO notifications (recipient_id, message_text, notify_type, "read", delivered)
            VALUES ($1, $2, $3, FALSE, FALSE)
            RETURNING id
            "#,
        )
        .bind(new.recipient_id)
        .bind(&new.message_text)
        .bind(&new.notify_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn mark_delivered(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET delivered = TRUE WHERE id = $1 AND delivered = FALSE",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_undelivered(&self, recipient_id: Uuid) -> AppResult<Option<NotificationRecord>> {
        let record = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT id, recipient_id, message_text, notify_type, "read", delivered, created_at
            FROM notifications
            WHERE recipient_id = $1 AND delivered = FALSE
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

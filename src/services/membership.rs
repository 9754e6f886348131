use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;

/// Resolves which identities a community-scoped event fans out to.
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    async fn members_of(&self, community_id: Uuid) -> AppResult<Vec<Uuid>>;
}

pub struct PostgresMembership {
    pool: PgPool,
}

impl PostgresMembership {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipResolver for PostgresMembership {
    async fn members_of(&self, community_id: Uuid) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM community_members WHERE community_id = $1 ORDER BY user_id",
        )
        .bind(community_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeMembership {
        members: Mutex<HashMap<Uuid, Vec<Uuid>>>,
        failing: Mutex<bool>,
        fail_remaining: Mutex<u32>,
    }

    impl FakeMembership {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_members(community_id: Uuid, members: Vec<Uuid>) -> Self {
            let fake = Self::default();
            fake.members.lock().unwrap().insert(community_id, members);
            fake
        }

        pub fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }

        /// Fail the next `n` lookups, then succeed.
        pub fn fail_next(&self, n: u32) {
            *self.fail_remaining.lock().unwrap() = n;
        }
    }

    #[async_trait]
    impl MembershipResolver for FakeMembership {
        async fn members_of(&self, community_id: Uuid) -> AppResult<Vec<Uuid>> {
            if *self.failing.lock().unwrap() {
                return Err(AppError::Internal("membership lookup failed".into()));
            }
            {
                let mut remaining = self.fail_remaining.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AppError::Internal("membership lookup failed".into()));
                }
            }
            Ok(self
                .members
                .lock()
                .unwrap()
                .get(&community_id)
                .cloned()
                .unwrap_or_default())
        }
    }
}

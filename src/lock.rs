//! Distributed refresh lock
//!
//! A lease row keyed by the connection natural key guarantees at most one
//! refresh in flight across all instances. Leases carry a TTL so a crashed
//! holder cannot wedge a connection: an expired lease is stolen by the next
//! acquirer. The acquire timeout is configured above the TTL so a waiter
//! outlives at least one full lease.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::AuthError;
use crate::models::refresh_lock;

const ACQUIRE_POLL_INTERVAL: StdDuration = StdDuration::from_millis(250);

/// Proof of lock ownership, passed back on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub lock_key: String,
    pub owner: Uuid,
}

/// Lease key for a connection's refresh lock.
pub fn lock_key(environment_id: &Uuid, provider_config_key: &str, connection_id: &str) -> String {
    format!("{}:{}:{}", environment_id, provider_config_key, connection_id)
}

#[async_trait]
pub trait RefreshLock: Send + Sync {
    /// Acquire the lease for `key`, waiting up to `timeout`. Expired leases
    /// held by other owners are stolen. Failure is [`AuthError::LockTimeout`].
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<LockLease, AuthError>;

    /// Release the lease. Releasing a lease that expired and was stolen is a
    /// no-op; the current holder keeps it.
    async fn release(&self, lease: &LockLease) -> Result<(), AuthError>;
}

/// Database-backed lease, visible to every instance.
pub struct DbRefreshLock {
    db: Arc<DatabaseConnection>,
}

impl DbRefreshLock {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn try_acquire(
        &self,
        key: &str,
        owner: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let existing = refresh_lock::Entity::find_by_id(key)
            .one(self.db.as_ref())
            .await?;

        match existing {
            None => {
                let insert = refresh_lock::ActiveModel {
                    lock_key: Set(key.to_string()),
                    owner: Set(owner),
                    expires_at: Set(expires_at),
                }
                .insert(self.db.as_ref())
                .await;

                // A concurrent insert winning the race shows up as a primary
                // key violation; treat it as not acquired.
                match insert {
                    Ok(_) => Ok(true),
                    Err(_) => Ok(false),
                }
            }
            Some(row) if row.expires_at <= Utc::now() => {
                // Steal: the guarded update only succeeds against the exact
                // expired lease we observed.
                let result = refresh_lock::Entity::update_many()
                    .col_expr(refresh_lock::Column::Owner, Expr::value(owner))
                    .col_expr(refresh_lock::Column::ExpiresAt, Expr::value(expires_at))
                    .filter(refresh_lock::Column::LockKey.eq(key))
                    .filter(refresh_lock::Column::Owner.eq(row.owner))
                    .filter(refresh_lock::Column::ExpiresAt.eq(row.expires_at))
                    .exec(self.db.as_ref())
                    .await?;
                Ok(result.rows_affected == 1)
            }
            Some(_) => Ok(false),
        }
    }
}

#[async_trait]
impl RefreshLock for DbRefreshLock {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<LockLease, AuthError> {
        let owner = Uuid::new_v4();
        let deadline = Utc::now() + timeout;

        loop {
            let expires_at = Utc::now() + ttl;
            if self.try_acquire(key, owner, expires_at).await? {
                return Ok(LockLease {
                    lock_key: key.to_string(),
                    owner,
                });
            }

            if Utc::now() >= deadline {
                metrics::counter!("keybridge_refresh_lock_timeouts_total").increment(1);
                return Err(AuthError::LockTimeout(key.to_string()));
            }

            sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), AuthError> {
        refresh_lock::Entity::delete_many()
            .filter(refresh_lock::Column::LockKey.eq(&lease.lock_key))
            .filter(refresh_lock::Column::Owner.eq(lease.owner))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }
}

/// Process-local lease for single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryRefreshLock {
    leases: tokio::sync::Mutex<BTreeMap<String, (Uuid, DateTime<Utc>)>>,
}

impl MemoryRefreshLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefreshLock for MemoryRefreshLock {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<LockLease, AuthError> {
        let owner = Uuid::new_v4();
        let deadline = Utc::now() + timeout;

        loop {
            {
                let mut leases = self.leases.lock().await;
                let now = Utc::now();
                let free = match leases.get(key) {
                    None => true,
                    Some((_, expires_at)) => *expires_at <= now,
                };
                if free {
                    leases.insert(key.to_string(), (owner, now + ttl));
                    return Ok(LockLease {
                        lock_key: key.to_string(),
                        owner,
                    });
                }
            }

            if Utc::now() >= deadline {
                return Err(AuthError::LockTimeout(key.to_string()));
            }

            sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), AuthError> {
        let mut leases = self.leases.lock().await;
        if let Some((owner, _)) = leases.get(&lease.lock_key)
            && *owner == lease.owner
        {
            leases.remove(&lease.lock_key);
        }
        Ok(())
    }
}

//! Session records in one collection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::SessionId;
use crate::config::TimestampMode;
use crate::db::{Cluster, CollectionHandle, Pool, SessionRecord};
use crate::error::{Result, SessionError};

/// Load, upsert and delete records, each through its own checked-out handle.
pub struct RecordStore<C: Cluster> {
    pool: Pool<C>,
    collection: String,
    mode: TimestampMode,
}

impl<C: Cluster> Clone for RecordStore<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            collection: self.collection.clone(),
            mode: self.mode,
        }
    }
}

impl<C: Cluster> RecordStore<C> {
    pub fn new(pool: Pool<C>, collection: impl Into<String>, mode: TimestampMode) -> Self {
        Self {
            pool,
            collection: collection.into(),
            mode,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn timestamp_mode(&self) -> TimestampMode {
        self.mode
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Fetch a record. With `touch`, the timestamp is set to now in the same
    /// round trip and the updated record is returned.
    pub async fn load(&self, id: &SessionId, touch: bool) -> Result<SessionRecord> {
        let id = *id;
        let field = self.mode.field();
        let found = self
            .pool
            .with_collection(&self.collection, move |handle| async move {
                if touch {
                    handle.find_and_touch(&id, field, Utc::now()).await
                } else {
                    handle.find(&id, field).await
                }
            })
            .await?;

        match found {
            Some(record) => Ok(record),
            None => {
                debug!("Session record {} not found in {}", id, self.collection);
                Err(SessionError::NotFound)
            }
        }
    }

    /// Insert or replace the record for `id`, stamped with `pinned` or now.
    pub async fn upsert(&self, id: &SessionId, data: String, pinned: Option<DateTime<Utc>>) -> Result<()> {
        let timestamp = pinned.unwrap_or_else(Utc::now);
        let record = SessionRecord {
            id: *id,
            data,
            timestamp: Some(timestamp),
        };
        let field = self.mode.field();
        self.pool
            .with_collection(&self.collection, move |handle| async move {
                handle.upsert(&record, field).await
            })
            .await
    }

    /// Remove the record for `id`. Removing a missing record succeeds.
    pub async fn delete(&self, id: &SessionId) -> Result<()> {
        let id = *id;
        self.pool
            .with_collection(&self.collection, move |handle| async move {
                handle.remove(&id).await
            })
            .await
    }

    /// Declare the TTL index on the timestamp field. Returns whether an index
    /// was declared.
    pub async fn ensure_ttl(&self, max_age: i64) -> Result<bool> {
        if max_age <= 0 {
            warn!(
                "Not declaring TTL index on {}.{}: max age {} would expire records immediately",
                self.collection,
                self.mode.field(),
                max_age
            );
            return Ok(false);
        }

        let field = self.mode.field();
        let expire_after = Duration::from_secs(max_age.unsigned_abs());
        self.pool
            .with_collection(&self.collection, move |handle| async move {
                handle.ensure_ttl_index(field, expire_after).await
            })
            .await?;
        info!(
            "TTL index on {}.{} expires records after {}s",
            self.collection, field, max_age
        );
        Ok(true)
    }
}

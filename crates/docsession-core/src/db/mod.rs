//! Connection resilience layer.
//!
//! The caller owns one long-lived [`Cluster`]. Every store operation checks
//! out a fresh [`CollectionHandle`] scoped to the session collection, uses it
//! for exactly one unit of work and drops it. A connection that fails during
//! that work dies with the handle; the next checkout starts from the cluster
//! again and reconnects.

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(feature = "mongodb-backend")]
pub mod mongo;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DatabaseError, SessionError};
use crate::session::SessionId;

/// At-rest form of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    /// Codec output; never cleartext.
    pub data: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Process-wide handle to the backing database.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    type Handle: CollectionHandle;

    /// Derive an independent handle scoped to `collection`.
    async fn checkout(&self, collection: &str) -> Result<Self::Handle, DatabaseError>;
}

/// One checked-out collection handle. Released on drop.
#[async_trait]
pub trait CollectionHandle: Send + Sync + 'static {
    async fn find(&self, id: &SessionId, field: &str) -> Result<Option<SessionRecord>, SessionError>;

    /// Set `field` to `now` and return the updated record, atomically.
    async fn find_and_touch(
        &self,
        id: &SessionId,
        field: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, SessionError>;

    /// Insert or replace the record by id.
    async fn upsert(&self, record: &SessionRecord, field: &str) -> Result<(), SessionError>;

    /// Remove by id; a missing record is not an error.
    async fn remove(&self, id: &SessionId) -> Result<(), SessionError>;

    /// Declare a sparse background TTL index on `field`.
    async fn ensure_ttl_index(&self, field: &str, expire_after: Duration) -> Result<(), SessionError>;
}

/// Checkout/checkin wrapper around a shared cluster.
pub struct Pool<C: Cluster> {
    cluster: Arc<C>,
}

impl<C: Cluster> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
        }
    }
}

impl<C: Cluster> Pool<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &Arc<C> {
        &self.cluster
    }

    /// Run one unit of work against a freshly derived handle.
    ///
    /// The handle is moved into `f`; it is dropped when the returned future
    /// completes, fails or unwinds, before this call returns.
    pub async fn with_collection<F, Fut, T>(&self, collection: &str, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(C::Handle) -> Fut + Send,
        Fut: Future<Output = Result<T, SessionError>> + Send,
        T: Send,
    {
        let handle = self.cluster.checkout(collection).await?;
        f(handle).await
    }
}

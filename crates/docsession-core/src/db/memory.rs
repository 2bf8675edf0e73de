//! In-process cluster for tests, demos and single-node deployments.
//!
//! Behaves like a document database with per-document atomic updates, sparse
//! TTL indexes (swept on demand) and connections that can be cycled. Every
//! checkout is counted so callers can assert whether an operation reached
//! the database at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::{Cluster, CollectionHandle, SessionRecord};
use crate::error::{DatabaseError, SessionError};
use crate::session::SessionId;

const DATA_FIELD: &str = "data";

/// A stored field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Text(String),
    Time(DateTime<Utc>),
}

pub type Document = HashMap<String, Field>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TtlIndex {
    expire_after: Duration,
}

#[derive(Default)]
struct Inner {
    documents: DashMap<(String, SessionId), Document>,
    /// (collection, field) -> index
    ttl_indexes: DashMap<(String, String), TtlIndex>,
    generation: AtomicU64,
    fail_next: AtomicUsize,
    checkouts: AtomicUsize,
    outstanding: AtomicUsize,
    operations: AtomicUsize,
    index_declarations: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every live connection. Handles checked out before this call fail
    /// on their next operation; later checkouts work normally.
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        debug!("Memory cluster connections reset");
    }

    /// Make the next `n` checkouts fail as if the cluster were unreachable.
    pub fn fail_next_checkouts(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total handles ever checked out.
    pub fn checkouts(&self) -> usize {
        self.inner.checkouts.load(Ordering::SeqCst)
    }

    /// Handles currently checked out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Operations that reached a document.
    pub fn operations(&self) -> usize {
        self.inner.operations.load(Ordering::SeqCst)
    }

    /// Number of TTL index declarations received.
    pub fn index_declarations(&self) -> usize {
        self.inner.index_declarations.load(Ordering::SeqCst)
    }

    /// Expire-after of the TTL index on `collection.field`, if declared.
    pub fn ttl_index(&self, collection: &str, field: &str) -> Option<Duration> {
        self.inner
            .ttl_indexes
            .get(&(collection.to_string(), field.to_string()))
            .map(|idx| idx.expire_after)
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.inner
            .documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .count()
    }

    pub fn get_document(&self, collection: &str, id: &SessionId) -> Option<Document> {
        self.inner
            .documents
            .get(&(collection.to_string(), *id))
            .map(|doc| doc.clone())
    }

    /// Store a document verbatim, bypassing the session layer.
    pub fn insert_document(&self, collection: &str, id: SessionId, document: Document) {
        self.inner
            .documents
            .insert((collection.to_string(), id), document);
    }

    /// Run the TTL monitor as of `now`. Only documents carrying a datetime in
    /// an indexed field take part. Returns the number of documents removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let indexes: Vec<((String, String), TtlIndex)> = self
            .inner
            .ttl_indexes
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let before = self.inner.documents.len();
        self.inner.documents.retain(|(collection, _), doc| {
            !indexes.iter().any(|((idx_collection, field), idx)| {
                if idx_collection != collection {
                    return false;
                }
                match doc.get(field) {
                    Some(Field::Time(ts)) => chrono::Duration::from_std(idx.expire_after)
                        .map(|ttl| *ts + ttl <= now)
                        .unwrap_or(false),
                    _ => false,
                }
            })
        });
        let removed = before - self.inner.documents.len();
        if removed > 0 {
            debug!("Memory cluster TTL sweep removed {} documents", removed);
        }
        removed
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    type Handle = MemoryCollection;

    async fn checkout(&self, collection: &str) -> Result<MemoryCollection, DatabaseError> {
        let failed = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DatabaseError::Connection("no reachable servers".into()));
        }

        self.inner.checkouts.fetch_add(1, Ordering::SeqCst);
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryCollection {
            inner: Arc::clone(&self.inner),
            collection: collection.to_string(),
            generation: self.inner.generation.load(Ordering::SeqCst),
        })
    }
}

pub struct MemoryCollection {
    inner: Arc<Inner>,
    collection: String,
    generation: u64,
}

impl Drop for MemoryCollection {
    fn drop(&mut self) {
        self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryCollection {
    fn connected(&self) -> Result<(), SessionError> {
        if self.inner.generation.load(Ordering::SeqCst) != self.generation {
            return Err(DatabaseError::Connection("connection reset by peer".into()).into());
        }
        self.inner.operations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn key(&self, id: &SessionId) -> (String, SessionId) {
        (self.collection.clone(), *id)
    }
}

fn to_record(id: &SessionId, doc: &Document, field: &str) -> Result<SessionRecord, SessionError> {
    let data = match doc.get(DATA_FIELD) {
        Some(Field::Text(data)) => data.clone(),
        _ => {
            return Err(DatabaseError::Malformed(format!("{id}: missing {DATA_FIELD}")).into());
        }
    };
    let timestamp = match doc.get(field) {
        None => None,
        Some(Field::Time(ts)) => Some(*ts),
        Some(Field::Text(_)) => {
            return Err(SessionError::InvalidTimestamp(format!(
                "{id}: {field} is not a datetime"
            )));
        }
    };
    Ok(SessionRecord {
        id: *id,
        data,
        timestamp,
    })
}

#[async_trait]
impl CollectionHandle for MemoryCollection {
    async fn find(&self, id: &SessionId, field: &str) -> Result<Option<SessionRecord>, SessionError> {
        self.connected()?;
        match self.inner.documents.get(&self.key(id)) {
            Some(doc) => to_record(id, &doc, field).map(Some),
            None => Ok(None),
        }
    }

    async fn find_and_touch(
        &self,
        id: &SessionId,
        field: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, SessionError> {
        self.connected()?;
        match self.inner.documents.get_mut(&self.key(id)) {
            Some(mut doc) => {
                let touched = match doc.get(field) {
                    Some(Field::Time(prev)) if *prev >= now => {
                        *prev + chrono::Duration::milliseconds(1)
                    }
                    _ => now,
                };
                doc.insert(field.to_string(), Field::Time(touched));
                to_record(id, &doc, field).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &SessionRecord, field: &str) -> Result<(), SessionError> {
        self.connected()?;
        let mut doc = Document::new();
        doc.insert(DATA_FIELD.to_string(), Field::Text(record.data.clone()));
        if let Some(ts) = record.timestamp {
            doc.insert(field.to_string(), Field::Time(ts));
        }
        self.inner.documents.insert(self.key(&record.id), doc);
        Ok(())
    }

    async fn remove(&self, id: &SessionId) -> Result<(), SessionError> {
        self.connected()?;
        self.inner.documents.remove(&self.key(id));
        Ok(())
    }

    async fn ensure_ttl_index(&self, field: &str, expire_after: Duration) -> Result<(), SessionError> {
        self.connected()?;
        self.inner.index_declarations.fetch_add(1, Ordering::SeqCst);
        self.inner.ttl_indexes.insert(
            (self.collection.clone(), field.to_string()),
            TtlIndex { expire_after },
        );
        Ok(())
    }
}

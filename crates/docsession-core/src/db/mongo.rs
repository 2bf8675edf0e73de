//! MongoDB cluster.
//!
//! The driver client is the long-lived cluster handle. Each checkout clones it
//! and scopes the clone to the session collection, so a server selection or
//! socket failure is confined to the operation that hit it.

use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};
use tracing::info;

use super::{Cluster, CollectionHandle, SessionRecord};
use crate::error::{DatabaseError, SessionError};
use crate::session::SessionId;

#[derive(Clone)]
pub struct MongoCluster {
    client: Client,
    database: Option<String>,
}

impl MongoCluster {
    /// Wrap an existing client. `database` overrides the default database
    /// of the connection string.
    pub fn new(client: Client, database: Option<String>) -> Self {
        Self { client, database }
    }

    pub async fn connect(uri: &str, database: Option<String>) -> Result<Self, DatabaseError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(DatabaseError::backend)?;
        info!("Connected MongoDB client");
        Ok(Self::new(client, database))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Cluster for MongoCluster {
    type Handle = MongoCollection;

    async fn checkout(&self, collection: &str) -> Result<MongoCollection, DatabaseError> {
        let client = self.client.clone();
        let db = match &self.database {
            Some(name) => client.database(name),
            None => client.default_database().ok_or_else(|| {
                DatabaseError::Connection("connection string names no default database".into())
            })?,
        };
        Ok(MongoCollection {
            collection: db.collection::<Document>(collection),
        })
    }
}

pub struct MongoCollection {
    collection: Collection<Document>,
}

fn object_id(id: &SessionId) -> ObjectId {
    ObjectId::from_bytes(id.bytes())
}

fn to_record(id: &SessionId, doc: &Document, field: &str) -> Result<SessionRecord, SessionError> {
    let data = doc
        .get_str("data")
        .map_err(|e| DatabaseError::Malformed(format!("{id}: data: {e}")))?
        .to_string();
    let timestamp = match doc.get(field) {
        None | Some(Bson::Null) => None,
        Some(Bson::DateTime(ts)) => Some(ts.to_chrono()),
        Some(other) => {
            return Err(SessionError::InvalidTimestamp(format!(
                "{id}: {field} has type {:?}",
                other.element_type()
            )));
        }
    };
    Ok(SessionRecord {
        id: *id,
        data,
        timestamp,
    })
}

/// Update pipeline setting `field` to `now`, or to one millisecond past the
/// stored datetime when that is not earlier. Datetimes are stored at
/// millisecond precision, so two touches within one millisecond would
/// otherwise store the same value.
fn touch_pipeline(field: &str, now: DateTime<Utc>) -> Vec<Document> {
    let current = format!("${field}");
    let bumped = doc! {
        "$cond": [
            { "$eq": [{ "$type": current.as_str() }, "date"] },
            { "$add": [current.as_str(), 1] },
            Bson::Null,
        ]
    };
    let mut set = Document::new();
    set.insert(field, doc! { "$max": [bson::DateTime::from_chrono(now), bumped] });
    vec![doc! { "$set": set }]
}

#[async_trait]
impl CollectionHandle for MongoCollection {
    async fn find(&self, id: &SessionId, field: &str) -> Result<Option<SessionRecord>, SessionError> {
        let found = self
            .collection
            .find_one(doc! { "_id": object_id(id) })
            .await
            .map_err(DatabaseError::backend)?;
        found.map(|doc| to_record(id, &doc, field)).transpose()
    }

    async fn find_and_touch(
        &self,
        id: &SessionId,
        field: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, SessionError> {
        let found = self
            .collection
            .find_one_and_update(doc! { "_id": object_id(id) }, touch_pipeline(field, now))
            .return_document(ReturnDocument::After)
            .await
            .map_err(DatabaseError::backend)?;
        found.map(|doc| to_record(id, &doc, field)).transpose()
    }

    async fn upsert(&self, record: &SessionRecord, field: &str) -> Result<(), SessionError> {
        let oid = object_id(&record.id);
        let mut replacement = doc! { "_id": oid, "data": record.data.as_str() };
        if let Some(ts) = record.timestamp {
            replacement.insert(field, bson::DateTime::from_chrono(ts));
        }

        self.collection
            .replace_one(doc! { "_id": oid }, replacement)
            .upsert(true)
            .await
            .map_err(DatabaseError::backend)?;
        Ok(())
    }

    async fn remove(&self, id: &SessionId) -> Result<(), SessionError> {
        self.collection
            .delete_one(doc! { "_id": object_id(id) })
            .await
            .map_err(DatabaseError::backend)?;
        Ok(())
    }

    async fn ensure_ttl_index(&self, field: &str, expire_after: Duration) -> Result<(), SessionError> {
        let mut keys = Document::new();
        keys.insert(field, 1);

        let options = IndexOptions::builder()
            .background(true)
            .sparse(true)
            .expire_after(expire_after)
            .build();
        let model = IndexModel::builder().keys(keys).options(options).build();

        self.collection
            .create_index(model)
            .await
            .map_err(DatabaseError::backend)?;
        info!(
            "Ensured TTL index on {}.{} ({}s)",
            self.collection.name(),
            field,
            expire_after.as_secs()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_matches_session_id() {
        let id = SessionId::generate();
        assert_eq!(object_id(&id).to_hex(), id.to_hex());
    }

    #[test]
    fn test_to_record_reads_timestamp() {
        let id = SessionId::generate();
        let now = bson::DateTime::now();
        let doc = doc! { "_id": object_id(&id), "data": "payload", "lastAccessed": now };
        let rec = to_record(&id, &doc, "lastAccessed").unwrap();
        assert_eq!(rec.data, "payload");
        assert_eq!(rec.timestamp, Some(now.to_chrono()));

        let rec = to_record(&id, &doc, "modified").unwrap();
        assert_eq!(rec.timestamp, None);
    }

    #[test]
    fn test_touch_pipeline_bumps_past_stored_value() {
        let now = Utc::now();
        let pipeline = touch_pipeline("lastAccessed", now);
        assert_eq!(pipeline.len(), 1);

        let set = pipeline[0].get_document("$set").unwrap();
        let max = set
            .get_document("lastAccessed")
            .unwrap()
            .get_array("$max")
            .unwrap();
        assert_eq!(max[0], Bson::DateTime(bson::DateTime::from_chrono(now)));

        let cond = max[1].as_document().unwrap().get_array("$cond").unwrap();
        let add = cond[1].as_document().unwrap().get_array("$add").unwrap();
        assert_eq!(add[0], Bson::String("$lastAccessed".to_string()));
        assert_eq!(add[1], Bson::Int32(1));
        assert_eq!(cond[2], Bson::Null);
    }

    #[test]
    fn test_to_record_rejects_wrong_timestamp_type() {
        let id = SessionId::generate();
        let doc = doc! { "_id": object_id(&id), "data": "payload", "modified": "yesterday" };
        assert!(matches!(
            to_record(&id, &doc, "modified"),
            Err(SessionError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_to_record_requires_data() {
        let id = SessionId::generate();
        let doc = doc! { "_id": object_id(&id) };
        assert!(matches!(
            to_record(&id, &doc, "modified"),
            Err(SessionError::Database(DatabaseError::Malformed(_)))
        ));
    }
}

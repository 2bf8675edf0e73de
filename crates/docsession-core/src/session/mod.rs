pub mod id;
pub mod record_store;
pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::SessionOptions;

pub use id::SessionId;
pub use record_store::RecordStore;
pub use store::SessionStore;

/// The value map carried by a session.
pub type Values = HashMap<String, serde_json::Value>;

/// A session as seen by request handlers.
#[derive(Debug, Clone)]
pub struct Session {
    name: String,
    id: Option<SessionId>,
    pub values: Values,
    pub is_new: bool,
    pub options: SessionOptions,
    pinned_timestamp: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(name: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            name: name.into(),
            id: None,
            values: HashMap::new(),
            is_new: true,
            options,
            pinned_timestamp: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` until the first successful save.
    pub fn id(&self) -> Option<SessionId> {
        self.id
    }

    pub(crate) fn bind(&mut self, id: SessionId) {
        self.id = Some(id);
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), serde_json::Error> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    /// Store this timestamp on the next save instead of the current time.
    pub fn pin_timestamp(&mut self, ts: DateTime<Utc>) {
        self.pinned_timestamp = Some(ts);
    }

    pub fn pinned_timestamp(&self) -> Option<DateTime<Utc>> {
        self.pinned_timestamp
    }

    /// Mark the session for deletion on the next save.
    pub fn expire(&mut self) {
        self.options.max_age = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_unbound() {
        let session = Session::new("sid", SessionOptions::default());
        assert_eq!(session.name(), "sid");
        assert!(session.id().is_none());
        assert!(session.is_new);
        assert!(session.values.is_empty());
        assert!(session.pinned_timestamp().is_none());
    }

    #[test]
    fn test_typed_values() {
        let mut session = Session::new("sid", SessionOptions::default());
        session.insert("visits", 3u32).unwrap();
        session.insert("user", "alice").unwrap();

        assert_eq!(session.get::<u32>("visits"), Some(3));
        assert_eq!(session.get::<String>("user").as_deref(), Some("alice"));
        assert_eq!(session.get::<u32>("user"), None);
        assert_eq!(session.get::<u32>("missing"), None);

        assert_eq!(session.remove("visits"), Some(serde_json::json!(3)));
        assert_eq!(session.get::<u32>("visits"), None);
    }

    #[test]
    fn test_expire_sets_negative_max_age() {
        let mut session = Session::new("sid", SessionOptions::default());
        session.expire();
        assert!(session.options.max_age < 0);
    }
}

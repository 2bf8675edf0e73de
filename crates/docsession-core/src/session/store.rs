//! The New / refresh / Save protocol binding a client token to a stored record.

use std::sync::Arc;

use http::HeaderMap;
use tracing::{debug, info, warn};

use super::{RecordStore, Session, SessionId, Values};
use crate::codec::CodecChain;
use crate::config::{SessionOptions, StoreConfig};
use crate::db::{Cluster, Pool};
use crate::error::{Result, SessionError};
use crate::token::{CookieToken, TokenTransport};

/// Session store backed by a document collection.
///
/// Shared across request tasks behind an `Arc`. Every operation checks out
/// its own collection handle, so a dropped connection only fails the request
/// that was using it.
pub struct SessionStore<C: Cluster, T: TokenTransport = CookieToken> {
    records: RecordStore<C>,
    /// Encodes the session id into the client token.
    token_codecs: CodecChain,
    /// Encodes the value map into the stored record. Record lifetime is the
    /// TTL index's business, so these codecs carry no age or length limit.
    payload_codecs: CodecChain,
    options: SessionOptions,
    transport: T,
}

impl<C: Cluster> SessionStore<C, CookieToken> {
    /// Build a store over `cluster` and, when enabled, declare the TTL index.
    pub async fn connect(cluster: Arc<C>, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let pairs = config.key_pairs()?;

        // Token age is not tied to max-age: reads extend a record without
        // reissuing its token.
        let mut token_codecs = CodecChain::from_pairs(&pairs)?;
        if let Some(secs) = config.token_max_age {
            token_codecs.set_max_age(secs);
        }

        let mut payload_codecs = CodecChain::from_pairs(&pairs)?;
        payload_codecs.set_max_age(0);
        payload_codecs.set_max_length(0);

        let records = RecordStore::new(
            Pool::new(cluster),
            config.collection.clone(),
            config.timestamp_mode,
        );
        if config.ensure_ttl {
            records.ensure_ttl(config.options.max_age).await?;
        }

        info!(
            "Session store ready: collection={}, timestamp={}, keys={}",
            config.collection,
            config.timestamp_mode.field(),
            pairs.len()
        );
        Ok(Self {
            records,
            token_codecs,
            payload_codecs,
            options: config.options.clone(),
            transport: CookieToken,
        })
    }
}

impl<C: Cluster, T: TokenTransport> SessionStore<C, T> {
    /// Swap the token transport.
    pub fn with_transport<U: TokenTransport>(self, transport: U) -> SessionStore<C, U> {
        SessionStore {
            records: self.records,
            token_codecs: self.token_codecs,
            payload_codecs: self.payload_codecs,
            options: self.options,
            transport,
        }
    }

    pub fn records(&self) -> &RecordStore<C> {
        &self.records
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Change the default max-age of new sessions.
    pub fn set_max_age(&mut self, secs: i64) {
        self.options.max_age = secs;
    }

    /// Change the maximum accepted token age; 0 disables the check.
    pub fn set_token_max_age(&mut self, secs: i64) {
        self.token_codecs.set_max_age(secs);
    }

    /// Materialize the session `name` for a request.
    ///
    /// A missing or undecodable token, an expired record and an undecodable
    /// payload all yield a new session. A token that decodes to a malformed
    /// id is [`SessionError::InvalidId`]; database failures propagate.
    pub async fn new_session(&self, headers: &HeaderMap, name: &str) -> Result<Session> {
        let touch = self.records.timestamp_mode().touches_on_load();
        self.load_session(headers, name, touch).await
    }

    /// Like [`new_session`](Self::new_session), but always moves the stored
    /// timestamp to now.
    pub async fn refresh_session(&self, headers: &HeaderMap, name: &str) -> Result<Session> {
        self.load_session(headers, name, true).await
    }

    async fn load_session(&self, headers: &HeaderMap, name: &str, touch: bool) -> Result<Session> {
        let mut session = Session::new(name, self.options.clone());

        let Some(token) = self.transport.get_token(headers, name) else {
            return Ok(session);
        };
        let raw: String = match self.token_codecs.decode(name, &token) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Ignoring token for session {}: {}", name, e);
                return Ok(session);
            }
        };
        let id = SessionId::parse(&raw)?;
        session.bind(id);

        let record = match self.records.load(&id, touch).await {
            Ok(record) => record,
            Err(SessionError::NotFound) => {
                debug!("Session {} ({}) expired or deleted, starting over", name, id);
                return Ok(session);
            }
            Err(e) => return Err(e),
        };

        match self.payload_codecs.decode::<Values>(name, &record.data) {
            Ok(values) => {
                session.values = values;
                session.is_new = false;
            }
            Err(e) => warn!("Discarding unreadable payload of session {} ({}): {}", name, id, e),
        }
        Ok(session)
    }

    /// Persist `session` and write its token to `headers`.
    ///
    /// A negative max-age deletes the record and clears the token. Nothing is
    /// written to `headers` unless the database work succeeded.
    pub async fn save(&self, headers: &mut HeaderMap, session: &mut Session) -> Result<()> {
        if session.options.max_age < 0 {
            if let Some(id) = session.id() {
                self.records.delete(&id).await?;
                debug!("Deleted session {} ({})", session.name(), id);
            }
            self.transport
                .set_token(headers, session.name(), "", &session.options);
            return Ok(());
        }

        let id = session.id().unwrap_or_else(SessionId::generate);
        let data = self.payload_codecs.encode(session.name(), &session.values)?;
        self.records
            .upsert(&id, data, session.pinned_timestamp())
            .await?;
        session.bind(id);
        session.pinned_timestamp = None;

        let token = self.token_codecs.encode(session.name(), &id.to_hex())?;
        self.transport
            .set_token(headers, session.name(), &token, &session.options);
        session.is_new = false;
        Ok(())
    }
}

#[cfg(all(test, feature = "memory-backend"))]
mod tests {
    use http::header::{COOKIE, SET_COOKIE};
    use http::HeaderValue;

    use super::*;
    use crate::config::{KeyPairConfig, TimestampMode};
    use crate::db::memory::MemoryCluster;
    use crate::error::CodecError;
    use crate::token::HeaderToken;

    fn config() -> StoreConfig {
        StoreConfig {
            key_pairs: vec![KeyPairConfig {
                hash_key: hex::encode([7u8; 32]),
                block_key: Some(hex::encode([8u8; 32])),
            }],
            ..StoreConfig::default()
        }
    }

    async fn store(cluster: &MemoryCluster) -> SessionStore<MemoryCluster> {
        SessionStore::connect(Arc::new(cluster.clone()), &config())
            .await
            .unwrap()
    }

    /// Turn a response `Set-Cookie` into the next request's `Cookie`.
    fn replay(response: &HeaderMap) -> HeaderMap {
        let mut request = HeaderMap::new();
        for value in response.get_all(SET_COOKIE) {
            let pair = value.to_str().unwrap().split(';').next().unwrap().to_string();
            request.append(COOKIE, HeaderValue::from_str(&pair).unwrap());
        }
        request
    }

    #[tokio::test]
    async fn test_connect_requires_keys() {
        let cluster = MemoryCluster::new();
        let result = SessionStore::connect(Arc::new(cluster), &StoreConfig::default()).await;
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_declares_ttl_once() {
        let cluster = MemoryCluster::new();
        let _store = store(&cluster).await;
        assert_eq!(cluster.index_declarations(), 1);
        assert_eq!(cluster.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_no_token_gives_fresh_session_without_io() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;
        let before = cluster.checkouts();

        let session = store.new_session(&HeaderMap::new(), "sid").await.unwrap();
        assert!(session.is_new);
        assert!(session.id().is_none());
        assert_eq!(cluster.checkouts(), before);
    }

    #[tokio::test]
    async fn test_garbage_token_gives_fresh_session() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("sid=not-a-token"));
        let session = store.new_session(&headers, "sid").await.unwrap();
        assert!(session.is_new);
        assert!(session.id().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;

        let mut session = store.new_session(&HeaderMap::new(), "sid").await.unwrap();
        session.insert("foo", "bar").unwrap();
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();
        assert!(!session.is_new);
        let id = session.id().unwrap();

        let loaded = store.new_session(&replay(&response), "sid").await.unwrap();
        assert!(!loaded.is_new);
        assert_eq!(loaded.id(), Some(id));
        assert_eq!(loaded.get::<String>("foo").as_deref(), Some("bar"));
    }

    #[tokio::test]
    async fn test_token_bound_to_session_name() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;

        let mut session = Session::new("sid", store.options().clone());
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();

        let token = CookieToken.get_token(&replay(&response), "sid").unwrap();
        let mut request = HeaderMap::new();
        request.insert(COOKIE, HeaderValue::from_str(&format!("other={token}")).unwrap());
        let other = store.new_session(&request, "other").await.unwrap();
        assert!(other.is_new);
        assert!(other.id().is_none());
    }

    #[tokio::test]
    async fn test_malformed_id_in_valid_token_is_error() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;
        let before = cluster.checkouts();

        let forged = store.token_codecs.encode("sid", "not-an-object-id").unwrap();
        let mut request = HeaderMap::new();
        request.insert(COOKIE, HeaderValue::from_str(&format!("sid={forged}")).unwrap());

        let err = store.new_session(&request, "sid").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidId));
        assert_eq!(cluster.checkouts(), before);
    }

    #[tokio::test]
    async fn test_unreadable_payload_gives_bound_new_session() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;

        let mut session = Session::new("sid", store.options().clone());
        session.insert("foo", "bar").unwrap();
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();
        let id = session.id().unwrap();

        store
            .records()
            .upsert(&id, "corrupted".to_string(), None)
            .await
            .unwrap();
        let loaded = store.new_session(&replay(&response), "sid").await.unwrap();
        assert!(loaded.is_new);
        assert_eq!(loaded.id(), Some(id));
        assert!(loaded.values.is_empty());
    }

    #[tokio::test]
    async fn test_infrastructure_error_propagates() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;

        let mut session = Session::new("sid", store.options().clone());
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();

        cluster.fail_next_checkouts(1);
        let err = store.new_session(&replay(&response), "sid").await.unwrap_err();
        assert!(matches!(err, SessionError::Database(_)));
    }

    #[tokio::test]
    async fn test_failed_save_leaves_headers_untouched() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;

        let mut session = Session::new("sid", store.options().clone());
        cluster.fail_next_checkouts(1);
        let mut response = HeaderMap::new();
        assert!(store.save(&mut response, &mut session).await.is_err());
        assert!(response.is_empty());
        assert!(session.id().is_none());
        assert!(session.is_new);
    }

    #[tokio::test]
    async fn test_future_pin_is_stored() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;
        let future = chrono::Utc::now() + chrono::Duration::days(1);

        let mut session = Session::new("sid", store.options().clone());
        session.pin_timestamp(future);
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();
        assert_eq!(response.get_all(SET_COOKIE).iter().count(), 1);
        assert_eq!(
            store
                .records()
                .load(&session.id().unwrap(), false)
                .await
                .unwrap()
                .timestamp,
            Some(future)
        );
    }

    #[tokio::test]
    async fn test_pin_applies_to_one_save() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;
        let pinned = chrono::Utc::now() - chrono::Duration::hours(1);

        let mut session = Session::new("sid", store.options().clone());
        session.pin_timestamp(pinned);
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();
        let id = session.id().unwrap();
        assert_eq!(
            store.records().load(&id, false).await.unwrap().timestamp,
            Some(pinned)
        );
        assert!(session.pinned_timestamp().is_none());

        store.save(&mut response, &mut session).await.unwrap();
        assert!(store.records().load(&id, false).await.unwrap().timestamp.unwrap() > pinned);
    }

    #[tokio::test]
    async fn test_delete_unsaved_session_only_clears_token() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await;
        let before = cluster.checkouts();

        let mut session = Session::new("sid", store.options().clone());
        session.expire();
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();
        assert_eq!(cluster.checkouts(), before);
        assert_eq!(response.get_all(SET_COOKIE).iter().count(), 1);
    }

    #[tokio::test]
    async fn test_set_max_age_applies_to_new_sessions() {
        let cluster = MemoryCluster::new();
        let mut store = store(&cluster).await;
        store.set_max_age(60);

        let session = store.new_session(&HeaderMap::new(), "sid").await.unwrap();
        assert_eq!(session.options.max_age, 60);
    }

    #[tokio::test]
    async fn test_token_max_age_is_separate_from_max_age() {
        let cluster = MemoryCluster::new();
        let config = StoreConfig {
            token_max_age: Some(1),
            ..config()
        };
        let mut store = SessionStore::connect(Arc::new(cluster.clone()), &config)
            .await
            .unwrap();

        let mut session = Session::new("sid", store.options().clone());
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();
        let request = replay(&response);

        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        assert!(store.new_session(&request, "sid").await.unwrap().is_new);

        // Raising the token limit accepts the same token again.
        store.set_token_max_age(0);
        let loaded = store.new_session(&request, "sid").await.unwrap();
        assert!(!loaded.is_new);
        assert_eq!(loaded.id(), session.id());
    }

    #[tokio::test]
    async fn test_header_transport() {
        let cluster = MemoryCluster::new();
        let store = store(&cluster).await.with_transport(HeaderToken::default());

        let mut session = store.new_session(&HeaderMap::new(), "sid").await.unwrap();
        session.insert("n", 1).unwrap();
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();
        assert!(response.get(SET_COOKIE).is_none());

        // The response header doubles as the next request header.
        let loaded = store.new_session(&response, "sid").await.unwrap();
        assert_eq!(loaded.get::<i32>("n"), Some(1));
    }

    #[tokio::test]
    async fn test_access_mode_store_touches_on_new() {
        let cluster = MemoryCluster::new();
        let config = StoreConfig {
            timestamp_mode: TimestampMode::LastAccessed,
            ..config()
        };
        let store = SessionStore::connect(Arc::new(cluster.clone()), &config)
            .await
            .unwrap();
        assert_eq!(
            cluster.ttl_index("sessions", "lastAccessed"),
            Some(std::time::Duration::from_secs(config.options.max_age as u64))
        );

        let pinned = chrono::Utc::now() - chrono::Duration::minutes(10);
        let mut session = Session::new("sid", store.options().clone());
        session.pin_timestamp(pinned);
        let mut response = HeaderMap::new();
        store.save(&mut response, &mut session).await.unwrap();

        store.new_session(&replay(&response), "sid").await.unwrap();
        let ts = store
            .records()
            .load(&session.id().unwrap(), false)
            .await
            .unwrap()
            .timestamp
            .unwrap();
        assert!(ts > pinned);
    }

    #[test]
    fn test_payload_codecs_have_no_length_limit() {
        let pairs = config().key_pairs().unwrap();
        let mut codecs = CodecChain::from_pairs(&pairs).unwrap();
        let big = "x".repeat(10_000);
        assert!(matches!(codecs.encode("sid", &big), Err(CodecError::TooLong(_))));
        codecs.set_max_length(0);
        assert!(codecs.encode("sid", &big).is_ok());
    }
}

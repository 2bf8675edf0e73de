//! Demo HTTP surface: a visit counter kept in the session.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use docsession_core::db::Cluster;
use docsession_core::{SessionError, SessionStore};

pub struct AppState<C: Cluster> {
    pub store: SessionStore<C>,
    pub session_name: String,
}

/// Create the axum Router with the demo routes.
pub fn create_router<C: Cluster>(state: Arc<AppState<C>>) -> Router {
    Router::new()
        .route("/", get(handle_visit::<C>))
        .route("/logout", get(handle_logout::<C>))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: SessionError) -> Response {
    match e {
        SessionError::InvalidId => {
            warn!("Rejected forged session token");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid session" }))).into_response()
        }
        e => {
            error!("Session error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "session store unavailable" })),
            )
                .into_response()
        }
    }
}

/// GET /: count visits in the session
async fn handle_visit<C: Cluster>(
    State(state): State<Arc<AppState<C>>>,
    headers: HeaderMap,
) -> Response {
    let mut session = match state.store.new_session(&headers, &state.session_name).await {
        Ok(session) => session,
        Err(e) => return error_response(e),
    };
    let was_new = session.is_new;
    let visits = session.get::<u64>("visits").unwrap_or(0) + 1;
    session.values.insert("visits".to_string(), json!(visits));

    let mut response_headers = HeaderMap::new();
    if let Err(e) = state.store.save(&mut response_headers, &mut session).await {
        return error_response(e);
    }

    let body = json!({
        "visits": visits,
        "new": was_new,
        "session": session.id().map(|id| id.to_hex()),
    });
    (response_headers, Json(body)).into_response()
}

/// GET /logout: delete the session and clear the cookie
async fn handle_logout<C: Cluster>(
    State(state): State<Arc<AppState<C>>>,
    headers: HeaderMap,
) -> Response {
    let mut session = match state.store.new_session(&headers, &state.session_name).await {
        Ok(session) => session,
        Err(e) => return error_response(e),
    };
    session.expire();

    let mut response_headers = HeaderMap::new();
    if let Err(e) = state.store.save(&mut response_headers, &mut session).await {
        return error_response(e);
    }
    (response_headers, Json(json!({ "loggedOut": true }))).into_response()
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": docsession_core::VERSION,
    }))
}

pub async fn serve<C: Cluster>(addr: &str, state: Arc<AppState<C>>) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::header::{COOKIE, SET_COOKIE};
    use axum::http::{HeaderValue, Request};
    use docsession_core::config::{KeyPairConfig, StoreConfig};
    use docsession_core::db::memory::MemoryCluster;
    use tower::ServiceExt;

    use super::*;

    async fn app(cluster: &MemoryCluster) -> Router {
        let config = StoreConfig {
            key_pairs: vec![KeyPairConfig {
                hash_key: hex::encode([5u8; 32]),
                block_key: Some(hex::encode([6u8; 32])),
            }],
            ..StoreConfig::default()
        };
        let store = SessionStore::connect(Arc::new(cluster.clone()), &config)
            .await
            .unwrap();
        create_router(Arc::new(AppState {
            store,
            session_name: "docsession".to_string(),
        }))
    }

    async fn send(router: &Router, uri: &str, cookie: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, HeaderValue::from_str(cookie).unwrap());
        }
        router
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn cookie_pair(response: &Response) -> String {
        let set_cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_visit_counter() {
        let cluster = MemoryCluster::new();
        let router = app(&cluster).await;

        let first = send(&router, "/", None).await;
        assert_eq!(first.status(), StatusCode::OK);
        let cookie = cookie_pair(&first);
        let body = json_body(first).await;
        assert_eq!(body["visits"], 1);
        assert_eq!(body["new"], true);

        let second = send(&router, "/", Some(&cookie)).await;
        let body = json_body(second).await;
        assert_eq!(body["visits"], 2);
        assert_eq!(body["new"], false);
        assert_eq!(cluster.document_count("sessions"), 1);
    }

    #[tokio::test]
    async fn test_logout() {
        let cluster = MemoryCluster::new();
        let router = app(&cluster).await;

        let first = send(&router, "/", None).await;
        let cookie = cookie_pair(&first);

        let logout = send(&router, "/logout", Some(&cookie)).await;
        assert_eq!(logout.status(), StatusCode::OK);
        assert!(cookie_pair(&logout).ends_with('='));
        assert_eq!(cluster.document_count("sessions"), 0);

        let body = json_body(send(&router, "/", Some(&cookie)).await).await;
        assert_eq!(body["visits"], 1);
        assert_eq!(body["new"], true);
    }

    #[tokio::test]
    async fn test_store_outage_is_500() {
        let cluster = MemoryCluster::new();
        let router = app(&cluster).await;

        cluster.fail_next_checkouts(1);
        let response = send(&router, "/", None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_health() {
        let cluster = MemoryCluster::new();
        let router = app(&cluster).await;
        let body = json_body(send(&router, "/health", None).await).await;
        assert_eq!(body["status"], "ok");
    }
}

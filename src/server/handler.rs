// Axum request handlers: listing lookups, health and stats over the fetch service.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::api::FetchService;
use crate::engine::cache::{CacheEntry, CacheStatus};
use crate::error::FetchError;

pub type AppState = Arc<FetchService>;

pub const API_KEY_HEADER: &str = "x-api-key";

pub struct ApiServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ApiServer {
    /// Bind `addr` (port 0 picks a free one) and serve in the background.
    pub async fn start(service: AppState, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(service);

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        info!("http api listening on {}", addr);

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop accepting connections and wait for open requests to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

pub fn router(service: AppState) -> Router {
    let mut app = Router::new()
        .route("/listings/{entity_id}", get(listing_handler))
        .route("/health", get(health_handler))
        .route("/health/detailed", get(detailed_health_handler))
        .route("/stats", get(stats_handler))
        .route("/schedule", get(schedule_handler));
    if service.config().api_key.is_some() {
        app = app.layer(middleware::from_fn_with_state(
            Arc::clone(&service),
            require_api_key,
        ));
    }
    app.with_state(service)
}

async fn require_api_key(State(service): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = service.config().api_key.as_deref() else {
        return next.run(req).await;
    };
    let matches = req
        .headers()
        .get(API_KEY_HEADER)
        .map(|v| v.as_bytes() == expected.as_bytes());
    match matches {
        None => error_response(StatusCode::UNAUTHORIZED, "missing_api_key", "API key required"),
        Some(true) => next.run(req).await,
        Some(false) => {
            warn!("rejected request with invalid api key: {}", req.uri().path());
            error_response(StatusCode::FORBIDDEN, "invalid_api_key", "invalid API key")
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListingQuery {
    #[serde(default)]
    force_refresh: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListingEnvelope {
    entity_id: String,
    cached: bool,
    stale: bool,
    fetched_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl ListingEnvelope {
    fn new(entity_id: String, entry: &CacheEntry, cached: bool, stale: bool) -> Self {
        Self {
            entity_id,
            cached,
            stale,
            fetched_at: entry.fetched_at,
            payload: entry.payload_json(),
        }
    }
}

fn error_response(status: StatusCode, class: &str, message: &str) -> Response {
    (status, Json(json!({ "error": message, "class": class }))).into_response()
}

fn status_for(err: &FetchError) -> StatusCode {
    match err.root() {
        FetchError::ResourceExhausted(_) | FetchError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FetchError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        FetchError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// GET /listings/{entity_id}: serve from cache or fetch on demand.
async fn listing_handler(
    State(service): State<AppState>,
    Path(entity_id): Path<String>,
    Query(query): Query<ListingQuery>,
) -> Response {
    if !service.scheduler().is_tracked(&entity_id) {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("entity {} is not tracked", entity_id),
        );
    }

    debug!(
        "listing request entity={} force_refresh={}",
        entity_id, query.force_refresh
    );
    match service
        .orchestrator()
        .fetch_one(&entity_id, query.force_refresh)
        .await
    {
        Ok(lookup) => {
            let cached = lookup.status == CacheStatus::Hit;
            Json(ListingEnvelope::new(entity_id, &lookup.entry, cached, false)).into_response()
        }
        Err(err) => {
            if err.is_resource_exhausted() {
                if let Some(entry) = service.cache().get_stale(&entity_id) {
                    warn!("sessions exhausted, serving stale entry for {}", entity_id);
                    return Json(ListingEnvelope::new(entity_id, &entry, true, true))
                        .into_response();
                }
            }
            error_response(status_for(&err), err.root().class(), &err.to_string())
        }
    }
}

/// GET /health
async fn health_handler(State(service): State<AppState>) -> Response {
    Json(service.health()).into_response()
}

/// GET /health/detailed
async fn detailed_health_handler(State(service): State<AppState>) -> Response {
    Json(service.detailed_health()).into_response()
}

/// GET /stats
async fn stats_handler(State(service): State<AppState>) -> Response {
    Json(service.stats_report()).into_response()
}

/// GET /schedule
async fn schedule_handler(State(service): State<AppState>) -> Response {
    Json(service.scheduler().entries()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&FetchError::ResourceExhausted(Duration::from_secs(1))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&FetchError::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&FetchError::TransientUpstream {
                attempts: 3,
                message: "HTTP 500".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&FetchError::CacheFetchFailed(Box::new(
                FetchError::DetectionSuspected("captcha".into())
            ))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&FetchError::CacheFetchFailed(Box::new(FetchError::NotFound(
                "HTTP 404".into()
            )))),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_query_defaults() {
        let q: ListingQuery = serde_json::from_str("{}").unwrap();
        assert!(!q.force_refresh);
    }
}

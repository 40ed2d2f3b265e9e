//! REST surface.
//!
//! Everything lives under the configurable path prefix (default
//! `/api/cloudNotifications/v1/`):
//!
//! | Path | Method | Result |
//! |---|---|---|
//! | `/publishers` | POST / GET | create (201) / list |
//! | `/publishers/{id}` | GET / DELETE | record / 204 |
//! | `/subscriptions` | POST / GET | create (201) / list |
//! | `/subscriptions/{id}` | GET / DELETE | record / 204 |
//! | `/{resource}/CurrentState` | GET | CloudEvent JSON |
//! | `/health` | GET | 200 when bus and engine are up |
//! | `/metrics` | GET | Prometheus text |
//!
//! Errors serialize as `{code, message}`. A persistence failure maps to a
//! 5xx and leaves the in-memory store unchanged.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ptpnotify_core::event::Event;
use ptpnotify_core::pubsub::PubSub;
use ptpnotify_core::store::{PubSubStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::engine::{EngineError, PtpEventManager};
use crate::metrics::ProxyMetrics;

/// Request body cap.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Shared state behind every handler.
pub struct AppState {
    /// Publisher store.
    pub publishers: Arc<PubSubStore>,
    /// Subscription store.
    pub subscriptions: Arc<PubSubStore>,
    /// The event engine, for current-state queries and liveness.
    pub engine: Arc<PtpEventManager>,
    /// Metrics registry served on `/metrics`.
    pub metrics: Arc<ProxyMetrics>,
    /// Base URL for `URILocation` fields, e.g.
    /// `http://localhost:9085/api/cloudNotifications/v1/`.
    pub api_base: String,
}

/// REST error carrying the HTTP status and a message.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body failed validation.
    #[error("{0}")]
    BadRequest(String),

    /// No such record or resource.
    #[error("{0}")]
    NotFound(String),

    /// The store could not be persisted; in-memory state is unchanged.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The daemon is shutting down or a component is unavailable.
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    /// HTTP status for the error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidRecord(inner) => Self::BadRequest(inner.to_string()),
            StoreError::NotFound(id) => Self::NotFound(format!("no record with id {id}")),
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::UnknownResource(_) | EngineError::StateUnknown(_) => {
                Self::NotFound(e.to_string())
            },
            other => Self::BadRequest(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            code: status.as_u16(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Builds the full router under `api_path`.
#[must_use]
pub fn router(state: Arc<AppState>, api_path: &str) -> Router {
    let api = Router::new()
        .route("/publishers", post(create_publisher).get(list_publishers))
        .route(
            "/publishers/{id}",
            get(get_publisher).delete(delete_publisher),
        )
        .route(
            "/subscriptions",
            post(create_subscription).get(list_subscriptions),
        )
        .route(
            "/subscriptions/{id}",
            get(get_subscription).delete(delete_subscription),
        )
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/{*resource}", get(current_state))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state);

    let prefix = api_path.trim_end_matches('/');
    if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    }
}

fn with_location(mut record: PubSub, api_base: &str, kind_path: &str) -> PubSub {
    if let Some(id) = &record.id {
        record.uri_location = Some(format!("{api_base}{kind_path}/{id}"));
    }
    record
}

async fn create_publisher(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PubSub>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.publishers.create(body)?;
    debug!(resource = %record.resource, "publisher created");
    Ok((
        StatusCode::CREATED,
        Json(with_location(record, &state.api_base, "publishers")),
    ))
}

async fn list_publishers(State(state): State<Arc<AppState>>) -> Json<Vec<PubSub>> {
    let records = state
        .publishers
        .list()
        .into_iter()
        .map(|r| with_location(r, &state.api_base, "publishers"))
        .collect();
    Json(records)
}

async fn get_publisher(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PubSub>, ApiError> {
    state
        .publishers
        .get(&id)
        .map(|r| Json(with_location(r, &state.api_base, "publishers")))
        .ok_or_else(|| ApiError::NotFound(format!("no publisher with id {id}")))
}

async fn delete_publisher(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.publishers.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PubSub>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.subscriptions.create(body)?;
    debug!(resource = %record.resource, "subscription created");
    Ok((
        StatusCode::CREATED,
        Json(with_location(record, &state.api_base, "subscriptions")),
    ))
}

async fn list_subscriptions(State(state): State<Arc<AppState>>) -> Json<Vec<PubSub>> {
    let records = state
        .subscriptions
        .list()
        .into_iter()
        .map(|r| with_location(r, &state.api_base, "subscriptions"))
        .collect();
    Json(records)
}

async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PubSub>, ApiError> {
    state
        .subscriptions
        .get(&id)
        .map(|r| Json(with_location(r, &state.api_base, "subscriptions")))
        .ok_or_else(|| ApiError::NotFound(format!("no subscription with id {id}")))
}

async fn delete_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.subscriptions.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /{resource}/CurrentState`: synchronous CloudEvent built from the
/// stats store, without touching the bus.
async fn current_state(
    State(state): State<Arc<AppState>>,
    Path(resource): Path<String>,
) -> Result<Json<Event>, ApiError> {
    let Some(address) = resource.strip_suffix("/CurrentState") else {
        return Err(ApiError::NotFound(format!("no route for /{resource}")));
    };
    let event = state.engine.current_state(&format!("/{address}"))?;
    Ok(Json(event))
}

async fn health(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiError> {
    if state.engine.is_bus_open() {
        Ok("OK")
    } else {
        Err(ApiError::Unavailable("event bus is down".to_string()))
    }
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(
                http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use ptpnotify_core::event::{EventType, SyncState};
    use ptpnotify_core::resource::ResourceTemplate;
    use ptpnotify_core::store::StoreKind;
    use tokio::sync::mpsc;

    use super::*;
    use crate::bus::shutdown_channel;
    use crate::ptp4lconf::{ConfigName, Iface};

    struct Fixture {
        state: Arc<AppState>,
        // Keeps the out channel open so the engine can publish.
        _out_rx: mpsc::Receiver<ptpnotify_core::channel::DataChan>,
        _shutdown_handle: crate::bus::ShutdownHandle,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let publishers =
            Arc::new(PubSubStore::open(dir.path(), StoreKind::Publisher).expect("open"));
        let subscriptions =
            Arc::new(PubSubStore::open(dir.path(), StoreKind::Subscription).expect("open"));
        let metrics = Arc::new(ProxyMetrics::new().expect("metrics"));
        let (out_tx, out_rx) = mpsc::channel(16);
        let (shutdown_handle, shutdown) = shutdown_channel();

        let mut engine = PtpEventManager::new(
            "worker-0",
            ResourceTemplate::default(),
            out_tx,
            Arc::clone(&metrics),
            shutdown,
        );
        engine
            .register_publishers(&publishers, "http://localhost:9085/api/cloudNotifications/v1/")
            .expect("publishers register");

        Fixture {
            state: Arc::new(AppState {
                publishers,
                subscriptions,
                engine: Arc::new(engine),
                metrics,
                api_base: "http://localhost:9085/api/cloudNotifications/v1/".to_string(),
            }),
            _out_rx: out_rx,
            _shutdown_handle: shutdown_handle,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn subscription_create_then_get_round_trips() {
        let fixture = fixture();
        let body = PubSub::new("/cluster/node/worker-0/sync", "http://localhost:9095/event");

        let created = fixture
            .state
            .subscriptions
            .create(body.clone())
            .expect("create");
        let id = created.id.clone().expect("id assigned");

        let fetched = get_subscription(State(Arc::clone(&fixture.state)), Path(id.clone()))
            .await
            .expect("found")
            .0;
        assert_eq!(fetched.resource, body.resource);
        assert_eq!(fetched.end_point_uri, body.end_point_uri);
        assert_eq!(
            fetched.uri_location.expect("location filled"),
            format!(
                "http://localhost:9085/api/cloudNotifications/v1/subscriptions/{id}"
            )
        );
    }

    #[tokio::test]
    async fn create_is_idempotent_via_handler() {
        let fixture = fixture();
        let body = PubSub::new("/cluster/node/worker-0/sync", "http://localhost:9095/event");

        let first = fixture
            .state
            .subscriptions
            .create(body.clone())
            .expect("create");
        let second = fixture.state.subscriptions.create(body).expect("create");
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn delete_missing_subscription_is_not_found() {
        let fixture = fixture();
        let result =
            delete_subscription(State(Arc::clone(&fixture.state)), Path("nope".to_string())).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn current_state_requires_recorded_stats() {
        let fixture = fixture();
        let resource =
            "cluster/node/worker-0/sync/ptp-status/ptp-state-change/CurrentState".to_string();

        let missing =
            current_state(State(Arc::clone(&fixture.state)), Path(resource.clone())).await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));

        fixture
            .state
            .engine
            .on_sample(
                "profile",
                &ConfigName::from("ptp4l.0.config"),
                &Iface::from("ens1f0"),
                3,
                SyncState::Freerun,
                EventType::PtpStateChange,
            )
            .await;

        let event = current_state(State(Arc::clone(&fixture.state)), Path(resource))
            .await
            .expect("state available")
            .0;
        assert_eq!(event.event_type, EventType::PtpStateChange);
        assert!(!event.data.values.is_empty());
    }

    #[tokio::test]
    async fn health_reports_bus_liveness() {
        let fixture = fixture();
        let ok = health(State(Arc::clone(&fixture.state))).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn errors_serialize_with_code_and_message() {
        let response = ApiError::NotFound("no publisher with id x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

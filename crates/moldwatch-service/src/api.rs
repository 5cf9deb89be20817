//! REST API endpoints for the moldwatch-service.
//!
//! Every data endpoint reads the hub's merged, sorted series; nothing is
//! persisted by the service itself.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. A history
//! query that failed upstream maps to 502, a channel that is down to 503 and
//! malformed input to 400.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use moldwatch_service::api;
//!
//! let app = api::router().with_state(state);
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use moldwatch_core::{FetchSummary, PipelineStats, SubscriptionRecord};
use moldwatch_types::{
    CanonicalSample, ConnectionStatus, DeviceId, MachineState, RelativeRange, TimeRange,
};

use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Health and status
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        // Data endpoints
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}/samples", get(get_samples))
        .route("/api/devices/{id}/latest", get(get_latest))
        .route("/api/devices/{id}/refresh", post(refresh))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Service status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub uptime_secs: i64,
    /// Shared channel status.
    pub connection: ConnectionStatus,
    /// Live subscriptions held through the registry.
    pub subscriptions: Vec<SubscriptionRecord>,
    /// Ingestion counters.
    pub pipeline: PipelineStats,
    /// Distinct history fetches in flight.
    pub in_flight_queries: usize,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let started_at = state.started_at();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        started_at,
        uptime_secs: (OffsetDateTime::now_utc() - started_at).whole_seconds(),
        connection: state.hub.connection_status(),
        subscriptions: state.hub.registry().records(),
        pipeline: state.hub.pipeline().stats(),
        in_flight_queries: state.hub.queries().in_flight(),
    })
}

/// One device in the device list.
#[derive(Debug, Serialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub alias: Option<String>,
    /// Whether the service holds a subscription.
    pub watched: bool,
    pub state: MachineState,
    pub status_code: Option<i64>,
    pub sample_count: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_timestamp: Option<OffsetDateTime>,
    /// Seconds since the newest sample.
    pub data_age_secs: Option<f64>,
    /// Last subscription or query error.
    pub error: Option<String>,
}

/// List every device that is watched or has data.
async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceSummary>> {
    let pipeline = state.hub.pipeline();
    let mut summaries = Vec::new();
    for id in state.known_devices().await {
        let subscription = state.subscription(&id).await;
        let latest = pipeline.latest(&id);
        summaries.push(DeviceSummary {
            alias: state.alias(&id).map(str::to_string),
            watched: subscription.is_some(),
            state: pipeline.machine_state(&id),
            status_code: pipeline.device_status(&id).map(|s| s.code),
            sample_count: pipeline.len(&id),
            latest_timestamp: latest.as_ref().map(|s| s.timestamp),
            data_age_secs: latest
                .as_ref()
                .map(|s| (OffsetDateTime::now_utc() - s.timestamp).as_seconds_f64().max(0.0)),
            error: subscription.and_then(|s| s.error()),
            id,
        });
    }
    Json(summaries)
}

/// Query parameters selecting a window.
#[derive(Debug, Deserialize, Default)]
pub struct WindowQuery {
    /// Relative window, e.g. `-1h`.
    pub range: Option<RelativeRange>,
    /// Unix timestamp (seconds) to read from, inclusive.
    pub since: Option<i64>,
    /// Unix timestamp (seconds) to read until, inclusive.
    pub until: Option<i64>,
    /// Return at most this many of the newest samples.
    pub limit: Option<usize>,
}

impl WindowQuery {
    /// Resolve to an absolute window, or `None` when no window was given.
    pub fn resolve(&self, now: OffsetDateTime) -> Result<Option<TimeRange>, AppError> {
        if let Some(range) = self.range {
            if self.since.is_some() || self.until.is_some() {
                return Err(AppError::BadRequest(
                    "'range' cannot be combined with 'since'/'until'".to_string(),
                ));
            }
            return Ok(Some(range.resolve(now)));
        }
        if self.since.is_none() && self.until.is_none() {
            return Ok(None);
        }

        let since = match self.since {
            Some(secs) => unix(secs, "since")?,
            None => OffsetDateTime::UNIX_EPOCH,
        };
        let until = match self.until {
            Some(secs) => unix(secs, "until")?,
            None => now,
        };
        TimeRange::new(since, until)
            .map(Some)
            .map_err(|_| {
                AppError::BadRequest(format!(
                    "Invalid time range: 'since' ({}) must be less than or equal to 'until' ({})",
                    since.unix_timestamp(),
                    until.unix_timestamp()
                ))
            })
    }
}

fn unix(secs: i64, field: &str) -> Result<OffsetDateTime, AppError> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|_| AppError::BadRequest(format!("'{}' out of range: {}", field, secs)))
}

fn parse_id(raw: &str) -> Result<DeviceId, AppError> {
    DeviceId::parse(raw).map_err(|e| AppError::BadRequest(e.to_string()))
}

/// Samples of one device.
#[derive(Debug, Serialize)]
pub struct SamplesResponse {
    pub device_id: DeviceId,
    pub count: usize,
    /// Whether older samples were cut by `limit`.
    pub truncated: bool,
    pub samples: Vec<Arc<CanonicalSample>>,
}

/// Read the merged series of a device.
///
/// Without a window, a watched device returns its subscription's view and
/// any other device returns everything retained.
async fn get_samples(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<SamplesResponse>, AppError> {
    let id = parse_id(&id)?;
    let window = params.resolve(OffsetDateTime::now_utc())?;

    let subscription = state.subscription(&id).await;
    let mut samples = match (window, &subscription) {
        (Some(range), _) => state.hub.pipeline().read(&id, Some(&range)),
        (None, Some(subscription)) => subscription.samples(),
        (None, None) => state.hub.pipeline().read(&id, None),
    };
    if samples.is_empty() && subscription.is_none() && state.hub.pipeline().len(&id) == 0 {
        return Err(AppError::NotFound(format!("Unknown device: {}", id)));
    }

    let mut truncated = false;
    if let Some(limit) = params.limit
        && samples.len() > limit
    {
        samples.drain(..samples.len() - limit);
        truncated = true;
    }

    Ok(Json(SamplesResponse {
        device_id: id,
        count: samples.len(),
        truncated,
        samples,
    }))
}

/// Newest sample of a device.
async fn get_latest(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Arc<CanonicalSample>>, AppError> {
    let id = parse_id(&id)?;
    let latest = match state.subscription(&id).await {
        Some(subscription) => subscription.latest(),
        None => state.hub.pipeline().latest(&id),
    };
    latest
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No samples for device: {}", id)))
}

/// Result of a refresh.
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub summary: FetchSummary,
}

/// Re-fetch history for a device.
///
/// A watched device refreshes its own window unless `range`/`since`/`until`
/// select another; unwatched devices default to the last hour.
async fn refresh(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<RefreshResponse>, AppError> {
    let id = parse_id(&id)?;
    let now = OffsetDateTime::now_utc();
    let window = params.resolve(now)?;

    let summary = match (window, state.subscription(&id).await) {
        (None, Some(subscription)) => subscription.refresh().await?,
        (window, _) => {
            let range = window.unwrap_or_else(|| RelativeRange::default().resolve(now));
            state.hub.queries().fetch_range(&id, range).await?
        }
    };
    Ok(Json(RefreshResponse {
        device_id: id,
        summary,
    }))
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Core(moldwatch_core::Error),
}

impl From<moldwatch_core::Error> for AppError {
    fn from(e: moldwatch_core::Error) -> Self {
        AppError::Core(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use moldwatch_core::Error;

        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Core(e) => {
                let status = match &e {
                    Error::Query { .. } | Error::Endpoint(_) | Error::Timeout { .. } => {
                        StatusCode::BAD_GATEWAY
                    }
                    Error::Connection { .. } | Error::NotConnected | Error::Cancelled => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    Error::Parse(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use moldwatch_core::{
        HubConfig, MockHistoryEndpoint, MockTransport, QueryOptions, RetryConfig, SourceType,
        SubscribeOptions, TelemetryHub,
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::config::Config;

    struct TestApp {
        transport: Arc<MockTransport>,
        endpoint: Arc<MockHistoryEndpoint>,
        state: Arc<AppState>,
    }

    fn create_test_app() -> TestApp {
        let transport = MockTransport::new();
        let endpoint = MockHistoryEndpoint::new();
        let hub_config = HubConfig {
            query: QueryOptions::new().retry(RetryConfig::none()),
            ..Default::default()
        };
        let hub = TelemetryHub::new(transport.clone(), endpoint.clone(), hub_config).unwrap();
        TestApp {
            transport,
            endpoint,
            state: AppState::new(hub, Config::default()),
        }
    }

    async fn request(state: &Arc<AppState>, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = router()
            .with_state(Arc::clone(state))
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        // Extractor rejections are plain text
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn millis(ts: OffsetDateTime) -> i64 {
        (ts.unix_timestamp_nanos() / 1_000_000) as i64
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app();
        let (status, json) = request(&app.state, "GET", "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_status_reports_connection_and_subscriptions() {
        let app = create_test_app();
        app.state.hub.connect().await.unwrap();
        app.state
            .watch(&DeviceId::from("press-07"), SubscribeOptions::default())
            .await
            .unwrap();

        let (status, json) = request(&app.state, "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connection"]["state"], "connected");
        assert_eq!(json["connection"]["generation"], 1);
        assert_eq!(json["subscriptions"][0]["device_id"], "press-07");
        assert_eq!(json["subscriptions"][0]["ref_count"], 1);
        assert!(json["pipeline"]["framesAccepted"].is_number());
    }

    #[tokio::test]
    async fn test_list_devices_includes_watched_and_seen() {
        let app = create_test_app();
        app.state.hub.connect().await.unwrap();
        app.state
            .watch(&DeviceId::from("b-press"), SubscribeOptions::default())
            .await
            .unwrap();
        app.state.hub.pipeline().ingest_sample(
            CanonicalSample::builder("a-press", OffsetDateTime::now_utc(), SourceType::Realtime)
                .status(2)
                .build(),
        );

        let (status, json) = request(&app.state, "GET", "/api/devices").await;
        assert_eq!(status, StatusCode::OK);
        let devices = json.as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0]["id"], "a-press");
        assert_eq!(devices[0]["state"], "production");
        assert_eq!(devices[0]["watched"], false);
        assert_eq!(devices[0]["sample_count"], 1);
        assert_eq!(devices[1]["id"], "b-press");
        assert_eq!(devices[1]["watched"], true);
        assert_eq!(devices[1]["state"], "offline");
        assert!(devices[1]["latest_timestamp"].is_null());
    }

    #[tokio::test]
    async fn test_samples_and_latest() {
        let app = create_test_app();
        app.state.hub.connect().await.unwrap();
        let mut events = app.state.hub.events();
        app.state
            .watch(&DeviceId::from("press-07"), SubscribeOptions::default())
            .await
            .unwrap();

        let now = OffsetDateTime::now_utc();
        for offset in [3, 2, 1] {
            app.transport.push_json(&json!({
                "kind": "realtime",
                "deviceId": "press-07",
                "timestamp": millis(now - time::Duration::seconds(offset)),
                "data": { "oilTemp": 40 + offset }
            }));
        }
        let mut seen = 0;
        while seen < 3 {
            if let moldwatch_core::TelemetryEvent::SamplesUpdated { .. } = events.recv().await.unwrap() {
                seen += 1;
            }
        }

        let (status, json) = request(&app.state, "GET", "/api/devices/press-07/samples").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 3);
        assert_eq!(json["samples"][0]["oilTemp"], 43.0);

        let (_, json) = request(&app.state, "GET", "/api/devices/press-07/samples?range=-1h&limit=2").await;
        assert_eq!(json["count"], 2);
        assert_eq!(json["truncated"], true);
        assert_eq!(json["samples"][1]["oilTemp"], 41.0);

        let (status, json) = request(&app.state, "GET", "/api/devices/press-07/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sourceType"], "realtime");
        assert_eq!(json["oilTemp"], 41.0);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let app = create_test_app();
        let (status, json) = request(&app.state, "GET", "/api/devices/ghost/samples").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("ghost"));

        let (status, _) = request(&app.state, "GET", "/api/devices/ghost/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_window_is_bad_request() {
        let app = create_test_app();
        let (status, _) = request(&app.state, "GET", "/api/devices/m-1/samples?since=200&until=100").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = request(&app.state, "GET", "/api/devices/m-1/samples?range=-1h&since=100").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        for range in ["-99999999999999999w", "-10000000d", "-0h"] {
            let uri = format!("/api/devices/m-1/samples?range={range}");
            let (status, _) = request(&app.state, "GET", &uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{range}");
        }
    }

    #[tokio::test]
    async fn test_refresh_fetches_history() {
        let app = create_test_app();
        let start = OffsetDateTime::UNIX_EPOCH + time::Duration::days(19_000);
        app.endpoint.set_rows(
            "m-1",
            vec![
                json!({ "timestamp": millis(start), "oilTemp": 40 }),
                json!({ "timestamp": millis(start) + 1_000, "oilTemp": 41 }),
                json!({ "oilTemp": 42 }),
            ],
        );

        let uri = format!(
            "/api/devices/m-1/refresh?since={}&until={}",
            start.unix_timestamp(),
            start.unix_timestamp() + 3_600
        );
        let (status, json) = request(&app.state, "POST", &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["device_id"], "m-1");
        assert_eq!(json["rows"], 3);
        assert_eq!(json["inserted"], 2);
        assert_eq!(json["rejected"], 1);

        let request_sent = &app.endpoint.requests()[0];
        assert_eq!(request_sent.range().start, start);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_bad_gateway() {
        let app = create_test_app();
        app.endpoint.set_always_fail(true);
        let (status, json) = request(&app.state, "POST", "/api/devices/m-1/refresh").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(json["error"].as_str().unwrap().contains("m-1"));
    }

    #[test]
    fn test_window_query_resolution() {
        let now = OffsetDateTime::UNIX_EPOCH + time::Duration::days(1);
        assert!(WindowQuery::default().resolve(now).unwrap().is_none());

        let relative = WindowQuery {
            range: Some("-30m".parse().unwrap()),
            ..Default::default()
        };
        let range = relative.resolve(now).unwrap().unwrap();
        assert_eq!(range.end, now);
        assert_eq!(range.duration(), time::Duration::minutes(30));

        let open_ended = WindowQuery {
            since: Some(3_600),
            ..Default::default()
        };
        let range = open_ended.resolve(now).unwrap().unwrap();
        assert_eq!(range.start.unix_timestamp(), 3_600);
        assert_eq!(range.end, now);
    }
}

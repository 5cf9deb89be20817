//! Historical range queries.
//!
//! The [`QueryFacade`] turns a `(device, range)` request into an endpoint
//! call, retries transient failures, normalizes the returned rows and merges
//! them through the [`Pipeline`]. Identical concurrent requests share one
//! in-flight call.
//!
//! A fetch is either *tied* to one or more consumers ([`QueryFacade::fetch_for`])
//! or *untied* ([`QueryFacade::fetch_range`]). A tied fetch is cancelled once
//! every interested consumer has released; an untied caller keeps it alive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use moldwatch_types::{DeviceId, ParseError, TimeRange};

use crate::error::{Error, Result};
use crate::messages::{HistoryRequest, HistoryResponse};
use crate::pipeline::Pipeline;
use crate::retry::{RetryConfig, with_retry};

/// Serves historical rows for a device and window.
#[async_trait]
pub trait HistoryEndpoint: Send + Sync + 'static {
    /// Run one query. Transient failures should be [`Error::Endpoint`] or
    /// [`Error::Timeout`] so they are retried.
    async fn query(&self, request: &HistoryRequest) -> Result<HistoryResponse>;
}

/// Identifies a consumer for cancellation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConsumerId(pub u64);

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

/// Options for the query facade.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Maximum rows requested per query.
    pub limit: usize,
    /// Retry policy for endpoint calls.
    pub retry: RetryConfig,
    /// Timeout for a single endpoint call.
    pub timeout: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: 5_000,
            retry: RetryConfig::for_query(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl QueryOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the row limit.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::invalid_config("limit must be > 0"));
        }
        if self.timeout.is_zero() {
            return Err(Error::invalid_config("timeout must be > 0"));
        }
        Ok(())
    }
}

/// What a completed fetch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchSummary {
    /// Rows returned by the endpoint.
    pub rows: usize,
    /// Samples written to the store.
    pub inserted: usize,
    /// Rows dropped by the normalizer.
    pub rejected: usize,
    /// Rows skipped because live data already covers their instant.
    pub skipped: usize,
}

type FetchKey = (DeviceId, OffsetDateTime, OffsetDateTime);
type SharedFetch = Shared<BoxFuture<'static, Result<FetchSummary>>>;

struct InFlight {
    id: u64,
    future: SharedFetch,
    cancel: CancellationToken,
    interested: HashSet<ConsumerId>,
    untied: bool,
}

type InFlightMap = Arc<Mutex<HashMap<FetchKey, InFlight>>>;

/// Issues, retries and coalesces historical range queries.
pub struct QueryFacade {
    endpoint: Arc<dyn HistoryEndpoint>,
    pipeline: Arc<Pipeline>,
    options: QueryOptions,
    in_flight: InFlightMap,
    next_id: AtomicU64,
}

impl std::fmt::Debug for QueryFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFacade")
            .field("options", &self.options)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl QueryFacade {
    /// Create a facade writing into `pipeline`.
    pub fn new(
        endpoint: Arc<dyn HistoryEndpoint>,
        pipeline: Arc<Pipeline>,
        options: QueryOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            endpoint,
            pipeline,
            options,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Fetch and merge a range that no consumer owns.
    ///
    /// The call runs to completion (or terminal failure) even if every
    /// consumer that joined it releases.
    pub async fn fetch_range(&self, device_id: &DeviceId, range: TimeRange) -> Result<FetchSummary> {
        self.join(device_id, range, None)?.await
    }

    /// Fetch and merge a range on behalf of `consumer`.
    ///
    /// Cancelled with [`Error::Cancelled`] once `consumer` and every other
    /// interested consumer have called [`cancel_for`](Self::cancel_for).
    pub async fn fetch_for(
        &self,
        consumer: ConsumerId,
        device_id: &DeviceId,
        range: TimeRange,
    ) -> Result<FetchSummary> {
        self.join(device_id, range, Some(consumer))?.await
    }

    /// Withdraw `consumer` from every in-flight fetch.
    ///
    /// Returns the number of fetches cancelled because nobody else wanted them.
    pub fn cancel_for(&self, consumer: ConsumerId) -> usize {
        let mut in_flight = self.lock_in_flight();
        let mut cancelled = Vec::new();
        for (key, entry) in in_flight.iter_mut() {
            if entry.interested.remove(&consumer) && entry.interested.is_empty() && !entry.untied {
                entry.cancel.cancel();
                cancelled.push(key.clone());
            }
        }
        for key in &cancelled {
            in_flight.remove(key);
            debug!("Cancelled history fetch for {} after {} released", key.0, consumer);
        }
        cancelled.len()
    }

    /// Cancel every in-flight fetch.
    pub fn cancel_all(&self) {
        let mut in_flight = self.lock_in_flight();
        for entry in in_flight.values() {
            entry.cancel.cancel();
        }
        in_flight.clear();
    }

    /// Number of distinct in-flight fetches.
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// The options in effect.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<FetchKey, InFlight>> {
        self.in_flight.lock().expect("in-flight lock poisoned")
    }

    fn join(
        &self,
        device_id: &DeviceId,
        range: TimeRange,
        consumer: Option<ConsumerId>,
    ) -> Result<SharedFetch> {
        if range.end < range.start {
            return Err(ParseError::invalid_range(
                format!("{}..{}", range.start, range.end),
                "end is before start",
            )
            .into());
        }

        let key: FetchKey = (device_id.clone(), range.start, range.end);
        let mut in_flight = self.lock_in_flight();
        if let Some(entry) = in_flight.get_mut(&key) {
            debug!("Coalescing history fetch for {}", device_id);
            match consumer {
                Some(consumer) => {
                    entry.interested.insert(consumer);
                }
                None => entry.untied = true,
            }
            return Ok(entry.future.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let future = run_fetch(
            Arc::clone(&self.endpoint),
            Arc::clone(&self.pipeline),
            self.options.clone(),
            Arc::clone(&self.in_flight),
            key.clone(),
            id,
            cancel.clone(),
        )
        .boxed()
        .shared();

        // Drive the fetch even if every awaiting caller goes away
        tokio::spawn(future.clone());

        in_flight.insert(
            key,
            InFlight {
                id,
                future: future.clone(),
                cancel,
                interested: consumer.into_iter().collect(),
                untied: consumer.is_none(),
            },
        );
        Ok(future)
    }
}

async fn run_fetch(
    endpoint: Arc<dyn HistoryEndpoint>,
    pipeline: Arc<Pipeline>,
    options: QueryOptions,
    in_flight: InFlightMap,
    key: FetchKey,
    id: u64,
    cancel: CancellationToken,
) -> Result<FetchSummary> {
    let (device_id, start, end) = key.clone();
    let request = HistoryRequest::new(&device_id, TimeRange { start, end }, options.limit);
    let attempts = AtomicU32::new(0);

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = with_retry(&options.retry, "history query", || {
            attempts.fetch_add(1, Ordering::Relaxed);
            let endpoint = Arc::clone(&endpoint);
            let request = &request;
            let timeout = options.timeout;
            async move {
                match tokio::time::timeout(timeout, endpoint.query(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout("history query", timeout)),
                }
            }
        }) => result,
    };

    {
        let mut map = in_flight.lock().expect("in-flight lock poisoned");
        if map.get(&key).is_some_and(|entry| entry.id == id) {
            map.remove(&key);
        }
    }

    match outcome {
        Ok(response) => {
            let rows = pipeline.ingest_rows(&device_id, &response.rows);
            info!(
                "History for {}: {} row(s), {} inserted, {} rejected",
                device_id, rows.rows, rows.inserted, rows.rejected
            );
            Ok(FetchSummary {
                rows: rows.rows,
                inserted: rows.inserted,
                rejected: rows.rejected,
                skipped: rows.skipped,
            })
        }
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e @ Error::Query { .. }) => {
            warn!("{}", e);
            Err(e)
        }
        Err(e) => {
            let error = Error::Query {
                device_id: device_id.to_string(),
                attempts: attempts.load(Ordering::Relaxed),
                reason: e.to_string(),
            };
            warn!("{}", error);
            Err(error)
        }
    }
}

#[cfg(feature = "http")]
pub use self::http::HttpHistoryEndpoint;

#[cfg(feature = "http")]
mod http {
    use reqwest::Client;

    use super::*;
    use crate::retry::endpoint_status_error;

    /// [`HistoryEndpoint`] speaking JSON over HTTP: `POST {base_url}/history`.
    #[derive(Debug, Clone)]
    pub struct HttpHistoryEndpoint {
        client: Client,
        base_url: String,
        token: Option<String>,
    }

    impl HttpHistoryEndpoint {
        /// Create an endpoint for a base URL such as `http://historian:8080/api`.
        pub fn new(base_url: &str) -> Result<Self> {
            let client = Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| Error::invalid_config(e.to_string()))?;
            Self::with_client(base_url, client)
        }

        /// Create an endpoint with a custom reqwest client.
        pub fn with_client(base_url: &str, client: Client) -> Result<Self> {
            let base_url = base_url.trim_end_matches('/').to_string();
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err(Error::invalid_config(format!(
                    "history URL must start with http:// or https://, got: {}",
                    base_url
                )));
            }
            Ok(Self {
                client,
                base_url,
                token: None,
            })
        }

        /// Send `Authorization: Bearer <token>` with every query.
        #[must_use]
        pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
            self.token = Some(token.into());
            self
        }

        /// The base URL.
        pub fn base_url(&self) -> &str {
            &self.base_url
        }
    }

    #[async_trait]
    impl HistoryEndpoint for HttpHistoryEndpoint {
        async fn query(&self, request: &HistoryRequest) -> Result<HistoryResponse> {
            let url = format!("{}/history", self.base_url);
            let mut builder = self.client.post(url).json(request);
            if let Some(token) = &self.token {
                builder = builder.bearer_auth(token);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| Error::Endpoint(e.to_string()))?;
            let status = response.status();
            if status.is_success() {
                return response
                    .json::<HistoryResponse>()
                    .await
                    .map_err(|e| Error::Endpoint(format!("invalid response body: {}", e)));
            }

            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| status.to_string());

            Err(endpoint_status_error(
                request.device_id.as_str(),
                status.as_u16(),
                message,
            ))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHistoryEndpoint;
    use serde_json::json;

    fn range() -> TimeRange {
        TimeRange::last(
            time::Duration::hours(1),
            OffsetDateTime::UNIX_EPOCH + time::Duration::days(1),
        )
    }

    fn facade(endpoint: &Arc<MockHistoryEndpoint>) -> (QueryFacade, Arc<Pipeline>) {
        let pipeline = Arc::new(Pipeline::default());
        let options = QueryOptions::new().retry(RetryConfig::for_query().jitter(false));
        let facade = QueryFacade::new(
            Arc::clone(endpoint) as Arc<dyn HistoryEndpoint>,
            Arc::clone(&pipeline),
            options,
        )
        .unwrap();
        (facade, pipeline)
    }

    fn rows(n: i64) -> Vec<serde_json::Value> {
        let base = range().start.unix_timestamp() * 1000;
        (0..n)
            .map(|i| json!({ "timestamp": base + i * 1000, "temperatures": { "z1": 200 + i } }))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_inserts_rows() {
        let endpoint = MockHistoryEndpoint::new();
        let mut data = rows(10);
        data.push(json!({ "timestamp": "garbage" }));
        endpoint.set_rows("m-1", data);
        let (facade, pipeline) = facade(&endpoint);

        let device = DeviceId::from("m-1");
        let summary = facade.fetch_range(&device, range()).await.unwrap();
        assert_eq!(
            summary,
            FetchSummary {
                rows: 11,
                inserted: 10,
                rejected: 1,
                skipped: 0,
            }
        );
        assert_eq!(pipeline.len(&device), 10);
        assert_eq!(facade.in_flight(), 0);

        let request = &endpoint.requests()[0];
        assert_eq!(request.range(), range());
        assert_eq!(request.limit, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let endpoint = MockHistoryEndpoint::new();
        endpoint.set_rows("m-1", rows(3));
        endpoint.fail_next(2);
        let (facade, _) = facade(&endpoint);

        let summary = facade
            .fetch_range(&DeviceId::from("m-1"), range())
            .await
            .unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(endpoint.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_query_error_after_three_attempts() {
        let endpoint = MockHistoryEndpoint::new();
        endpoint.set_always_fail(true);
        let (facade, pipeline) = facade(&endpoint);

        let err = facade
            .fetch_range(&DeviceId::from("m-1"), range())
            .await
            .unwrap_err();
        match err {
            Error::Query {
                device_id,
                attempts,
                ..
            } => {
                assert_eq!(device_id, "m-1");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(endpoint.call_count(), 3);
        assert!(pipeline.devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_fetches_are_coalesced() {
        let endpoint = MockHistoryEndpoint::new();
        endpoint.set_rows("m-1", rows(5));
        endpoint.set_latency(Duration::from_millis(200));
        let (facade, _) = facade(&endpoint);
        let device = DeviceId::from("m-1");

        let (a, b) = tokio::join!(
            facade.fetch_for(ConsumerId(1), &device, range()),
            facade.fetch_for(ConsumerId(2), &device, range()),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(endpoint.call_count(), 1);

        // A different window is a different request
        let other = TimeRange::last(time::Duration::minutes(5), range().end);
        facade.fetch_range(&device, other).await.unwrap();
        assert_eq!(endpoint.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tied_fetch_cancelled_when_last_consumer_releases() {
        let endpoint = MockHistoryEndpoint::new();
        endpoint.set_rows("m-1", rows(5));
        endpoint.set_latency(Duration::from_secs(10));
        let (facade, pipeline) = facade(&endpoint);
        let facade = Arc::new(facade);
        let device = DeviceId::from("m-1");

        let first = tokio::spawn({
            let facade = Arc::clone(&facade);
            let device = device.clone();
            async move { facade.fetch_for(ConsumerId(1), &device, range()).await }
        });
        let second = tokio::spawn({
            let facade = Arc::clone(&facade);
            let device = device.clone();
            async move { facade.fetch_for(ConsumerId(2), &device, range()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(facade.in_flight(), 1);

        // One consumer leaving keeps the shared fetch alive
        assert_eq!(facade.cancel_for(ConsumerId(1)), 0);
        assert_eq!(facade.in_flight(), 1);

        assert_eq!(facade.cancel_for(ConsumerId(2)), 1);
        assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));
        assert!(matches!(second.await.unwrap(), Err(Error::Cancelled)));
        assert!(pipeline.devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_untied_caller_keeps_fetch_alive() {
        let endpoint = MockHistoryEndpoint::new();
        endpoint.set_rows("m-1", rows(5));
        endpoint.set_latency(Duration::from_secs(1));
        let (facade, _) = facade(&endpoint);
        let device = DeviceId::from("m-1");

        let (tied, untied, cancelled) = tokio::join!(
            facade.fetch_for(ConsumerId(7), &device, range()),
            facade.fetch_range(&device, range()),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                facade.cancel_for(ConsumerId(7))
            },
        );
        assert_eq!(cancelled, 0);
        assert_eq!(tied.unwrap().inserted, 5);
        assert_eq!(untied.unwrap().inserted, 5);
        assert_eq!(endpoint.call_count(), 1);
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected() {
        let endpoint = MockHistoryEndpoint::new();
        let (facade, _) = facade(&endpoint);
        let r = range();
        let inverted = TimeRange {
            start: r.end,
            end: r.start,
        };
        assert!(matches!(
            facade.fetch_range(&DeviceId::from("m-1"), inverted).await,
            Err(Error::Parse(_))
        ));
        assert_eq!(endpoint.call_count(), 0);
    }

    #[test]
    fn test_options_validate() {
        assert!(QueryOptions::default().validate().is_ok());
        assert!(QueryOptions::new().limit(0).validate().is_err());
        assert!(QueryOptions::new().timeout(Duration::ZERO).validate().is_err());
    }
}

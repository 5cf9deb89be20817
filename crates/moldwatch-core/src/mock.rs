//! In-memory transport and history endpoint for tests.
//!
//! [`MockTransport`] stands in for the telemetry server: tests push inbound
//! frames, inspect outbound control messages, refuse connections and drop
//! the live link. [`MockHistoryEndpoint`] serves canned history rows with
//! optional latency and failure injection.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use moldwatch_core::{ChannelManager, ChannelOptions, ControlMessage, MockTransport};
//! use moldwatch_types::DeviceId;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = MockTransport::new();
//!     let channel = ChannelManager::new(transport.clone(), ChannelOptions::new()).unwrap();
//!     channel.connect().await.unwrap();
//!
//!     channel.send(&ControlMessage::subscribe(&DeviceId::from("m-1"))).unwrap();
//!     assert_eq!(transport.sent_json()[0]["action"], "subscribe");
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use moldwatch_types::DeviceId;

use crate::channel::{Transport, TransportLink};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::messages::{ControlAction, ControlMessage, HistoryRequest, HistoryResponse};
use crate::query::HistoryEndpoint;

struct ServerSide {
    to_client: mpsc::Sender<Bytes>,
    from_client: mpsc::Receiver<Bytes>,
}

/// A scripted telemetry server.
pub struct MockTransport {
    link: Mutex<Option<ServerSide>>,
    sent: Mutex<Vec<Bytes>>,
    connect_count: AtomicU32,
    remaining_failures: AtomicU32,
    refuse: AtomicBool,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connect_count", &self.connect_count())
            .field("linked", &self.is_linked())
            .finish()
    }
}

impl MockTransport {
    /// Create a transport that accepts every connection.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            link: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            connect_count: AtomicU32::new(0),
            remaining_failures: AtomicU32::new(0),
            refuse: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
        })
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.remaining_failures.store(n, Ordering::SeqCst);
    }

    /// Refuse every connection attempt until turned off.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Delay every connection attempt.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of connection attempts so far.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Whether a link is currently open.
    pub fn is_linked(&self) -> bool {
        self.link.lock().expect("mock link lock poisoned").is_some()
    }

    /// Push a frame to the client. Returns false if no link is open.
    pub fn push(&self, payload: impl Into<Bytes>) -> bool {
        let link = self.link.lock().expect("mock link lock poisoned");
        match link.as_ref() {
            Some(side) => side.to_client.try_send(payload.into()).is_ok(),
            None => false,
        }
    }

    /// Push a JSON frame to the client.
    pub fn push_json(&self, frame: &Value) -> bool {
        self.push(frame.to_string())
    }

    /// Close the link from the server side.
    pub fn drop_link(&self) {
        self.collect_sent();
        self.link.lock().expect("mock link lock poisoned").take();
    }

    /// Every frame the client has sent, across all links.
    pub fn sent(&self) -> Vec<Bytes> {
        self.collect_sent();
        self.sent.lock().expect("mock sent lock poisoned").clone()
    }

    /// Sent frames decoded as JSON (frames that are not JSON are skipped).
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .filter_map(|frame| serde_json::from_slice(frame).ok())
            .collect()
    }

    /// Sent control messages (handshakes and other frames are skipped).
    pub fn sent_control(&self) -> Vec<ControlMessage> {
        self.sent()
            .iter()
            .filter_map(|frame| serde_json::from_slice(frame).ok())
            .collect()
    }

    /// Devices a given control action was sent for, in order.
    pub fn sent_for(&self, action: ControlAction) -> Vec<DeviceId> {
        self.sent_control()
            .into_iter()
            .filter(|msg| msg.action == action)
            .map(|msg| msg.device_id)
            .collect()
    }

    /// Forget recorded frames.
    pub fn clear_sent(&self) {
        self.collect_sent();
        self.sent.lock().expect("mock sent lock poisoned").clear();
    }

    fn collect_sent(&self) {
        let mut link = self.link.lock().expect("mock link lock poisoned");
        if let Some(side) = link.as_mut() {
            let mut sent = self.sent.lock().expect("mock sent lock poisoned");
            while let Ok(frame) = side.from_client.try_recv() {
                sent.push(frame);
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<TransportLink> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);

        let latency = self.connect_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::connection(ConnectionFailureReason::Refused));
        }
        let refused = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::connection(ConnectionFailureReason::Refused));
        }

        // A new link replaces any previous one
        self.collect_sent();
        let (to_client, inbound) = mpsc::channel(256);
        let (outbound, from_client) = mpsc::channel(256);
        *self.link.lock().expect("mock link lock poisoned") = Some(ServerSide {
            to_client,
            from_client,
        });
        Ok(TransportLink { outbound, inbound })
    }

    fn describe(&self) -> String {
        "mock://telemetry".to_string()
    }
}

/// A scripted history endpoint.
pub struct MockHistoryEndpoint {
    rows: Mutex<HashMap<DeviceId, Vec<Value>>>,
    requests: Mutex<Vec<HistoryRequest>>,
    remaining_failures: AtomicU32,
    always_fail: AtomicBool,
    /// Simulated query latency in milliseconds (0 = no delay).
    latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockHistoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHistoryEndpoint")
            .field("call_count", &self.call_count())
            .finish()
    }
}

impl MockHistoryEndpoint {
    /// Create an endpoint that returns no rows.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            remaining_failures: AtomicU32::new(0),
            always_fail: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
        })
    }

    /// Rows returned for every query on `device`.
    pub fn set_rows(&self, device: impl Into<DeviceId>, rows: Vec<Value>) {
        self.rows
            .lock()
            .expect("mock rows lock poisoned")
            .insert(device.into(), rows);
    }

    /// Fail the next `n` queries with a retryable error.
    pub fn fail_next(&self, n: u32) {
        self.remaining_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every query until turned off.
    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Delay every query.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of queries received.
    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("mock requests lock poisoned").len()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<HistoryRequest> {
        self.requests
            .lock()
            .expect("mock requests lock poisoned")
            .clone()
    }
}

#[async_trait]
impl HistoryEndpoint for MockHistoryEndpoint {
    async fn query(&self, request: &HistoryRequest) -> Result<HistoryResponse> {
        self.requests
            .lock()
            .expect("mock requests lock poisoned")
            .push(request.clone());

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let injected = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.always_fail.load(Ordering::SeqCst) {
            return Err(Error::Endpoint("HTTP 503 Service Unavailable".to_string()));
        }

        let rows = self
            .rows
            .lock()
            .expect("mock rows lock poisoned")
            .get(&request.device_id)
            .cloned()
            .unwrap_or_default();
        Ok(HistoryResponse {
            rows: rows.into_iter().take(request.limit).collect(),
        })
    }
}

//! The shared live telemetry channel.
//!
//! [`ChannelManager`] owns exactly one logical duplex link no matter how many
//! consumers exist. A supervisor task opens the link through a [`Transport`],
//! dispatches inbound payloads to registered handlers in arrival order and
//! reconnects with backoff when the link drops.
//!
//! The manager does not know about devices. Re-subscribing after a reconnect
//! is the job of the [`SubscriptionRegistry`](crate::SubscriptionRegistry),
//! which watches the connection generation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use moldwatch_types::{ConnectionState, ConnectionStatus};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::messages::{AuthHandshake, ControlMessage};
use crate::reconnect::ReconnectOptions;

/// An open duplex link produced by a [`Transport`].
///
/// The link is considered closed once `inbound` yields `None`.
#[derive(Debug)]
pub struct TransportLink {
    /// Frames to the remote end.
    pub outbound: mpsc::Sender<Bytes>,
    /// Frames from the remote end.
    pub inbound: mpsc::Receiver<Bytes>,
}

/// Opens duplex links to the telemetry server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new link.
    async fn connect(&self) -> Result<TransportLink>;

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String {
        "telemetry channel".to_string()
    }
}

/// Handler invoked for every inbound payload.
pub type MessageHandler = Arc<dyn Fn(&Bytes) + Send + Sync>;

/// Handle returned by [`ChannelManager::on_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Options for the channel manager.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Reconnection policy.
    pub reconnect: ReconnectOptions,
    /// Session token sent in the `authenticate` handshake, if any.
    pub auth_token: Option<String>,
}

impl ChannelOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reconnection policy.
    #[must_use]
    pub fn reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the session token.
    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        self.reconnect.validate()?;
        if self.auth_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(Error::invalid_config("auth_token must not be blank"));
        }
        Ok(())
    }
}

struct Supervisor {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    options: ChannelOptions,
    status: watch::Sender<ConnectionStatus>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    handlers: RwLock<Vec<(HandlerId, MessageHandler)>>,
    supervisor: Mutex<Option<Supervisor>>,
    next_id: AtomicU64,
}

/// How a live link ended.
enum LinkEnd {
    Cancelled,
    Closed,
}

/// Owner of the single live telemetry link.
///
/// Cheap to clone; clones share the same link.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("transport", &self.inner.transport.describe())
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl ChannelManager {
    /// Create a manager for `transport`. Nothing is opened until [`connect`](Self::connect).
    pub fn new(transport: Arc<dyn Transport>, options: ChannelOptions) -> Result<Self> {
        options.validate()?;
        let (status, _) = watch::channel(ConnectionStatus::default());
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                options,
                status,
                outbound: Mutex::new(None),
                handlers: RwLock::new(Vec::new()),
                supervisor: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Open the link.
    ///
    /// Idempotent: returns immediately if a supervisor is already connecting,
    /// connected or waiting to retry. Otherwise awaits the outcome of the
    /// first attempt only. On failure the error is returned here and recorded
    /// in the connection status while retries continue in the background.
    pub async fn connect(&self) -> Result<()> {
        let first_attempt = {
            let mut slot = self.inner.lock_supervisor();
            if slot.is_some() {
                debug!("connect() while supervisor is running, ignoring");
                return Ok(());
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            let (first_tx, first_rx) = oneshot::channel();
            let handle = tokio::spawn(supervise(
                Arc::clone(&self.inner),
                id,
                cancel.clone(),
                first_tx,
            ));
            *slot = Some(Supervisor { id, cancel, handle });
            first_rx
        };

        first_attempt.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Close the link and stop any pending retry.
    pub async fn disconnect(&self) {
        let supervisor = self.inner.lock_supervisor().take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.handle.await
                && e.is_panic()
            {
                warn!("Channel supervisor panicked: {}", e);
            }
        }
        self.inner.clear_outbound();
        self.inner.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.last_error = None;
            status.reconnect_attempts = 0;
        });
        info!("Disconnected from {}", self.inner.transport.describe());
    }

    /// Send a control message.
    ///
    /// Never blocks. Returns [`Error::NotConnected`] while the link is down.
    pub fn send(&self, message: &ControlMessage) -> Result<()> {
        let payload = message.to_bytes().map_err(Error::transport)?;
        self.send_raw(payload)
    }

    /// Send a raw frame.
    pub fn send_raw(&self, payload: Bytes) -> Result<()> {
        let outbound = self.inner.outbound.lock().expect("outbound lock poisoned");
        let Some(sender) = outbound.as_ref() else {
            return Err(Error::NotConnected);
        };
        sender.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::connection(
                ConnectionFailureReason::Transport("outbound queue full".to_string()),
            ),
            mpsc::error::TrySendError::Closed(_) => Error::NotConnected,
        })
    }

    /// Register a handler for inbound payloads.
    ///
    /// Handlers run on the supervisor task, one after the other, in arrival
    /// order. They must not block. A handler that panics is logged and the
    /// remaining handlers still run.
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .expect("handler lock poisoned")
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write().expect("handler lock poisoned");
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Whether the link is open.
    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().is_connected()
    }

    /// Watch connection status transitions.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }
}

impl Inner {
    fn lock_supervisor(&self) -> std::sync::MutexGuard<'_, Option<Supervisor>> {
        self.supervisor.lock().expect("supervisor lock poisoned")
    }

    fn set_outbound(&self, sender: mpsc::Sender<Bytes>) {
        *self.outbound.lock().expect("outbound lock poisoned") = Some(sender);
    }

    fn clear_outbound(&self) {
        *self.outbound.lock().expect("outbound lock poisoned") = None;
    }

    fn dispatch(&self, payload: &Bytes) {
        // Snapshot so handlers may register or remove handlers themselves
        let handlers: Vec<MessageHandler> = self
            .handlers
            .read()
            .expect("handler lock poisoned")
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            // A failing handler must not take the link down with it
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                warn!("Message handler panicked on a {}-byte frame", payload.len());
            }
        }
    }

    async fn open(&self) -> Result<TransportLink> {
        let timeout = self.options.reconnect.connect_timeout;
        let link = tokio::time::timeout(timeout, self.transport.connect())
            .await
            .map_err(|_| Error::connection(ConnectionFailureReason::Timeout))??;

        if let Some(token) = &self.options.auth_token {
            let handshake = AuthHandshake::new(token).to_bytes().map_err(Error::transport)?;
            link.outbound.send(handshake).await.map_err(|_| {
                Error::connection(ConnectionFailureReason::Handshake(
                    "link closed before authentication".to_string(),
                ))
            })?;
        }
        Ok(link)
    }

    async fn run_link(&self, cancel: &CancellationToken, mut inbound: mpsc::Receiver<Bytes>) -> LinkEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LinkEnd::Cancelled,
                frame = inbound.recv() => match frame {
                    Some(payload) => self.dispatch(&payload),
                    None => return LinkEnd::Closed,
                },
            }
        }
    }
}

/// Resets the shared state when a supervisor ends, including by unwinding.
struct SupervisorExit {
    inner: Arc<Inner>,
    id: u64,
    cancel: CancellationToken,
    finished: bool,
}

impl Drop for SupervisorExit {
    fn drop(&mut self) {
        if let Ok(mut outbound) = self.inner.outbound.lock() {
            *outbound = None;
        }
        if !self.cancel.is_cancelled() {
            let aborted = !self.finished;
            self.inner.status.send_modify(|status| {
                status.state = ConnectionState::Disconnected;
                if aborted {
                    status.last_error = Some("channel supervisor stopped unexpectedly".to_string());
                }
            });
        }
        if let Ok(mut slot) = self.inner.supervisor.lock()
            && slot.as_ref().is_some_and(|s| s.id == self.id)
        {
            *slot = None;
        }
    }
}

async fn supervise(
    inner: Arc<Inner>,
    id: u64,
    cancel: CancellationToken,
    first: oneshot::Sender<Result<()>>,
) {
    let mut exit = SupervisorExit {
        inner: Arc::clone(&inner),
        id,
        cancel: cancel.clone(),
        finished: false,
    };
    let mut first = Some(first);
    let mut failures: u32 = 0;
    let reconnect = inner.options.reconnect.clone();
    let target = inner.transport.describe();

    loop {
        inner
            .status
            .send_modify(|status| status.state = ConnectionState::Connecting);

        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = inner.open() => attempt,
        };

        match attempt {
            Ok(link) => {
                failures = 0;
                inner.set_outbound(link.outbound);
                inner.status.send_modify(|status| {
                    status.state = ConnectionState::Connected;
                    status.last_error = None;
                    status.reconnect_attempts = 0;
                    status.generation += 1;
                });
                info!(
                    "Connected to {} (generation {})",
                    target,
                    inner.status.borrow().generation
                );
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }

                let end = inner.run_link(&cancel, link.inbound).await;
                inner.clear_outbound();
                match end {
                    LinkEnd::Cancelled => break,
                    LinkEnd::Closed => {
                        let reason = ConnectionFailureReason::Closed;
                        warn!("Link to {} lost: {}", target, reason);
                        inner.status.send_modify(|status| {
                            status.state = ConnectionState::Disconnected;
                            status.last_error = Some(reason.to_string());
                        });
                    }
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!("Connection attempt {} to {} failed: {}", failures, target, e);
                inner.status.send_modify(|status| {
                    status.state = ConnectionState::Disconnected;
                    status.last_error = Some(e.to_string());
                    status.reconnect_attempts = failures;
                });
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(e));
                }
                if !reconnect.allows_attempt(failures) {
                    warn!("Giving up on {} after {} attempts", target, failures);
                    break;
                }
            }
        }

        let delay = reconnect.delay_for_attempt(failures.saturating_sub(1));
        debug!("Reconnecting to {} in {:?}", target, delay);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    exit.finished = true;
}

#[cfg(feature = "websocket")]
pub use self::websocket::WebSocketTransport;

#[cfg(feature = "websocket")]
mod websocket {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    use super::*;

    /// [`Transport`] over a WebSocket connection.
    ///
    /// Text and binary frames are forwarded verbatim; outbound frames are
    /// sent as text.
    #[derive(Debug, Clone)]
    pub struct WebSocketTransport {
        url: String,
        buffer: usize,
    }

    impl WebSocketTransport {
        /// Create a transport for a `ws://` or `wss://` URL.
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                url: url.into(),
                buffer: 256,
            }
        }

        /// Set the per-direction frame buffer.
        #[must_use]
        pub fn buffer(mut self, frames: usize) -> Self {
            self.buffer = frames.max(1);
            self
        }
    }

    #[async_trait]
    impl Transport for WebSocketTransport {
        async fn connect(&self) -> Result<TransportLink> {
            let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(Error::transport)?;
            let (mut ws_write, mut ws_read) = stream.split();

            let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(self.buffer);
            let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(self.buffer);

            tokio::spawn(async move {
                while let Some(payload) = outbound_rx.recv().await {
                    let text = match String::from_utf8(payload.to_vec()) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Dropping non-UTF-8 outbound frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                        debug!("WebSocket write failed: {}", e);
                        break;
                    }
                }
                let _ = ws_write.close().await;
            });

            tokio::spawn(async move {
                while let Some(message) = ws_read.next().await {
                    let payload = match message {
                        Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
                        Ok(Message::Binary(data)) => data,
                        Ok(Message::Close(frame)) => {
                            debug!("WebSocket closed by peer: {:?}", frame);
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("WebSocket read failed: {}", e);
                            break;
                        }
                    };
                    if inbound_tx.send(payload).await.is_err() {
                        break;
                    }
                }
            });

            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }

        fn describe(&self) -> String {
            self.url.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use moldwatch_types::DeviceId;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fast_reconnect() -> ReconnectOptions {
        ReconnectOptions::fixed_delay(Duration::from_millis(100))
    }

    fn manager(transport: &Arc<MockTransport>, options: ChannelOptions) -> ChannelManager {
        ChannelManager::new(Arc::clone(transport) as Arc<dyn Transport>, options).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let transport = MockTransport::new();
        let channel = manager(&transport, ChannelOptions::new().reconnect(fast_reconnect()));

        channel.connect().await.unwrap();
        channel.connect().await.unwrap();
        assert!(channel.is_connected());
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(channel.status().generation, 1);

        channel.disconnect().await;
        assert!(!channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected() {
        let transport = MockTransport::new();
        let channel = manager(&transport, ChannelOptions::new());
        let msg = ControlMessage::subscribe(&DeviceId::from("m-1"));
        assert!(matches!(channel.send(&msg), Err(Error::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_handshake_is_first_frame() {
        let transport = MockTransport::new();
        let channel = manager(
            &transport,
            ChannelOptions::new().auth_token("s3cret").reconnect(fast_reconnect()),
        );
        channel.connect().await.unwrap();
        channel
            .send(&ControlMessage::subscribe(&DeviceId::from("m-1")))
            .unwrap();

        let sent = transport.sent_json();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["action"], "authenticate");
        assert_eq!(sent[0]["token"], "s3cret");
        assert_eq!(sent[1]["action"], "subscribe");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_failure_is_reported_and_retried() {
        let transport = MockTransport::new();
        transport.fail_next(2);
        let channel = manager(&transport, ChannelOptions::new().reconnect(fast_reconnect()));
        let mut watch = channel.watch();

        assert!(matches!(channel.connect().await, Err(Error::Connection { .. })));
        let status = channel.status();
        assert!(!status.is_connected());
        assert!(status.last_error.is_some());
        assert_eq!(status.reconnect_attempts, 1);

        watch.wait_for(ConnectionStatus::is_connected).await.unwrap();
        assert_eq!(transport.connect_count(), 3);
        let status = channel.status();
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let transport = MockTransport::new();
        transport.set_refuse(true);
        let channel = manager(
            &transport,
            ChannelOptions::new().reconnect(fast_reconnect().max_attempts(3)),
        );

        assert!(channel.connect().await.is_err());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connect_count(), 3);
        assert_eq!(channel.status().reconnect_attempts, 3);

        // The supervisor is gone, so connect() starts a fresh one
        transport.set_refuse(false);
        channel.connect().await.unwrap();
        assert!(channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_drop_with_new_generation() {
        let transport = MockTransport::new();
        let channel = manager(&transport, ChannelOptions::new().reconnect(fast_reconnect()));
        let mut watch = channel.watch();
        channel.connect().await.unwrap();

        transport.drop_link();
        watch
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();
        watch.wait_for(|s| s.generation == 2).await.unwrap();
        assert!(channel.is_connected());
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_receive_frames_in_order() {
        let transport = MockTransport::new();
        let channel = manager(&transport, ChannelOptions::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        channel.on_message(move |payload| sink.lock().unwrap().push(payload.clone()));
        let counter = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&counter);
        let second = channel.on_message(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        channel.connect().await.unwrap();
        for i in 0..5 {
            assert!(transport.push(format!("frame-{i}")));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let frames = received.lock().unwrap().clone();
        assert_eq!(
            frames,
            (0..5).map(|i| Bytes::from(format!("frame-{i}"))).collect::<Vec<_>>()
        );
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        assert!(channel.remove_handler(second));
        assert!(!channel.remove_handler(second));
        transport.push("frame-5");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(received.lock().unwrap().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_keeps_link_alive() {
        let transport = MockTransport::new();
        let channel = manager(&transport, ChannelOptions::new());
        channel.on_message(|payload| {
            if payload.as_ref() == b"boom" {
                panic!("handler failure");
            }
        });
        let delivered = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&delivered);
        channel.on_message(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        channel.connect().await.unwrap();
        assert!(transport.push("boom"));
        assert!(transport.push("fine"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert!(channel.is_connected());
        assert!(transport.push("still-fine"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 3);
    }

    /// Panics on its first connection attempt, then behaves like `inner`.
    struct FlakyTransport {
        inner: Arc<MockTransport>,
        panicked: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn connect(&self) -> Result<TransportLink> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("transport failure");
            }
            self.inner.connect().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_failure_resets_state() {
        let mock = MockTransport::new();
        let transport = Arc::new(FlakyTransport {
            inner: Arc::clone(&mock),
            panicked: std::sync::atomic::AtomicBool::new(false),
        });
        let channel = ChannelManager::new(transport, ChannelOptions::new()).unwrap();

        assert!(matches!(channel.connect().await, Err(Error::Cancelled)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = channel.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.is_some());

        // The slot was cleared, so a new supervisor starts
        channel.connect().await.unwrap();
        assert!(channel.is_connected());
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connect_times_out() {
        let transport = MockTransport::new();
        transport.set_connect_latency(Duration::from_secs(30));
        let channel = manager(
            &transport,
            ChannelOptions::new().reconnect(
                fast_reconnect()
                    .connect_timeout(Duration::from_secs(5))
                    .max_attempts(1),
            ),
        );

        let err = channel.connect().await.unwrap_err();
        assert!(err.to_string().to_lowercase().contains("timed out"), "{err}");
        assert!(!channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let transport = MockTransport::new();
        transport.set_refuse(true);
        let channel = manager(
            &transport,
            ChannelOptions::new().reconnect(ReconnectOptions::fixed_delay(Duration::from_secs(60))),
        );
        assert!(channel.connect().await.is_err());
        channel.disconnect().await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(channel.status().state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_options_validate() {
        assert!(ChannelOptions::new().validate().is_ok());
        assert!(ChannelOptions::new().auth_token("  ").validate().is_err());
        let transport: Arc<dyn Transport> = MockTransport::new();
        assert!(
            ChannelManager::new(
                transport,
                ChannelOptions::new().reconnect(ReconnectOptions::new().backoff_multiplier(0.1))
            )
            .is_err()
        );
    }
}

//! The façade UI collaborators use.
//!
//! A [`TelemetryHub`] wires the channel, registry, pipeline and query facade
//! together. Each consumer calls [`TelemetryHub::subscribe`] and gets a
//! [`DeviceSubscription`]: a live-updating, merged view of one device plus
//! connection and health metadata. Dropping the subscription releases it.
//!
//! # Example
//!
//! ```
//! use moldwatch_core::{
//!     HubConfig, MockHistoryEndpoint, MockTransport, SubscribeOptions, TelemetryHub,
//! };
//! use moldwatch_types::DeviceId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), moldwatch_core::Error> {
//!     let hub = TelemetryHub::new(MockTransport::new(), MockHistoryEndpoint::new(), HubConfig::default())?;
//!     hub.connect().await?;
//!
//!     let press = hub.subscribe(&DeviceId::from("press-07"), SubscribeOptions::default())?;
//!     assert!(press.is_connected());
//!     println!("{} samples, state {}", press.samples().len(), press.machine_state());
//!
//!     hub.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use moldwatch_types::{
    CanonicalSample, ConnectionStatus, DeviceId, MachineState, RelativeRange, SourceType, TimeRange,
};

use crate::channel::{ChannelManager, ChannelOptions, HandlerId, Transport};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, TelemetryEvent};
use crate::pipeline::Pipeline;
use crate::query::{ConsumerId, FetchSummary, HistoryEndpoint, QueryFacade, QueryOptions};
use crate::registry::SubscriptionRegistry;
use crate::series::RetentionPolicy;

/// Configuration for a [`TelemetryHub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Live channel options.
    pub channel: ChannelOptions,
    /// History query options.
    pub query: QueryOptions,
    /// Per-device retention.
    pub retention: RetentionPolicy,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel: ChannelOptions::default(),
            query: QueryOptions::default(),
            retention: RetentionPolicy::default(),
            event_capacity: 1024,
        }
    }
}

impl HubConfig {
    /// Validate every nested option.
    pub fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        self.query.validate()?;
        self.retention.validate()?;
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Per-consumer subscription options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeOptions {
    /// Acquire and backfill immediately; otherwise wait for [`DeviceSubscription::start`].
    pub auto_subscribe: bool,
    /// Backfill window, relative to now.
    pub historical_range: RelativeRange,
    /// Include realtime samples.
    pub enable_realtime: bool,
    /// Include SPC samples.
    pub enable_spc: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            historical_range: RelativeRange::default(),
            enable_realtime: true,
            enable_spc: true,
        }
    }
}

impl SubscribeOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to start immediately.
    #[must_use]
    pub fn auto_subscribe(mut self, enabled: bool) -> Self {
        self.auto_subscribe = enabled;
        self
    }

    /// Set the backfill window.
    #[must_use]
    pub fn historical_range(mut self, range: RelativeRange) -> Self {
        self.historical_range = range;
        self
    }

    /// Include or exclude realtime samples.
    #[must_use]
    pub fn enable_realtime(mut self, enabled: bool) -> Self {
        self.enable_realtime = enabled;
        self
    }

    /// Include or exclude SPC samples.
    #[must_use]
    pub fn enable_spc(mut self, enabled: bool) -> Self {
        self.enable_spc = enabled;
        self
    }

    /// Whether a live channel subscription is needed at all.
    pub fn wants_live(&self) -> bool {
        self.enable_realtime || self.enable_spc
    }

    fn includes(&self, source: SourceType) -> bool {
        match source {
            SourceType::Historical => true,
            SourceType::Realtime => self.enable_realtime,
            SourceType::Spc => self.enable_spc,
        }
    }
}

struct HubInner {
    channel: ChannelManager,
    registry: Arc<SubscriptionRegistry>,
    pipeline: Arc<Pipeline>,
    queries: QueryFacade,
    events: EventDispatcher,
    handler: HandlerId,
    bridge: CancellationToken,
    next_consumer: AtomicU64,
    shut_down: AtomicBool,
}

/// Entry point of the telemetry core.
///
/// Cheap to clone; clones share the same channel and store.
#[derive(Clone)]
pub struct TelemetryHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for TelemetryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryHub")
            .field("channel", &self.inner.channel)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl TelemetryHub {
    /// Wire a hub to a transport and a history endpoint.
    ///
    /// Must be called within a tokio runtime. Nothing is opened until
    /// [`connect`](Self::connect).
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: Arc<dyn HistoryEndpoint>,
        config: HubConfig,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventDispatcher::new(config.event_capacity);
        let pipeline = Arc::new(Pipeline::new(config.retention, events.clone()));
        let channel = ChannelManager::new(transport, config.channel)?;
        let queries = QueryFacade::new(endpoint, Arc::clone(&pipeline), config.query)?;

        let handler = {
            let pipeline = Arc::clone(&pipeline);
            channel.on_message(move |payload| {
                // Rejections are logged and counted by the pipeline
                let _ = pipeline.ingest_frame(payload);
            })
        };

        let registry = SubscriptionRegistry::new(channel.clone());
        registry.start();

        let bridge = CancellationToken::new();
        tokio::spawn(forward_connection_events(
            channel.clone(),
            events.clone(),
            bridge.clone(),
        ));

        Ok(Self {
            inner: Arc::new(HubInner {
                channel,
                registry,
                pipeline,
                queries,
                events,
                handler,
                bridge,
                next_consumer: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Open the live channel. See [`ChannelManager::connect`].
    pub async fn connect(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        self.inner.channel.connect().await
    }

    /// Declare interest in a device.
    ///
    /// With `auto_subscribe` the live subscription is acquired and the
    /// backfill for `historical_range` starts in the background right away.
    pub fn subscribe(
        &self,
        device_id: &DeviceId,
        options: SubscribeOptions,
    ) -> Result<DeviceSubscription> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let consumer = ConsumerId(self.inner.next_consumer.fetch_add(1, Ordering::Relaxed));
        debug!("{} subscribing to {}", consumer, device_id);

        let subscription = DeviceSubscription {
            hub: Arc::clone(&self.inner),
            consumer,
            device_id: device_id.clone(),
            window: Mutex::new(Window::Relative(options.historical_range)),
            state: Arc::new(Mutex::new(ConsumerState::default())),
            events: self.inner.events.subscribe(),
            options,
        };
        if subscription.options.auto_subscribe {
            subscription.start()?;
        }
        Ok(subscription)
    }

    /// Current connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.channel.status()
    }

    /// The shared channel.
    pub fn channel(&self) -> &ChannelManager {
        &self.inner.channel
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    /// The ingestion pipeline (store and status).
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }

    /// The query facade.
    pub fn queries(&self) -> &QueryFacade {
        &self.inner.queries
    }

    /// Subscribe to every event the core publishes.
    pub fn events(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// Tear everything down: disconnect, stop the registry watcher, cancel
    /// in-flight queries and clear the registry. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down telemetry hub");
        self.inner.registry.stop().await;
        self.inner.channel.disconnect().await;
        self.inner.queries.cancel_all();
        self.inner.registry.clear();
        self.inner.channel.remove_handler(self.inner.handler);
        self.inner.bridge.cancel();
    }
}

async fn forward_connection_events(
    channel: ChannelManager,
    events: EventDispatcher,
    cancel: CancellationToken,
) {
    let mut rx = channel.watch();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let status = rx.borrow_and_update().clone();
        events.send(TelemetryEvent::Connection(status));
    }
}

/// The window a consumer is looking at.
#[derive(Debug, Clone, Copy)]
enum Window {
    Relative(RelativeRange),
    Absolute(TimeRange),
}

impl Window {
    /// Resolve against now. Relative windows are aligned to whole seconds so
    /// that consumers asking within the same second share one backfill.
    fn resolve(&self) -> TimeRange {
        match self {
            Window::Relative(relative) => {
                let now = OffsetDateTime::now_utc();
                let aligned = now - time::Duration::nanoseconds(i64::from(now.nanosecond()));
                relative.resolve(aligned)
            }
            Window::Absolute(range) => *range,
        }
    }
}

#[derive(Debug, Default)]
struct ConsumerState {
    started: bool,
    released: bool,
    live_acquired: bool,
    error: Option<Error>,
    backfill: Option<JoinHandle<()>>,
}

/// One consumer's view of one device.
pub struct DeviceSubscription {
    hub: Arc<HubInner>,
    consumer: ConsumerId,
    device_id: DeviceId,
    options: SubscribeOptions,
    window: Mutex<Window>,
    state: Arc<Mutex<ConsumerState>>,
    events: broadcast::Receiver<TelemetryEvent>,
}

impl std::fmt::Debug for DeviceSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSubscription")
            .field("consumer", &self.consumer)
            .field("device_id", &self.device_id)
            .field("options", &self.options)
            .finish()
    }
}

impl DeviceSubscription {
    /// The device being watched.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// This consumer's identifier.
    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer
    }

    /// The options this subscription was created with.
    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    /// Acquire the live subscription and start the backfill. Idempotent.
    ///
    /// Only needed when `auto_subscribe` is off.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.started || state.released {
                return Ok(());
            }
            state.started = true;
            if self.options.wants_live() {
                // The reference is held even if the subscribe was rejected
                state.live_acquired = true;
                if let Err(e) = self.hub.registry.acquire(&self.device_id) {
                    state.error = Some(e.clone());
                    return Err(e);
                }
            }
        }

        let range = self.lock_window().resolve();
        self.hub.registry.note_range(&self.device_id, range);
        let handle = tokio::spawn(backfill(
            Arc::clone(&self.hub),
            self.consumer,
            self.device_id.clone(),
            range,
            Arc::clone(&self.state),
        ));
        self.lock_state().backfill = Some(handle);
        Ok(())
    }

    /// Ascending samples inside the current window, filtered by the enabled
    /// sources.
    pub fn samples(&self) -> Vec<Arc<CanonicalSample>> {
        let window = *self.lock_window();
        let mut samples = match window {
            Window::Absolute(range) => self.hub.pipeline.read(&self.device_id, Some(&range)),
            Window::Relative(_) => {
                // Open-ended so live samples stamped slightly ahead are kept
                let start = window.resolve().start;
                let mut all = self.hub.pipeline.read(&self.device_id, None);
                all.retain(|s| s.timestamp >= start);
                all
            }
        };
        if !(self.options.enable_realtime && self.options.enable_spc) {
            samples.retain(|s| self.options.includes(s.source_type));
        }
        samples
    }

    /// Newest sample of an enabled source.
    pub fn latest(&self) -> Option<Arc<CanonicalSample>> {
        if self.options.enable_realtime && self.options.enable_spc {
            return self.hub.pipeline.latest(&self.device_id);
        }
        self.hub
            .pipeline
            .read(&self.device_id, None)
            .into_iter()
            .rev()
            .find(|s| self.options.includes(s.source_type))
    }

    /// Whether the shared channel is up.
    pub fn is_connected(&self) -> bool {
        self.hub.channel.is_connected()
    }

    /// The most relevant error: this consumer's last subscription or query
    /// failure, otherwise the channel's last connection error.
    pub fn error(&self) -> Option<String> {
        if let Some(error) = &self.lock_state().error {
            return Some(error.to_string());
        }
        self.hub.channel.status().last_error
    }

    /// Derived operational state of the device.
    pub fn machine_state(&self) -> MachineState {
        self.hub.pipeline.machine_state(&self.device_id)
    }

    /// Time since the newest sample's source timestamp.
    ///
    /// `None` when nothing has been received yet. Samples stamped in the
    /// future count as fresh.
    pub fn data_age(&self) -> Option<Duration> {
        let latest = self.latest()?;
        let age = OffsetDateTime::now_utc() - latest.timestamp;
        Some(age.try_into().unwrap_or(Duration::ZERO))
    }

    /// Re-fetch the current window.
    pub async fn refresh(&self) -> Result<FetchSummary> {
        let range = self.lock_window().resolve();
        self.fetch(range).await
    }

    /// Switch to an absolute window and fetch it.
    pub async fn request_range(&self, range: TimeRange) -> Result<FetchSummary> {
        *self.lock_window() = Window::Absolute(range);
        self.hub.registry.note_range(&self.device_id, range);
        self.fetch(range).await
    }

    /// Wait for the next event concerning this device (or the channel).
    ///
    /// Returns [`Error::Cancelled`] once the hub has shut down.
    pub async fn changed(&mut self) -> Result<TelemetryEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.concerns(&self.device_id) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("{} lagged by {} event(s)", self.consumer, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Cancelled),
            }
        }
    }

    /// Release the live subscription and cancel fetches only this consumer
    /// wanted. Idempotent; also runs on drop.
    pub fn release(&self) {
        let (live, backfill) = {
            let mut state = self.lock_state();
            if state.released {
                return;
            }
            state.released = true;
            (std::mem::take(&mut state.live_acquired), state.backfill.take())
        };
        if live {
            self.hub.registry.release(&self.device_id);
        }
        let cancelled = self.hub.queries.cancel_for(self.consumer);
        if let Some(handle) = backfill
            && cancelled > 0
        {
            handle.abort();
        }
        debug!("{} released {}", self.consumer, self.device_id);
    }

    async fn fetch(&self, range: TimeRange) -> Result<FetchSummary> {
        if self.lock_state().released {
            return Err(Error::Cancelled);
        }
        let result = self
            .hub
            .queries
            .fetch_for(self.consumer, &self.device_id, range)
            .await;
        record_outcome(&self.state, &result);
        result
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConsumerState> {
        self.state.lock().expect("consumer state lock poisoned")
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().expect("consumer window lock poisoned")
    }
}

impl Drop for DeviceSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

async fn backfill(
    hub: Arc<HubInner>,
    consumer: ConsumerId,
    device_id: DeviceId,
    range: TimeRange,
    state: Arc<Mutex<ConsumerState>>,
) {
    let result = hub.queries.fetch_for(consumer, &device_id, range).await;
    if let Err(e) = &result
        && !matches!(e, Error::Cancelled)
    {
        warn!("Backfill for {} failed: {}", device_id, e);
    }
    record_outcome(&state, &result);
}

fn record_outcome(state: &Mutex<ConsumerState>, result: &Result<FetchSummary>) {
    let mut state = state.lock().expect("consumer state lock poisoned");
    match result {
        Ok(_) => state.error = None,
        Err(Error::Cancelled) => {}
        Err(e) => state.error = Some(e.clone()),
    }
}

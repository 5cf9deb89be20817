//! Ref-counted device subscriptions over the shared channel.
//!
//! The registry is the only place that sends `subscribe`/`unsubscribe`. The
//! first acquirer of a device triggers `subscribe` + `requestStatus`; the
//! last release triggers `unsubscribe`. Ref-count changes and the resulting
//! control messages happen under a single lock, so an acquire and a release
//! racing in the same tick never produce a flicker on the wire.
//!
//! A watcher task follows the channel's connection generation and re-sends
//! `subscribe` for every held device after each successful (re)connect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use moldwatch_types::{ConnectionStatus, DeviceId, TimeRange};

use crate::channel::ChannelManager;
use crate::error::{Error, Result};
use crate::messages::ControlMessage;

/// Interest in one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    /// The device.
    pub device_id: DeviceId,
    /// Number of holders.
    pub ref_count: usize,
    /// Whether a `subscribe` went out on the current link.
    pub live_active: bool,
    /// Most recent window a holder asked history for.
    pub last_requested_range: Option<TimeRange>,
}

impl SubscriptionRecord {
    fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            ref_count: 0,
            live_active: false,
            last_requested_range: None,
        }
    }
}

struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks which devices the application cares about.
pub struct SubscriptionRegistry {
    channel: ChannelManager,
    records: Mutex<HashMap<DeviceId, SubscriptionRecord>>,
    watcher: Mutex<Option<Watcher>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("records", &self.records())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create a registry issuing control messages over `channel`.
    ///
    /// Call [`start`](Self::start) to enable re-subscription on reconnect.
    pub fn new(channel: ChannelManager) -> Arc<Self> {
        Arc::new(Self {
            channel,
            records: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Take a reference on `device_id`.
    ///
    /// The first reference sends `subscribe` then `requestStatus`. While the
    /// channel is down the record is kept inactive and subscribed on the next
    /// connect. If the channel is up but rejects the message, the reference
    /// is still held and a [`Error::Subscription`] is returned.
    pub fn acquire(&self, device_id: &DeviceId) -> Result<()> {
        let mut records = self.lock_records();
        let record = records
            .entry(device_id.clone())
            .or_insert_with(|| SubscriptionRecord::new(device_id.clone()));
        record.ref_count += 1;
        if record.ref_count > 1 {
            debug!("{} now held {} times", device_id, record.ref_count);
            return Ok(());
        }

        if !self.channel.is_connected() {
            debug!("Deferring subscribe for {} until connected", device_id);
            record.live_active = false;
            return Ok(());
        }

        match self.channel.send(&ControlMessage::subscribe(device_id)) {
            Ok(()) => {
                record.live_active = true;
                info!("Subscribed to {}", device_id);
                if let Err(e) = self.channel.send(&ControlMessage::request_status(device_id)) {
                    warn!("Status request for {} failed: {}", device_id, e);
                }
                Ok(())
            }
            Err(Error::NotConnected) => {
                // Lost the link in between; the watcher subscribes on reconnect
                record.live_active = false;
                Ok(())
            }
            Err(e) => {
                record.live_active = false;
                warn!("Subscribe for {} failed: {}", device_id, e);
                Err(Error::subscription(device_id.as_str(), e.to_string()))
            }
        }
    }

    /// Drop a reference on `device_id`.
    ///
    /// The last release removes the record and sends `unsubscribe` on a
    /// best-effort basis. Returns false if the device was not held.
    pub fn release(&self, device_id: &DeviceId) -> bool {
        let mut records = self.lock_records();
        let Some(record) = records.get_mut(device_id) else {
            debug!("Release of {} which is not held", device_id);
            return false;
        };
        record.ref_count = record.ref_count.saturating_sub(1);
        if record.ref_count > 0 {
            return true;
        }

        let live = record.live_active;
        records.remove(device_id);
        if live {
            match self.channel.send(&ControlMessage::unsubscribe(device_id)) {
                Ok(()) => info!("Unsubscribed from {}", device_id),
                Err(e) => debug!("Unsubscribe for {} not sent: {}", device_id, e),
            }
        }
        true
    }

    /// Remember the last history window requested for `device_id`.
    pub fn note_range(&self, device_id: &DeviceId, range: TimeRange) {
        if let Some(record) = self.lock_records().get_mut(device_id) {
            record.last_requested_range = Some(range);
        }
    }

    /// Re-send `subscribe` for every held device.
    ///
    /// Returns the number of subscribes sent.
    pub fn resubscribe_all(&self) -> usize {
        let mut records = self.lock_records();
        let mut sent = 0;
        for record in records.values_mut().filter(|r| r.ref_count > 0) {
            match self.channel.send(&ControlMessage::subscribe(&record.device_id)) {
                Ok(()) => {
                    record.live_active = true;
                    sent += 1;
                }
                Err(e) => {
                    record.live_active = false;
                    warn!("Re-subscribe for {} failed: {}", record.device_id, e);
                }
            }
        }
        if sent > 0 {
            info!("Re-subscribed {} device(s)", sent);
        }
        sent
    }

    /// Mark every record inactive after the link dropped.
    fn mark_inactive(&self) {
        for record in self.lock_records().values_mut() {
            record.live_active = false;
        }
    }

    /// Snapshot of one record.
    pub fn record(&self, device_id: &DeviceId) -> Option<SubscriptionRecord> {
        self.lock_records().get(device_id).cloned()
    }

    /// Current ref-count of a device (0 if not held).
    pub fn ref_count(&self, device_id: &DeviceId) -> usize {
        self.lock_records()
            .get(device_id)
            .map(|r| r.ref_count)
            .unwrap_or(0)
    }

    /// Snapshot of every record, ordered by device.
    pub fn records(&self) -> Vec<SubscriptionRecord> {
        let mut records: Vec<_> = self.lock_records().values().cloned().collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }

    /// Drop every record without touching the network.
    pub fn clear(&self) {
        self.lock_records().clear();
    }

    /// Start following connection transitions. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.watcher.lock().expect("watcher lock poisoned");
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let rx = self.channel.watch();
        let handle = tokio::spawn(watch_connection(Arc::downgrade(self), rx, cancel.clone()));
        *slot = Some(Watcher { cancel, handle });
    }

    /// Stop following connection transitions.
    pub async fn stop(&self) {
        let watcher = self.watcher.lock().expect("watcher lock poisoned").take();
        if let Some(watcher) = watcher {
            watcher.cancel.cancel();
            let _ = watcher.handle.await;
        }
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceId, SubscriptionRecord>> {
        self.records.lock().expect("registry lock poisoned")
    }
}

async fn watch_connection(
    registry: Weak<SubscriptionRegistry>,
    mut rx: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
) {
    // Generations reached before start() are covered by acquire() itself
    let mut seen_generation = rx.borrow_and_update().generation;

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
        let Some(registry) = registry.upgrade() else {
            break;
        };
        if status.is_connected() {
            if status.generation != seen_generation {
                seen_generation = status.generation;
                debug!("Connection generation {}, re-subscribing", seen_generation);
                registry.resubscribe_all();
            }
        } else {
            registry.mark_inactive();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelOptions, Transport};
    use crate::messages::ControlAction;
    use crate::mock::MockTransport;
    use crate::reconnect::ReconnectOptions;
    use std::time::Duration;

    fn setup() -> (Arc<MockTransport>, ChannelManager, Arc<SubscriptionRegistry>) {
        let transport = MockTransport::new();
        let channel = ChannelManager::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            ChannelOptions::new()
                .reconnect(ReconnectOptions::fixed_delay(Duration::from_millis(100))),
        )
        .unwrap();
        let registry = SubscriptionRegistry::new(channel.clone());
        registry.start();
        (transport, channel, registry)
    }

    fn id(s: &str) -> DeviceId {
        DeviceId::from(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_release_sends_once() {
        let (transport, channel, registry) = setup();
        channel.connect().await.unwrap();

        registry.acquire(&id("a")).unwrap();
        registry.acquire(&id("a")).unwrap();
        assert_eq!(registry.ref_count(&id("a")), 2);
        assert!(registry.release(&id("a")));
        assert!(registry.release(&id("a")));
        assert_eq!(registry.ref_count(&id("a")), 0);
        assert!(registry.record(&id("a")).is_none());

        assert_eq!(transport.sent_for(ControlAction::Subscribe), vec![id("a")]);
        assert_eq!(transport.sent_for(ControlAction::RequestStatus), vec![id("a")]);
        assert_eq!(transport.sent_for(ControlAction::Unsubscribe), vec![id("a")]);

        // Subscribe must precede the status request
        let actions: Vec<_> = transport.sent_control().iter().map(|m| m.action).collect();
        assert_eq!(
            actions,
            vec![
                ControlAction::Subscribe,
                ControlAction::RequestStatus,
                ControlAction::Unsubscribe
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_unknown_is_noop() {
        let (transport, _channel, registry) = setup();
        assert!(!registry.release(&id("ghost")));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_while_disconnected_subscribes_on_connect() {
        let (transport, channel, registry) = setup();
        registry.acquire(&id("a")).unwrap();
        let record = registry.record(&id("a")).unwrap();
        assert!(!record.live_active);
        assert_eq!(record.ref_count, 1);

        let mut watch = channel.watch();
        channel.connect().await.unwrap();
        watch.wait_for(|s| s.is_connected()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(transport.sent_for(ControlAction::Subscribe), vec![id("a")]);
        assert!(registry.record(&id("a")).unwrap().live_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resubscribes_only_held_devices() {
        let (transport, channel, registry) = setup();
        channel.connect().await.unwrap();
        for device in ["a", "b", "c"] {
            registry.acquire(&id(device)).unwrap();
        }
        transport.clear_sent();

        let mut watch = channel.watch();
        transport.set_refuse(true);
        transport.drop_link();
        watch.wait_for(|s| !s.is_connected()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(registry.records().iter().all(|r| !r.live_active));

        // Released while down: nothing to unsubscribe, nothing to resubscribe
        registry.release(&id("c"));

        transport.set_refuse(false);
        watch.wait_for(|s| s.generation == 2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut resubscribed = transport.sent_for(ControlAction::Subscribe);
        resubscribed.sort();
        assert_eq!(resubscribed, vec![id("a"), id("b")]);
        assert!(transport.sent_for(ControlAction::Unsubscribe).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_note_range_and_clear() {
        let (_transport, _channel, registry) = setup();
        let range = TimeRange::last(time::Duration::hours(1), time::OffsetDateTime::UNIX_EPOCH);
        registry.note_range(&id("a"), range);
        assert!(registry.record(&id("a")).is_none());

        registry.acquire(&id("a")).unwrap();
        registry.note_range(&id("a"), range);
        assert_eq!(registry.record(&id("a")).unwrap().last_requested_range, Some(range));

        registry.clear();
        assert!(registry.records().is_empty());
        registry.stop().await;
    }
}

//! Application state shared across handlers.
//!
//! The service owns one [`TelemetryHub`] and one [`DeviceSubscription`] per
//! watched device. Handlers read the merged series through the hub's
//! pipeline; WebSocket clients follow the hub's event broadcast.
//!
//! Event delivery never blocks ingestion: if a WebSocket client falls more
//! than `server.broadcast_buffer` events behind, it skips the oldest ones.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{info, warn};

use moldwatch_core::{DeviceSubscription, SubscribeOptions, TelemetryHub};
use moldwatch_types::DeviceId;

use crate::config::Config;

/// Shared application state.
pub struct AppState {
    /// The telemetry core.
    pub hub: TelemetryHub,
    /// Configuration the service was started with.
    pub config: Config,
    /// Subscriptions held by the service, keyed by device.
    subscriptions: RwLock<HashMap<DeviceId, Arc<DeviceSubscription>>>,
    /// Aliases from the configuration.
    aliases: HashMap<DeviceId, String>,
    started_at: OffsetDateTime,
}

impl AppState {
    /// Create new application state.
    pub fn new(hub: TelemetryHub, config: Config) -> Arc<Self> {
        let aliases = config
            .devices
            .iter()
            .filter_map(|d| Some((d.device_id().ok()?, d.alias.clone()?)))
            .collect();
        Arc::new(Self {
            hub,
            config,
            subscriptions: RwLock::new(HashMap::new()),
            aliases,
            started_at: OffsetDateTime::now_utc(),
        })
    }

    /// Subscribe to every device in the configuration.
    ///
    /// Invalid entries are skipped with a warning. Returns the number watched.
    pub async fn watch_configured(&self) -> usize {
        let mut watched = 0;
        for device in &self.config.devices {
            let id = match device.device_id() {
                Ok(id) => id,
                Err(e) => {
                    warn!("Skipping configured device: {}", e);
                    continue;
                }
            };
            match self.watch(&id, device.subscribe_options()).await {
                Ok(_) => watched += 1,
                Err(e) => warn!("Failed to watch {}: {}", id, e),
            }
        }
        watched
    }

    /// Hold a subscription on `device_id`.
    ///
    /// Returns false if the device was already watched.
    pub async fn watch(
        &self,
        device_id: &DeviceId,
        options: SubscribeOptions,
    ) -> moldwatch_core::Result<bool> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(device_id) {
            return Ok(false);
        }
        let subscription = self.hub.subscribe(device_id, options)?;
        subscriptions.insert(device_id.clone(), Arc::new(subscription));
        info!("Watching {}", device_id);
        Ok(true)
    }

    /// The service's subscription on `device_id`, if watched.
    pub async fn subscription(&self, device_id: &DeviceId) -> Option<Arc<DeviceSubscription>> {
        self.subscriptions.read().await.get(device_id).cloned()
    }

    /// Devices the service is watching, sorted.
    pub async fn watched(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.subscriptions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every device that is watched or has data, sorted.
    pub async fn known_devices(&self) -> Vec<DeviceId> {
        let mut ids = self.watched().await;
        ids.extend(self.hub.pipeline().devices());
        ids.sort();
        ids.dedup();
        ids
    }

    /// Configured alias of a device.
    pub fn alias(&self, device_id: &DeviceId) -> Option<&str> {
        self.aliases.get(device_id).map(String::as_str)
    }

    /// When the service started.
    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    /// Release every subscription and shut the hub down.
    pub async fn shutdown(&self) {
        let released: Vec<_> = self.subscriptions.write().await.drain().collect();
        for (_, subscription) in &released {
            subscription.release();
        }
        self.hub.shutdown().await;
        info!("Released {} subscription(s)", released.len());
    }
}

//! The single write path into the series store.
//!
//! Both the channel dispatcher (live frames) and the query facade (history
//! rows) feed the same [`Pipeline`], so writes for a device are serialized by
//! one lock and ordered by normalization order. Locks are held only for the
//! synchronous insert or read and are released before events are published.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use moldwatch_types::{CanonicalSample, DeviceId, MachineState, TimeRange};

use crate::error::NormalizationError;
use crate::events::{EventDispatcher, TelemetryEvent};
use crate::normalize::{Normalized, Normalizer};
use crate::series::{BatchOutcome, InsertOutcome, RetentionPolicy, SeriesStore};
use crate::status::{DeviceStatus, StatusChange, StatusTracker};

/// What a single ingested frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A live sample was merged.
    Sample(InsertOutcome),
    /// A pushed historical batch was merged.
    Batch {
        /// Store counters for the batch.
        outcome: BatchOutcome,
        /// Rows dropped by the normalizer.
        rejected: usize,
    },
    /// A status frame was applied.
    Status(Option<StatusChange>),
    /// An alert was fanned out.
    Alert,
}

/// Result of ingesting history rows for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowsOutcome {
    /// Rows received.
    pub rows: usize,
    /// Samples written (new or superseding).
    pub inserted: usize,
    /// Rows dropped by the normalizer.
    pub rejected: usize,
    /// Rows skipped because live data covers their instant.
    pub skipped: usize,
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    /// Frames accepted from the channel.
    pub frames_accepted: u64,
    /// Frames rejected by the normalizer.
    pub frames_rejected: u64,
    /// History rows accepted.
    pub rows_accepted: u64,
    /// History rows rejected by the normalizer.
    pub rows_rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_accepted: AtomicU64,
    frames_rejected: AtomicU64,
    rows_accepted: AtomicU64,
    rows_rejected: AtomicU64,
}

/// Normalizer, series store and status tracker behind one write path.
#[derive(Debug)]
pub struct Pipeline {
    normalizer: Normalizer,
    store: Mutex<SeriesStore>,
    status: Mutex<StatusTracker>,
    events: EventDispatcher,
    counters: Counters,
}

impl Pipeline {
    /// Create a pipeline publishing on `events`.
    pub fn new(policy: RetentionPolicy, events: EventDispatcher) -> Self {
        Self {
            normalizer: Normalizer::new(),
            store: Mutex::new(SeriesStore::with_policy(policy)),
            status: Mutex::new(StatusTracker::new()),
            events,
            counters: Counters::default(),
        }
    }

    /// The event dispatcher this pipeline publishes on.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Normalize and merge one channel payload.
    ///
    /// Rejected frames are logged and counted; the error is returned for
    /// callers that want to inspect it but must not be surfaced to consumers.
    pub fn ingest_frame(&self, payload: &[u8]) -> Result<IngestOutcome, NormalizationError> {
        let normalized = match self.normalizer.normalize_bytes(payload) {
            Ok(normalized) => normalized,
            Err(e) => {
                self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping frame: {}", e);
                return Err(e);
            }
        };
        self.counters.frames_accepted.fetch_add(1, Ordering::Relaxed);
        debug!("Ingesting frame for {}", normalized.device_id());

        let outcome = match normalized {
            Normalized::Sample(sample) => IngestOutcome::Sample(self.ingest_sample(sample)),
            Normalized::Batch {
                device_id,
                samples,
                rejected,
            } => {
                if rejected > 0 {
                    warn!("Dropped {} malformed row(s) in batch for {}", rejected, device_id);
                }
                IngestOutcome::Batch {
                    outcome: self.ingest_samples(&device_id, samples),
                    rejected,
                }
            }
            Normalized::Status(update) => {
                let change = self.lock_status().apply_update(&update);
                if let Some(change) = &change {
                    self.publish_status(change.clone());
                }
                IngestOutcome::Status(change)
            }
            Normalized::Alert(notice) => {
                self.events.send(TelemetryEvent::Alert(notice));
                IngestOutcome::Alert
            }
        };
        Ok(outcome)
    }

    /// Normalize and merge history rows returned for `device_id`.
    pub fn ingest_rows(&self, device_id: &DeviceId, rows: &[Value]) -> RowsOutcome {
        let batch = self.normalizer.normalize_rows(device_id, rows);
        self.counters
            .rows_accepted
            .fetch_add(batch.samples.len() as u64, Ordering::Relaxed);
        self.counters
            .rows_rejected
            .fetch_add(batch.rejected as u64, Ordering::Relaxed);
        if batch.rejected > 0 {
            warn!(
                "Dropped {} of {} history row(s) for {}",
                batch.rejected,
                rows.len(),
                device_id
            );
        }

        let outcome = self.ingest_samples(device_id, batch.samples);
        RowsOutcome {
            rows: rows.len(),
            inserted: outcome.written(),
            rejected: batch.rejected,
            skipped: outcome.skipped,
        }
    }

    /// Merge one already-normalized sample.
    pub fn ingest_sample(&self, sample: CanonicalSample) -> InsertOutcome {
        let device_id = sample.device_id.clone();
        let status_change = self.lock_status().apply_sample(&sample);
        let (outcome, latest) = {
            let mut store = self.lock_store();
            let outcome = store.insert(sample);
            (outcome, store.latest(&device_id))
        };

        if outcome.changed() {
            self.events.send(TelemetryEvent::SamplesUpdated {
                device_id,
                inserted: 1,
                latest,
            });
        }
        if let Some(change) = status_change {
            self.publish_status(change);
        }
        outcome
    }

    /// Merge already-normalized samples for one device.
    pub fn ingest_samples(&self, device_id: &DeviceId, samples: Vec<CanonicalSample>) -> BatchOutcome {
        if samples.is_empty() {
            return BatchOutcome::default();
        }
        let (outcome, latest) = {
            let mut store = self.lock_store();
            let outcome = store.insert_batch(samples);
            (outcome, store.latest(device_id))
        };
        if outcome.written() > 0 {
            self.events.send(TelemetryEvent::SamplesUpdated {
                device_id: device_id.clone(),
                inserted: outcome.written(),
                latest,
            });
        }
        outcome
    }

    /// Ascending snapshot of a device series.
    pub fn read(&self, device_id: &DeviceId, range: Option<&TimeRange>) -> Vec<Arc<CanonicalSample>> {
        self.lock_store().read(device_id, range)
    }

    /// Newest sample of a device.
    pub fn latest(&self, device_id: &DeviceId) -> Option<Arc<CanonicalSample>> {
        self.lock_store().latest(device_id)
    }

    /// Number of samples held for a device.
    pub fn len(&self, device_id: &DeviceId) -> usize {
        self.lock_store().len(device_id)
    }

    /// Devices with at least one stored sample.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.lock_store().devices()
    }

    /// Derived operational state of a device.
    pub fn machine_state(&self, device_id: &DeviceId) -> MachineState {
        self.lock_status().state(device_id)
    }

    /// Last known raw status of a device.
    pub fn device_status(&self, device_id: &DeviceId) -> Option<DeviceStatus> {
        self.lock_status().get(device_id)
    }

    /// Drop the stored series and status of a device.
    pub fn forget(&self, device_id: &DeviceId) {
        self.lock_store().remove(device_id);
        self.lock_status().remove(device_id);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.lock_store().clear();
        self.lock_status().clear();
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_accepted: self.counters.frames_accepted.load(Ordering::Relaxed),
            frames_rejected: self.counters.frames_rejected.load(Ordering::Relaxed),
            rows_accepted: self.counters.rows_accepted.load(Ordering::Relaxed),
            rows_rejected: self.counters.rows_rejected.load(Ordering::Relaxed),
        }
    }

    fn publish_status(&self, change: StatusChange) {
        debug!(
            "{} state {:?} -> {}",
            change.device_id, change.previous, change.current
        );
        self.events.send(TelemetryEvent::StatusChanged {
            device_id: change.device_id,
            previous: change.previous,
            current: change.current,
        });
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, SeriesStore> {
        self.store.lock().expect("series store lock poisoned")
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, StatusTracker> {
        self.status.lock().expect("status tracker lock poisoned")
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(RetentionPolicy::default(), EventDispatcher::default())
    }
}

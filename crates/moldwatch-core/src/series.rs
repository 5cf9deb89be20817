//! Per-device, ordered, de-duplicated and bounded sample series.
//!
//! Merge rules, applied on every insert:
//!
//! | Incoming | Existing at the same key | Result |
//! |----------|--------------------------|--------|
//! | SPC, cycle `n` | any SPC with cycle `n` | replaced (even if the timestamp moved) |
//! | SPC / realtime at `t` | historical at `t` | historical dropped, live kept |
//! | realtime at `t` | realtime at `t` | replaced |
//! | historical at `t` | realtime or SPC at `t` | incoming skipped |
//! | historical at `t` | historical at `t` | replaced |
//!
//! Samples are ordered by `(timestamp, source, cycle)`, so a read is always
//! ascending by timestamp.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{debug, trace};

use moldwatch_types::{CanonicalSample, DeviceId, SourceType, TimeRange};

use crate::error::{Error, Result};

/// Ordering key of a sample inside a device series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct SeriesKey {
    timestamp: OffsetDateTime,
    source: SourceType,
    /// Only set for SPC samples.
    cycle: Option<u64>,
}

impl SeriesKey {
    fn at(timestamp: OffsetDateTime, source: SourceType) -> Self {
        Self {
            timestamp,
            source,
            cycle: None,
        }
    }

    fn first_at(timestamp: OffsetDateTime) -> Self {
        Self::at(timestamp, SourceType::Historical)
    }

    fn last_at(timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp,
            source: SourceType::Spc,
            cycle: Some(u64::MAX),
        }
    }
}

/// What an insert did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new entry was added.
    Inserted,
    /// An existing entry was superseded.
    Replaced,
    /// The sample was dropped because live data already covers it.
    Skipped,
}

impl InsertOutcome {
    /// Whether the visible series changed.
    pub fn changed(self) -> bool {
        !matches!(self, InsertOutcome::Skipped)
    }
}

/// Counters for a batch insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// New entries.
    pub inserted: usize,
    /// Superseded entries.
    pub replaced: usize,
    /// Dropped samples.
    pub skipped: usize,
    /// Entries evicted by the retention policy afterwards.
    pub evicted: usize,
}

impl BatchOutcome {
    fn record(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Inserted => self.inserted += 1,
            InsertOutcome::Replaced => self.replaced += 1,
            InsertOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Entries that were written (new or superseding).
    pub fn written(&self) -> usize {
        self.inserted + self.replaced
    }
}

/// Bounds applied to every device series after each insert batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum number of samples kept per device.
    pub max_samples: usize,
    /// Maximum age relative to the newest sample of the device (None = no age limit).
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_samples: 10_000,
            max_age: Some(Duration::hours(24)),
        }
    }
}

impl RetentionPolicy {
    /// Create a policy with the default bounds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unbounded by age, capped by count only.
    pub fn count_only(max_samples: usize) -> Self {
        Self {
            max_samples,
            max_age: None,
        }
    }

    /// Set the count cap.
    #[must_use]
    pub fn max_samples(mut self, max: usize) -> Self {
        self.max_samples = max;
        self
    }

    /// Set the age window.
    #[must_use]
    pub fn max_age(mut self, age: Option<Duration>) -> Self {
        self.max_age = age;
        self
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.max_samples == 0 {
            return Err(Error::invalid_config("max_samples must be > 0"));
        }
        if self.max_age.is_some_and(|age| !age.is_positive()) {
            return Err(Error::invalid_config("max_age must be positive"));
        }
        Ok(())
    }
}

/// Ordered sample series of a single device.
#[derive(Debug, Default)]
pub struct DeviceSeries {
    samples: BTreeMap<SeriesKey, Arc<CanonicalSample>>,
    /// SPC cycle number to the key currently holding it.
    cycles: HashMap<u64, SeriesKey>,
    latest: Option<Arc<CanonicalSample>>,
}

impl DeviceSeries {
    /// Create an empty series.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the series is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Newest sample.
    pub fn latest(&self) -> Option<Arc<CanonicalSample>> {
        self.latest.clone()
    }

    /// Oldest sample.
    pub fn oldest(&self) -> Option<Arc<CanonicalSample>> {
        self.samples.first_key_value().map(|(_, s)| Arc::clone(s))
    }

    /// Merge one sample into the series.
    pub fn insert(&mut self, sample: CanonicalSample) -> InsertOutcome {
        let ts = sample.timestamp;
        let outcome = match sample.source_type {
            SourceType::Spc => {
                let Some(cycle) = sample.cycle_number else {
                    debug!("Skipping SPC sample for {} without cycle number", sample.device_id);
                    return InsertOutcome::Skipped;
                };
                let key = SeriesKey {
                    timestamp: ts,
                    source: SourceType::Spc,
                    cycle: Some(cycle),
                };
                let superseded_historical = self
                    .samples
                    .remove(&SeriesKey::at(ts, SourceType::Historical))
                    .is_some();
                let replaced_cycle = match self.cycles.insert(cycle, key) {
                    Some(old) => self.samples.remove(&old).is_some(),
                    None => false,
                };
                self.samples.insert(key, Arc::new(sample));
                if replaced_cycle || superseded_historical {
                    InsertOutcome::Replaced
                } else {
                    InsertOutcome::Inserted
                }
            }
            SourceType::Realtime => {
                let superseded_historical = self
                    .samples
                    .remove(&SeriesKey::at(ts, SourceType::Historical))
                    .is_some();
                let previous = self
                    .samples
                    .insert(SeriesKey::at(ts, SourceType::Realtime), Arc::new(sample));
                if previous.is_some() || superseded_historical {
                    InsertOutcome::Replaced
                } else {
                    InsertOutcome::Inserted
                }
            }
            SourceType::Historical => {
                if self.has_live_at(ts) {
                    trace!("Historical sample at {} already covered by live data", ts);
                    return InsertOutcome::Skipped;
                }
                let previous = self
                    .samples
                    .insert(SeriesKey::at(ts, SourceType::Historical), Arc::new(sample));
                if previous.is_some() {
                    InsertOutcome::Replaced
                } else {
                    InsertOutcome::Inserted
                }
            }
        };
        self.refresh_latest();
        outcome
    }

    /// Drop the oldest samples until at most `max` remain.
    ///
    /// Returns the number of samples removed.
    pub fn prune(&mut self, max: usize) -> usize {
        let mut removed = 0;
        while self.samples.len() > max {
            if self.pop_oldest().is_none() {
                break;
            }
            removed += 1;
        }
        if removed > 0 {
            self.refresh_latest();
        }
        removed
    }

    /// Drop samples older than `cutoff`.
    pub fn prune_before(&mut self, cutoff: OffsetDateTime) -> usize {
        let mut removed = 0;
        while self
            .samples
            .first_key_value()
            .is_some_and(|(key, _)| key.timestamp < cutoff)
        {
            self.pop_oldest();
            removed += 1;
        }
        if removed > 0 {
            self.refresh_latest();
        }
        removed
    }

    /// Apply a retention policy.
    pub fn apply_retention(&mut self, policy: &RetentionPolicy) -> usize {
        let mut removed = 0;
        if let (Some(age), Some(newest)) = (policy.max_age, self.latest.as_ref())
            && let Some(cutoff) = newest.timestamp.checked_sub(age)
        {
            removed += self.prune_before(cutoff);
        }
        removed + self.prune(policy.max_samples)
    }

    /// Ascending snapshot, optionally restricted to an inclusive range.
    pub fn read(&self, range: Option<&TimeRange>) -> Vec<Arc<CanonicalSample>> {
        match range {
            None => self.samples.values().cloned().collect(),
            Some(range) if range.end < range.start => Vec::new(),
            Some(range) => self
                .samples
                .range(SeriesKey::first_at(range.start)..=SeriesKey::last_at(range.end))
                .map(|(_, s)| Arc::clone(s))
                .collect(),
        }
    }

    fn has_live_at(&self, ts: OffsetDateTime) -> bool {
        self.samples
            .range(SeriesKey::at(ts, SourceType::Realtime)..=SeriesKey::last_at(ts))
            .next()
            .is_some()
    }

    fn pop_oldest(&mut self) -> Option<Arc<CanonicalSample>> {
        let (key, sample) = self.samples.pop_first()?;
        if let Some(cycle) = key.cycle
            && self.cycles.get(&cycle) == Some(&key)
        {
            self.cycles.remove(&cycle);
        }
        Some(sample)
    }

    fn refresh_latest(&mut self) {
        self.latest = self.samples.last_key_value().map(|(_, s)| Arc::clone(s));
    }
}

/// Series of every device, under one retention policy.
///
/// The store is synchronous. Callers wrap it in a lock and never hold that
/// lock across an `.await`.
#[derive(Debug, Default)]
pub struct SeriesStore {
    devices: HashMap<DeviceId, DeviceSeries>,
    policy: RetentionPolicy,
}

impl SeriesStore {
    /// Create a store with the default retention policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with a custom retention policy.
    pub fn with_policy(policy: RetentionPolicy) -> Self {
        Self {
            devices: HashMap::new(),
            policy,
        }
    }

    /// The active retention policy.
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Merge one sample and apply retention to its device.
    pub fn insert(&mut self, sample: CanonicalSample) -> InsertOutcome {
        let series = self.devices.entry(sample.device_id.clone()).or_default();
        let outcome = series.insert(sample);
        if outcome.changed() {
            series.apply_retention(&self.policy);
        }
        outcome
    }

    /// Merge a batch of samples, then apply retention once per touched device.
    pub fn insert_batch(&mut self, samples: impl IntoIterator<Item = CanonicalSample>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut touched: Vec<DeviceId> = Vec::new();
        for sample in samples {
            if !touched.contains(&sample.device_id) {
                touched.push(sample.device_id.clone());
            }
            let series = self.devices.entry(sample.device_id.clone()).or_default();
            outcome.record(series.insert(sample));
        }
        for device in &touched {
            if let Some(series) = self.devices.get_mut(device) {
                outcome.evicted += series.apply_retention(&self.policy);
            }
        }
        outcome
    }

    /// Drop the oldest samples of a device beyond `max`.
    pub fn prune(&mut self, device: &DeviceId, max: usize) -> usize {
        self.devices
            .get_mut(device)
            .map(|series| series.prune(max))
            .unwrap_or(0)
    }

    /// Ascending snapshot of a device series.
    pub fn read(&self, device: &DeviceId, range: Option<&TimeRange>) -> Vec<Arc<CanonicalSample>> {
        self.devices
            .get(device)
            .map(|series| series.read(range))
            .unwrap_or_default()
    }

    /// Newest sample of a device.
    pub fn latest(&self, device: &DeviceId) -> Option<Arc<CanonicalSample>> {
        self.devices.get(device).and_then(DeviceSeries::latest)
    }

    /// Number of samples held for a device.
    pub fn len(&self, device: &DeviceId) -> usize {
        self.devices.get(device).map(DeviceSeries::len).unwrap_or(0)
    }

    /// Devices that currently hold samples.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, series)| !series.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop a device series. Returns whether anything was held.
    pub fn remove(&mut self, device: &DeviceId) -> bool {
        self.devices.remove(device).is_some()
    }

    /// Drop every series.
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

//! Zone dwell tracking.
//!
//! One `DwellRecord` per (zone kind, tracked object) while the object keeps
//! overlapping a zone of that kind. Per key and zone kind:
//!
//! ```text
//! Absent -> Dwelling (dwell < threshold) -> Violating (dwell >= threshold) -> Absent
//! ```
//!
//! The only way back to `Absent` is `cleanup`, which retires records not
//! refreshed within `timeout_multiplier x min_stop_time`. Re-entry after
//! cleanup starts a fresh record with a new entry time.
//!
//! The tracker does not debounce: it emits a `DwellTrigger` on every
//! observation at or above the threshold. Exactly-once handling lives in
//! `episode`.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::detect::TrackedObject;
use crate::{BoundingBox, TrackedObjectKey, ZoneKind};

#[derive(Clone, Debug)]
pub struct DwellConfig {
    /// Continuous occupancy at or above this is a violation.
    pub min_stop_time: Duration,
    /// Records not refreshed within `timeout_multiplier * min_stop_time` are stale.
    pub timeout_multiplier: f64,
}

impl DwellConfig {
    pub fn new(min_stop_time: Duration, timeout_multiplier: f64) -> Result<Self> {
        let config = Self {
            min_stop_time,
            timeout_multiplier,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_stop_time.is_zero() {
            return Err(anyhow!("min_stop_time must be greater than zero"));
        }
        if !self.timeout_multiplier.is_finite() || self.timeout_multiplier < 1.0 {
            return Err(anyhow!(
                "timeout_multiplier must be >= 1 (got {})",
                self.timeout_multiplier
            ));
        }
        self.checked_stale_after().ok_or_else(|| {
            anyhow!(
                "stale window {:?} x {} is out of range",
                self.min_stop_time,
                self.timeout_multiplier
            )
        })?;
        Ok(())
    }

    fn checked_stale_after(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.min_stop_time.as_secs_f64() * self.timeout_multiplier).ok()
    }

    /// `timeout_multiplier x min_stop_time`, saturating for a config that
    /// skipped `validate`.
    pub fn stale_after(&self) -> Duration {
        self.checked_stale_after().unwrap_or(Duration::MAX)
    }
}

impl Default for DwellConfig {
    fn default() -> Self {
        Self {
            min_stop_time: Duration::from_secs(3),
            timeout_multiplier: 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DwellState {
    Dwelling,
    Violating,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DwellRecord {
    pub key: TrackedObjectKey,
    pub zone_kind: ZoneKind,
    pub entry_time: Duration,
    pub last_seen: Duration,
    pub last_bbox: BoundingBox,
    /// Zone the object was first seen overlapping.
    pub zone: BoundingBox,
}

impl DwellRecord {
    pub fn dwell(&self, now: Duration) -> Duration {
        now.saturating_sub(self.entry_time)
    }

    pub fn state(&self, now: Duration, min_stop_time: Duration) -> DwellState {
        if self.dwell(now) >= min_stop_time {
            DwellState::Violating
        } else {
            DwellState::Dwelling
        }
    }
}

/// Emitted for every observation whose dwell is at or above the threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct DwellTrigger {
    pub key: TrackedObjectKey,
    pub zone_kind: ZoneKind,
    pub dwell: Duration,
    pub bbox: BoundingBox,
    pub zone: BoundingBox,
    /// Entry time of the record that crossed the threshold.
    pub entry_time: Duration,
}

/// A record retired by `cleanup`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DwellExpiry {
    pub key: TrackedObjectKey,
    pub zone_kind: ZoneKind,
    pub entry_time: Duration,
    pub last_seen: Duration,
}

/// Object found overlapping a zone in the current frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Occupant {
    pub key: TrackedObjectKey,
    pub bbox: BoundingBox,
    pub zone: BoundingBox,
}

/// Pair each object with the first zone it overlaps. An object overlapping
/// several zones of one kind is reported once.
pub fn overlapping(zones: &[BoundingBox], objects: &[TrackedObject]) -> Vec<Occupant> {
    objects
        .iter()
        .filter_map(|object| {
            let bbox = object.bbox();
            zones.iter().find(|zone| zone.overlaps(&bbox)).map(|zone| Occupant {
                key: object.key,
                bbox,
                zone: *zone,
            })
        })
        .collect()
}

pub struct ZoneDwellTracker {
    config: DwellConfig,
    records: HashMap<ZoneKind, HashMap<TrackedObjectKey, DwellRecord>>,
}

impl ZoneDwellTracker {
    pub fn new(config: DwellConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DwellConfig {
        &self.config
    }

    /// Record this frame's occupants of `zone_kind` and return the triggers
    /// for every occupant at or above the threshold.
    pub fn observe(
        &mut self,
        zone_kind: ZoneKind,
        occupants: &[Occupant],
        now: Duration,
    ) -> Vec<DwellTrigger> {
        let threshold = self.config.min_stop_time;
        let records = self.records.entry(zone_kind).or_default();
        let mut seen = HashSet::new();
        let mut triggers = Vec::new();

        for occupant in occupants {
            if !seen.insert(occupant.key) {
                continue;
            }
            let record = records.entry(occupant.key).or_insert_with(|| DwellRecord {
                key: occupant.key,
                zone_kind,
                entry_time: now,
                last_seen: now,
                last_bbox: occupant.bbox,
                zone: occupant.zone,
            });
            record.last_seen = record.last_seen.max(now);
            record.last_bbox = occupant.bbox;

            let dwell = record.dwell(now);
            if dwell >= threshold {
                triggers.push(DwellTrigger {
                    key: occupant.key,
                    zone_kind,
                    dwell,
                    bbox: occupant.bbox,
                    zone: record.zone,
                    entry_time: record.entry_time,
                });
            }
        }
        triggers
    }

    /// Retire every record with `now - last_seen > stale_after`.
    ///
    /// Must run once per processed frame (or on a fixed tick) whether or not
    /// anything was observed. Expiries are returned in (zone kind, key) order.
    pub fn cleanup(&mut self, now: Duration) -> Vec<DwellExpiry> {
        let stale_after = self.config.stale_after();
        let mut expired = Vec::new();
        for (zone_kind, records) in self.records.iter_mut() {
            records.retain(|key, record| {
                if now.saturating_sub(record.last_seen) > stale_after {
                    expired.push(DwellExpiry {
                        key: *key,
                        zone_kind: *zone_kind,
                        entry_time: record.entry_time,
                        last_seen: record.last_seen,
                    });
                    false
                } else {
                    true
                }
            });
        }
        expired.sort_by_key(|e| (e.zone_kind, e.key));
        if !expired.is_empty() {
            log::debug!("dwell cleanup retired {} record(s)", expired.len());
        }
        expired
    }

    pub fn record(&self, zone_kind: ZoneKind, key: TrackedObjectKey) -> Option<&DwellRecord> {
        self.records.get(&zone_kind).and_then(|r| r.get(&key))
    }

    pub fn len(&self) -> usize {
        self.records.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

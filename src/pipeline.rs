//! Per-frame orchestration.
//!
//! One `Pipeline` serves one frame source and owns every piece of tracking
//! state, so frames are applied strictly one at a time in arrival order.
//!
//! Per frame:
//! 1. validate, push into the evidence buffer
//! 2. object and zone detection
//! 3. identity assignment for the confident, tracked-class detections
//! 4. stale dwell cleanup (also when detection was unavailable), expiring episodes
//! 5. dwell observation per zone kind, episode triggers
//! 6. on the maintenance tick: quota enforcement and the pending-persistence retry

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::{DetectedObject, IouTracker, IouTrackerConfig, ObjectDetector, PlateRecognizer, ZoneDetector};
use crate::dwell::{overlapping, DwellConfig, DwellExpiry, ZoneDwellTracker};
use crate::episode::{EpisodeConfig, EpisodeEvent, EpisodeManager, EpisodeServices};
use crate::evidence::{EvidenceStore, QuotaReport};
use crate::frame::{EvidenceBuffer, Frame, MAX_BUFFER_FRAMES};
use crate::storage::PersistenceAdapter;
use crate::ZoneKind;

pub const DEFAULT_TRACKED_CLASSES: [&str; 4] = ["car", "motorcycle", "bus", "truck"];

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub dwell: DwellConfig,
    pub episodes: EpisodeConfig,
    pub tracker: IouTrackerConfig,
    /// Detections at or below this confidence are dropped.
    pub confidence_threshold: f32,
    pub tracked_classes: Vec<String>,
    pub buffer_capacity: usize,
    /// Frame-time interval between quota/retry passes.
    pub maintenance_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dwell: DwellConfig::default(),
            episodes: EpisodeConfig::default(),
            tracker: IouTrackerConfig::default(),
            confidence_threshold: 0.7,
            tracked_classes: DEFAULT_TRACKED_CLASSES.iter().map(|c| c.to_string()).collect(),
            buffer_capacity: 100,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold must be in 0..=1 (got {})",
                self.confidence_threshold
            ));
        }
        if self.buffer_capacity == 0 || self.buffer_capacity > MAX_BUFFER_FRAMES {
            return Err(anyhow!(
                "buffer_capacity must be in 1..={} (got {})",
                MAX_BUFFER_FRAMES,
                self.buffer_capacity
            ));
        }
        if self.tracked_classes.is_empty() {
            return Err(anyhow!("tracked_classes must not be empty"));
        }
        self.dwell.validate()?;
        self.episodes.validate()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    Processed,
    /// Malformed or out-of-order frame; nothing was mutated.
    Skipped(String),
    /// A detection capability failed. Dwell observation was skipped for the
    /// frame; stale cleanup still ran.
    DetectionUnavailable {
        capability: &'static str,
        error: String,
    },
}

#[derive(Clone, Debug)]
pub struct FrameReport {
    pub timestamp: Duration,
    pub outcome: FrameOutcome,
    /// Dwell triggers raised this frame, before debouncing.
    pub triggers: usize,
    pub events: Vec<EpisodeEvent>,
    pub expired: Vec<DwellExpiry>,
    /// Present on frames that ran the maintenance tick.
    pub quota: Option<QuotaReport>,
}

impl FrameReport {
    fn new(timestamp: Duration, outcome: FrameOutcome) -> Self {
        Self {
            timestamp,
            outcome,
            triggers: 0,
            events: Vec::new(),
            expired: Vec::new(),
            quota: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub detection_failures: u64,
    pub episodes_opened: u64,
    pub episodes_pending: usize,
    pub active_dwell_records: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    objects: Box<dyn ObjectDetector>,
    zones: Box<dyn ZoneDetector>,
    plates: Box<dyn PlateRecognizer>,
    evidence: Arc<EvidenceStore>,
    persistence: Box<dyn PersistenceAdapter>,
    identity: IouTracker,
    dwell: ZoneDwellTracker,
    episodes: EpisodeManager,
    buffer: EvidenceBuffer,
    last_timestamp: Option<Duration>,
    last_maintenance: Option<Duration>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        mut config: PipelineConfig,
        mut objects: Box<dyn ObjectDetector>,
        zones: Box<dyn ZoneDetector>,
        plates: Box<dyn PlateRecognizer>,
        evidence: Arc<EvidenceStore>,
        persistence: Box<dyn PersistenceAdapter>,
    ) -> Result<Self> {
        config.validate()?;
        if config.episodes.clip_frame_count > config.buffer_capacity {
            log::warn!(
                "clip_frame_count {} exceeds buffer capacity {}; clamping",
                config.episodes.clip_frame_count,
                config.buffer_capacity
            );
            config.episodes.clip_frame_count = config.buffer_capacity;
        }
        // A key must survive any dropout its dwell record survives.
        let stale_after = config.dwell.stale_after();
        if config.tracker.max_idle < stale_after {
            log::debug!(
                "raising track idle window from {:?} to {:?}",
                config.tracker.max_idle,
                stale_after
            );
            config.tracker.max_idle = stale_after;
        }
        objects.warm_up()?;
        log::info!(
            "pipeline for {}: detector={} zones={} plates={} min_stop={:?} stale_after={:?}",
            config.episodes.stream_id,
            objects.name(),
            zones.name(),
            plates.name(),
            config.dwell.min_stop_time,
            config.dwell.stale_after()
        );

        Ok(Self {
            identity: IouTracker::new(config.tracker.clone()),
            dwell: ZoneDwellTracker::new(config.dwell.clone()),
            episodes: EpisodeManager::new(config.episodes.clone())?,
            buffer: EvidenceBuffer::new(config.buffer_capacity)?,
            config,
            objects,
            zones,
            plates,
            evidence,
            persistence,
            last_timestamp: None,
            last_maintenance: None,
            stats: PipelineStats::default(),
        })
    }

    /// Apply one frame. Never fails: every per-frame problem is reported in
    /// the returned outcome.
    pub fn process_frame(&mut self, frame: Frame) -> FrameReport {
        let now = frame.timestamp;

        if let Err(e) = frame.validate() {
            return self.skip(now, e.to_string());
        }
        if let Some(last) = self.last_timestamp {
            if now < last {
                return self.skip(now, format!("timestamp {:?} is before {:?}", now, last));
            }
        }
        self.last_timestamp = Some(now);
        self.buffer.push(frame.clone());

        let detections = self
            .objects
            .detect(&frame)
            .map_err(|e| (self.objects.name(), e))
            .and_then(|objects| {
                self.zones
                    .detect_zones(&frame)
                    .map(|zones| (objects, zones))
                    .map_err(|e| (self.zones.name(), e))
            });

        // Cleanup first so a returning object never extends a stale record.
        let expired = self.dwell.cleanup(now);
        for expiry in &expired {
            self.episodes.on_expire(expiry.zone_kind, expiry.key);
        }

        let mut report = match detections {
            Err((capability, e)) => {
                self.stats.detection_failures += 1;
                log::warn!("detection unavailable ({}) at {:?}: {}", capability, now, e);
                FrameReport::new(
                    now,
                    FrameOutcome::DetectionUnavailable {
                        capability,
                        error: e.to_string(),
                    },
                )
            }
            Ok((objects, zones)) => {
                let mut report = FrameReport::new(now, FrameOutcome::Processed);
                let candidates = self.filter(objects);
                let tracked = self.identity.update(now, candidates);
                for kind in ZoneKind::ALL {
                    let occupants = overlapping(zones.of_kind(kind), &tracked);
                    let triggers = self.dwell.observe(kind, &occupants, now);
                    report.triggers += triggers.len();
                    for trigger in &triggers {
                        let mut services = EpisodeServices {
                            frame: &frame,
                            buffer: &self.buffer,
                            evidence: self.evidence.as_ref(),
                            plates: self.plates.as_mut(),
                            persistence: self.persistence.as_mut(),
                        };
                        if let Some(event) = self.episodes.on_trigger(trigger, &mut services) {
                            report.events.push(event);
                        }
                    }
                }
                report
            }
        };
        report.expired = expired;

        if self.maintenance_due(now) {
            self.last_maintenance = Some(now);
            report.quota = self.run_maintenance(&mut report.events);
        }

        self.stats.frames_processed += 1;
        report
    }

    fn skip(&mut self, now: Duration, reason: String) -> FrameReport {
        self.stats.frames_skipped += 1;
        log::debug!("frame at {:?} skipped: {}", now, reason);
        FrameReport::new(now, FrameOutcome::Skipped(reason))
    }

    fn filter(&self, objects: Vec<DetectedObject>) -> Vec<DetectedObject> {
        objects
            .into_iter()
            .filter(|o| o.confidence > self.config.confidence_threshold)
            .filter(|o| self.config.tracked_classes.iter().any(|c| *c == o.class_label))
            .collect()
    }

    fn maintenance_due(&self, now: Duration) -> bool {
        match self.last_maintenance {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.config.maintenance_interval,
        }
    }

    fn run_maintenance(&mut self, events: &mut Vec<EpisodeEvent>) -> Option<QuotaReport> {
        events.extend(self.episodes.retry_pending(self.persistence.as_mut()));
        match self.evidence.enforce_quota() {
            Ok(report) => Some(report),
            Err(e) => {
                log::warn!("quota enforcement failed: {}", e);
                None
            }
        }
    }

    /// Final retry pass and quota check. Evidence writes complete before
    /// `process_frame` returns, so the roots are quiescent here.
    pub fn shutdown(&mut self) -> Result<QuotaReport> {
        let events = self.episodes.retry_pending(self.persistence.as_mut());
        let still_pending = self.episodes.pending_count();
        if still_pending > 0 {
            log::error!(
                "shutting down with {} unpersisted episode(s); evidence is kept on disk",
                still_pending
            );
        }
        if self.evidence.in_flight_count() > 0 {
            return Err(anyhow!("evidence writes still in flight at shutdown"));
        }
        let quota = self.evidence.enforce_quota()?;
        log::info!(
            "pipeline shutdown: frames={} episodes={} retried={} evidence_bytes={}",
            self.stats.frames_processed,
            self.episodes.opened_total(),
            events.len(),
            quota.total_bytes_after
        );
        Ok(quota)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            episodes_opened: self.episodes.opened_total(),
            episodes_pending: self.episodes.pending_count(),
            active_dwell_records: self.dwell.len(),
            ..self.stats
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dwell_tracker(&self) -> &ZoneDwellTracker {
        &self.dwell
    }

    pub fn episodes(&self) -> &EpisodeManager {
        &self.episodes
    }

    pub fn buffer(&self) -> &EvidenceBuffer {
        &self.buffer
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    pub fn persistence_mut(&mut self) -> &mut dyn PersistenceAdapter {
        self.persistence.as_mut()
    }
}

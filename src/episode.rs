//! Violation episodes.
//!
//! The dwell tracker emits a trigger on every frame an object stays over the
//! threshold. The manager collapses those into one episode per
//! (zone kind, tracked key): evidence is captured and persistence requested on
//! the first trigger only, and the episode lives until the dwell record behind
//! it is retired.
//!
//! Persistence is fallible. A failed episode stays `Pending` with its
//! evidence kept, and is retried on later triggers (up to
//! `max_persistence_attempts`) and on every `retry_pending` pass. An episode
//! whose dwell record expires while still pending is moved to a backlog so
//! the retry pass can still commit it.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::Duration;

use crate::detect::PlateRecognizer;
use crate::dwell::DwellTrigger;
use crate::evidence::{EvidenceBundle, EvidenceStore};
use crate::frame::{EvidenceBuffer, Frame};
use crate::storage::{EpisodeData, PersistenceAdapter};
use crate::{epoch_now, validate_stream_id, BoundingBox, EpisodeStatus, TrackedObjectKey, ZoneKind};

#[derive(Clone, Debug)]
pub struct EpisodeConfig {
    pub stream_id: String,
    /// Frames taken from the evidence buffer for each clip.
    pub clip_frame_count: usize,
    /// Frame rate recorded with each clip.
    pub clip_fps: u32,
    /// Consecutive failures after which trigger-driven retries stop and the
    /// failure is escalated. The `retry_pending` pass keeps trying.
    pub max_persistence_attempts: u32,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            stream_id: "stream:default".to_string(),
            clip_frame_count: 60,
            clip_fps: 20,
            max_persistence_attempts: 3,
        }
    }
}

impl EpisodeConfig {
    pub fn validate(&self) -> Result<()> {
        validate_stream_id(&self.stream_id)?;
        if self.clip_frame_count == 0 {
            return Err(anyhow!("clip_frame_count must be at least 1"));
        }
        if self.clip_fps == 0 {
            return Err(anyhow!("clip_fps must be at least 1"));
        }
        if self.max_persistence_attempts == 0 {
            return Err(anyhow!("max_persistence_attempts must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ViolationEpisode {
    pub key: TrackedObjectKey,
    pub zone_kind: ZoneKind,
    /// Entry time of the dwell record when the threshold was first crossed.
    pub start_time: Duration,
    pub status: EpisodeStatus,
    pub license_plate: Option<String>,
    /// Set once `create` has succeeded; later retries only update status.
    pub persistence_id: Option<String>,
    pub evidence: EvidenceBundle,
    /// Consecutive persistence failures.
    pub failed_attempts: u32,
    data: EpisodeData,
}

impl ViolationEpisode {
    pub fn data(&self) -> &EpisodeData {
        &self.data
    }

    pub fn is_recorded(&self) -> bool {
        self.status == EpisodeStatus::Recorded
    }
}

/// Collaborators needed to open an episode, borrowed for one call.
pub struct EpisodeServices<'a> {
    /// Frame the trigger was computed from.
    pub frame: &'a Frame,
    pub buffer: &'a EvidenceBuffer,
    pub evidence: &'a EvidenceStore,
    pub plates: &'a mut dyn PlateRecognizer,
    pub persistence: &'a mut dyn PersistenceAdapter,
}

/// Emitted exactly once per episode, when persistence first succeeds.
#[derive(Clone, Debug, PartialEq)]
pub struct EpisodeOpened {
    pub key: TrackedObjectKey,
    pub zone_kind: ZoneKind,
    pub persistence_id: String,
    pub start_time: Duration,
    pub dwell: Duration,
    pub license_plate: Option<String>,
    pub evidence: EvidenceBundle,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PersistenceFailure {
    pub key: TrackedObjectKey,
    pub zone_kind: ZoneKind,
    pub attempts: u32,
    /// `attempts` reached `max_persistence_attempts`.
    pub escalated: bool,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EpisodeEvent {
    Opened(EpisodeOpened),
    PersistenceFailed(PersistenceFailure),
}

pub struct EpisodeManager {
    config: EpisodeConfig,
    episodes: HashMap<(ZoneKind, TrackedObjectKey), ViolationEpisode>,
    /// Pending episodes whose dwell record has already expired.
    backlog: Vec<ViolationEpisode>,
    opened: u64,
}

impl EpisodeManager {
    pub fn new(config: EpisodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            episodes: HashMap::new(),
            backlog: Vec::new(),
            opened: 0,
        })
    }

    pub fn config(&self) -> &EpisodeConfig {
        &self.config
    }

    /// Handle one dwell trigger.
    ///
    /// The first trigger for a (zone kind, key) opens the episode: image and
    /// clip are saved, the plate is read and persistence is requested. Later
    /// triggers are suppressed, except that a still-pending episode gets
    /// another persistence attempt while below the attempt limit.
    pub fn on_trigger(
        &mut self,
        trigger: &DwellTrigger,
        services: &mut EpisodeServices<'_>,
    ) -> Option<EpisodeEvent> {
        let max_attempts = self.config.max_persistence_attempts;
        let slot = (trigger.zone_kind, trigger.key);

        if let Some(episode) = self.episodes.get_mut(&slot) {
            if episode.is_recorded() || episode.failed_attempts >= max_attempts {
                log::trace!("{} {} trigger suppressed", trigger.zone_kind, trigger.key);
                return None;
            }
            let event = attempt_persist(episode, trigger.dwell, services.persistence, max_attempts);
            if matches!(event, EpisodeEvent::Opened(_)) {
                self.opened += 1;
            }
            return Some(event);
        }

        let mut episode = self.open_episode(trigger, services);
        let event = attempt_persist(&mut episode, trigger.dwell, services.persistence, max_attempts);
        if matches!(event, EpisodeEvent::Opened(_)) {
            self.opened += 1;
        }
        self.episodes.insert(slot, episode);
        Some(event)
    }

    fn open_episode(
        &self,
        trigger: &DwellTrigger,
        services: &mut EpisodeServices<'_>,
    ) -> ViolationEpisode {
        log::info!(
            "{} violation: {} dwelled {:.1}s in zone at {:?}",
            trigger.zone_kind,
            trigger.key,
            trigger.dwell.as_secs_f64(),
            trigger.zone
        );

        let image = match services.evidence.save_image(services.frame, &trigger.key) {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!("image capture failed for {}: {}", trigger.key, e);
                None
            }
        };
        let frames = services.buffer.snapshot(self.config.clip_frame_count);
        let clip = match services.evidence.save_clip(&frames, &trigger.key) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("clip capture failed for {}: {}", trigger.key, e);
                None
            }
        };
        let evidence = EvidenceBundle {
            image,
            clip,
            created_at: epoch_now().unwrap_or_default(),
        };

        let license_plate = read_plate(services.plates, services.frame, trigger.bbox);

        let data = EpisodeData {
            stream_id: self.config.stream_id.clone(),
            violation_type: trigger.zone_kind,
            tracked_key: trigger.key,
            started_at: trigger.entry_time,
            dwell_secs: trigger.dwell.as_secs_f64(),
            location: trigger.zone,
            object_bbox: trigger.bbox,
            license_plate: license_plate.clone(),
            evidence: evidence.clone(),
            clip_fps: self.config.clip_fps,
        };

        ViolationEpisode {
            key: trigger.key,
            zone_kind: trigger.zone_kind,
            start_time: trigger.entry_time,
            status: EpisodeStatus::Pending,
            license_plate,
            persistence_id: None,
            evidence,
            failed_attempts: 0,
            data,
        }
    }

    /// Retire the episode for a dwell record removed by cleanup, re-arming
    /// detection for that (zone kind, key). A still-pending episode moves to
    /// the retry backlog.
    pub fn on_expire(&mut self, zone_kind: ZoneKind, key: TrackedObjectKey) -> Option<ViolationEpisode> {
        let episode = self.episodes.remove(&(zone_kind, key))?;
        if !episode.is_recorded() {
            log::warn!(
                "{} {} left the zone before its episode was persisted; kept for retry",
                zone_kind,
                key
            );
            self.backlog.push(episode.clone());
        }
        Some(episode)
    }

    /// Attempt persistence for every pending episode, including expired ones.
    pub fn retry_pending(&mut self, persistence: &mut dyn PersistenceAdapter) -> Vec<EpisodeEvent> {
        let max_attempts = self.config.max_persistence_attempts;
        let mut events = Vec::new();

        let mut slots: Vec<_> = self
            .episodes
            .iter()
            .filter(|(_, e)| !e.is_recorded())
            .map(|(slot, _)| *slot)
            .collect();
        slots.sort();
        for slot in slots {
            if let Some(episode) = self.episodes.get_mut(&slot) {
                let dwell = Duration::from_secs_f64(episode.data.dwell_secs);
                events.push(attempt_persist(episode, dwell, persistence, max_attempts));
            }
        }

        let backlog = std::mem::take(&mut self.backlog);
        for mut episode in backlog {
            let dwell = Duration::from_secs_f64(episode.data.dwell_secs);
            let event = attempt_persist(&mut episode, dwell, persistence, max_attempts);
            if !episode.is_recorded() {
                self.backlog.push(episode);
            }
            events.push(event);
        }

        self.opened += events
            .iter()
            .filter(|e| matches!(e, EpisodeEvent::Opened(_)))
            .count() as u64;
        events
    }

    pub fn episode(&self, zone_kind: ZoneKind, key: TrackedObjectKey) -> Option<&ViolationEpisode> {
        self.episodes.get(&(zone_kind, key))
    }

    pub fn active_count(&self) -> usize {
        self.episodes.len()
    }

    /// Pending episodes, active or expired.
    pub fn pending_count(&self) -> usize {
        self.episodes.values().filter(|e| !e.is_recorded()).count() + self.backlog.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn opened_total(&self) -> u64 {
        self.opened
    }
}

fn read_plate(plates: &mut dyn PlateRecognizer, frame: &Frame, bbox: BoundingBox) -> Option<String> {
    match plates.recognize(frame, bbox) {
        Ok(plate) => plate,
        Err(e) => {
            log::warn!("plate recognizer {} failed: {}", plates.name(), e);
            None
        }
    }
}

fn persist(episode: &mut ViolationEpisode, persistence: &mut dyn PersistenceAdapter) -> Result<String> {
    let id = match &episode.persistence_id {
        Some(id) => id.clone(),
        None => {
            let id = persistence.create(&episode.data)?;
            episode.persistence_id = Some(id.clone());
            id
        }
    };
    persistence.update_status(&id, EpisodeStatus::Recorded)?;
    episode.status = EpisodeStatus::Recorded;
    Ok(id)
}

fn attempt_persist(
    episode: &mut ViolationEpisode,
    dwell: Duration,
    persistence: &mut dyn PersistenceAdapter,
    max_attempts: u32,
) -> EpisodeEvent {
    match persist(episode, persistence) {
        Ok(id) => {
            episode.failed_attempts = 0;
            log::info!(
                "{} episode for {} recorded as {}",
                episode.zone_kind,
                episode.key,
                id
            );
            EpisodeEvent::Opened(EpisodeOpened {
                key: episode.key,
                zone_kind: episode.zone_kind,
                persistence_id: id,
                start_time: episode.start_time,
                dwell,
                license_plate: episode.license_plate.clone(),
                evidence: episode.evidence.clone(),
            })
        }
        Err(e) => {
            episode.failed_attempts += 1;
            let escalated = episode.failed_attempts >= max_attempts;
            if escalated {
                log::error!(
                    "persistence of {} episode for {} failed {} times: {}",
                    episode.zone_kind,
                    episode.key,
                    episode.failed_attempts,
                    e
                );
            } else {
                log::warn!(
                    "persistence of {} episode for {} failed (attempt {}): {}",
                    episode.zone_kind,
                    episode.key,
                    episode.failed_attempts,
                    e
                );
            }
            EpisodeEvent::PersistenceFailed(PersistenceFailure {
                key: episode.key,
                zone_kind: episode.zone_kind,
                attempts: episode.failed_attempts,
                escalated,
                error: e.to_string(),
            })
        }
    }
}

//! Short-term identity assignment.
//!
//! Raw box coordinates are not a usable identity: they jitter between frames
//! and two different vehicles can occupy the same pixels minutes apart. The
//! tracker here matches each frame's detections to the previous tracks by
//! IoU and hands out monotonically increasing integer ids, so dwell accounting
//! depends on identity only.
//!
//! Tracks age in frame time, not in frame counts. A track must outlive the
//! dwell stale window, otherwise a short detector dropout on a parked car
//! would hand it a new key while its old dwell record is still alive.

use std::time::Duration;

use crate::detect::result::{DetectedObject, TrackedObject};
use crate::{BoundingBox, TrackedObjectKey};

#[derive(Clone, Debug)]
pub struct IouTrackerConfig {
    /// Minimum IoU for a detection to continue an existing track.
    pub match_threshold: f32,
    /// A track unmatched for longer than this is forgotten.
    pub max_idle: Duration,
}

impl Default for IouTrackerConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.3,
            max_idle: Duration::from_secs(6),
        }
    }
}

#[derive(Clone, Debug)]
struct Track {
    key: TrackedObjectKey,
    bbox: BoundingBox,
    class_label: String,
    last_seen: Duration,
}

pub struct IouTracker {
    config: IouTrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl IouTracker {
    pub fn new(config: IouTrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Assign identities to the detections of the frame at `now`.
    ///
    /// Greedy matching: candidate (track, detection) pairs are taken in
    /// descending IoU order; each track and each detection is used at most
    /// once. Only same-class pairs are considered.
    pub fn update(&mut self, now: Duration, detections: Vec<DetectedObject>) -> Vec<TrackedObject> {
        let mut pairs = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if track.class_label != det.class_label {
                    continue;
                }
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.config.match_threshold {
                    pairs.push((iou, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut track_used = vec![false; self.tracks.len()];
        let mut assigned: Vec<Option<TrackedObjectKey>> = vec![None; detections.len()];
        for (_, ti, di) in pairs {
            if track_used[ti] || assigned[di].is_some() {
                continue;
            }
            track_used[ti] = true;
            assigned[di] = Some(self.tracks[ti].key);
            self.tracks[ti].bbox = detections[di].bbox;
            self.tracks[ti].last_seen = now;
        }

        let max_idle = self.config.max_idle;
        self.tracks
            .retain(|track| now.saturating_sub(track.last_seen) <= max_idle);

        let mut out = Vec::with_capacity(detections.len());
        for (det, key) in detections.into_iter().zip(assigned) {
            let key = match key {
                Some(key) => key,
                None => {
                    let key = TrackedObjectKey(self.next_id);
                    self.next_id += 1;
                    self.tracks.push(Track {
                        key,
                        bbox: det.bbox,
                        class_label: det.class_label.clone(),
                        last_seen: now,
                    });
                    key
                }
            };
            out.push(TrackedObject {
                key,
                detection: det,
            });
        }
        out
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(IouTrackerConfig::default())
    }
}

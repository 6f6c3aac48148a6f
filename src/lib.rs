//! Zone Witness
//!
//! This crate implements the dwell-tracking and evidence-lifecycle engine for
//! restricted-zone violation monitoring.
//!
//! # Architecture
//!
//! Data flows in one direction for every frame:
//!
//! ```text
//! Frame -> {ObjectDetector, ZoneDetector} -> IouTracker -> ZoneDwellTracker
//!       -> EpisodeManager -> {EvidenceBuffer snapshot, EvidenceStore, PersistenceAdapter}
//! ```
//!
//! The engine never analyses pixels itself. Detection, zone localisation and
//! plate recognition are capabilities behind traits in [`detect`]; the engine
//! only consumes their geometric results and owns the temporal, state and
//! storage logic around them.
//!
//! # Module Structure
//!
//! - `frame`: Frames and the bounded `EvidenceBuffer`
//! - `detect`: Capability traits, identity assignment, stub backends
//! - `dwell`: Per-zone-kind occupancy tracking with timeout expiry
//! - `episode`: Exactly-once violation episodes
//! - `evidence`: Image/clip artifacts and byte-budget eviction
//! - `storage`: Episode metadata persistence (SQLite, in-memory)
//! - `pipeline`: Per-frame orchestration
//! - `ingest`: Frame sources
//! - `config`: Daemon configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod dwell;
pub mod episode;
pub mod evidence;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod storage;

pub use detect::{
    DetectedObject, IouTracker, IouTrackerConfig, ObjectDetector, PlateRecognizer, TrackedObject,
    ZoneDetections, ZoneDetector,
};
pub use dwell::{DwellConfig, DwellExpiry, DwellRecord, DwellTrigger, Occupant, ZoneDwellTracker};
pub use episode::{
    EpisodeConfig, EpisodeEvent, EpisodeManager, EpisodeOpened, EpisodeServices,
    PersistenceFailure, ViolationEpisode,
};
pub use evidence::{EvidenceBundle, EvidenceConfig, EvidenceFile, EvidenceStore, QuotaReport};
pub use frame::{EvidenceBuffer, Frame, MAX_BUFFER_FRAMES};
pub use ingest::{FrameSource, SourceConfig};
pub use pipeline::{FrameOutcome, FrameReport, Pipeline, PipelineConfig, PipelineStats};
pub use storage::{
    EpisodeData, EpisodeRecord, InMemoryEpisodeStore, PersistenceAdapter, SqliteEpisodeStore,
};

// -------------------- Geometry --------------------

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    /// Inclusive overlap test: rectangles that only touch along an edge or a
    /// corner overlap.
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        if self.right() < other.x as i64 || other.right() < self.x as i64 {
            return false;
        }
        if self.bottom() < other.y as i64 || other.bottom() < self.y as i64 {
            return false;
        }
        true
    }

    /// Intersection over union of the two rectangles' areas, in `0.0..=1.0`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = (self.x as i64).max(other.x as i64);
        let top = (self.y as i64).max(other.y as i64);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0.0;
        }
        let intersection = (right - left) * (bottom - top);
        let union = self.area() + other.area() - intersection;
        if union <= 0 {
            return 0.0;
        }
        intersection as f32 / union as f32
    }
}

// -------------------- Zones --------------------

/// Category of restricted region. Each kind is tracked independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ZoneKind {
    /// Yellow box junction: vehicles must not stop inside it.
    #[serde(rename = "yellow_box")]
    BoxJunction,
    /// Zebra crossing: vehicles must not wait on it.
    #[serde(rename = "zebra_crossing")]
    PedestrianCrossing,
}

impl ZoneKind {
    pub const ALL: [ZoneKind; 2] = [ZoneKind::BoxJunction, ZoneKind::PedestrianCrossing];

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::BoxJunction => "yellow_box",
            ZoneKind::PedestrianCrossing => "zebra_crossing",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "yellow_box" => Ok(ZoneKind::BoxJunction),
            "zebra_crossing" => Ok(ZoneKind::PedestrianCrossing),
            other => Err(anyhow!("unknown zone kind '{}'", other)),
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------------------- Identity --------------------

/// Identity that correlates one object across frames.
///
/// Assigned by the identity tracker in [`detect`], never derived from raw
/// coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackedObjectKey(pub u64);

impl fmt::Display for TrackedObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

// -------------------- Episode Status --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    /// Threshold crossed; evidence captured, metadata not yet confirmed.
    Pending,
    /// Evidence and metadata both committed.
    Recorded,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Pending => "pending",
            EpisodeStatus::Recorded => "recorded",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(EpisodeStatus::Pending),
            "recorded" => Ok(EpisodeStatus::Recorded),
            other => Err(anyhow!("unknown episode status '{}'", other)),
        }
    }
}

// -------------------- Stream ID Discipline --------------------

/// Stream ids prefix persisted records, so they are kept to a small
/// lowercase alphabet.
pub fn validate_stream_id(stream_id: &str) -> Result<()> {
    static STREAM_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = STREAM_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^stream:[a-z0-9_-]{1,64}$").expect("static stream id pattern")
    });
    if !re.is_match(stream_id) {
        return Err(anyhow!(
            "stream id must match stream:[a-z0-9_-]{{1,64}} (got '{}')",
            stream_id
        ));
    }
    Ok(())
}

// -------------------- Time --------------------

/// Wall-clock time as an offset from the Unix epoch.
pub fn epoch_now() -> Result<Duration> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?)
}

pub(crate) fn duration_ms(value: Duration) -> i64 {
    i64::try_from(value.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_counts_touching_edges() {
        let zone = BoundingBox::new(0, 0, 10, 10);
        let touching = BoundingBox::new(10, 0, 5, 5);
        assert!(zone.overlaps(&touching));
        assert!(touching.overlaps(&zone));

        let corner = BoundingBox::new(10, 10, 3, 3);
        assert!(zone.overlaps(&corner));
    }

    #[test]
    fn overlap_rejects_separated_rectangles() {
        let zone = BoundingBox::new(0, 0, 10, 10);
        assert!(!zone.overlaps(&BoundingBox::new(11, 0, 5, 5)));
        assert!(!zone.overlaps(&BoundingBox::new(0, 11, 5, 5)));
        assert!(!zone.overlaps(&BoundingBox::new(-6, 0, 5, 5)));
    }

    #[test]
    fn overlap_detects_containment() {
        let zone = BoundingBox::new(0, 0, 100, 100);
        assert!(zone.overlaps(&BoundingBox::new(40, 40, 10, 10)));
        assert!(BoundingBox::new(40, 40, 10, 10).overlaps(&zone));
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0, 0, 10, 10);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&BoundingBox::new(20, 20, 10, 10)), 0.0);

        let half = BoundingBox::new(5, 0, 10, 10);
        let expected = 50.0 / 150.0;
        assert!((a.iou(&half) - expected).abs() < 1e-6);
    }

    #[test]
    fn zone_kind_names_round_trip() {
        for kind in ZoneKind::ALL {
            assert_eq!(ZoneKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ZoneKind::parse("bus_lane").is_err());
    }

    #[test]
    fn stream_id_validation() {
        assert!(validate_stream_id("stream:junction_4").is_ok());
        assert!(validate_stream_id("stream:").is_err());
        assert!(validate_stream_id("junction_4").is_err());
        assert!(validate_stream_id("stream:Main St").is_err());
    }
}

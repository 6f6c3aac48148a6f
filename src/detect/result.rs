use serde::{Deserialize, Serialize};

use crate::{BoundingBox, TrackedObjectKey, ZoneKind};

/// One object reported by an `ObjectDetector`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub class_label: String,
    /// Confidence of the classification, `0.0..=1.0`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl DetectedObject {
    pub fn new(class_label: &str, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_label: class_label.to_string(),
            confidence,
            bbox,
        }
    }
}

/// A detection with the identity assigned to it for this frame.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedObject {
    pub key: TrackedObjectKey,
    pub detection: DetectedObject,
}

impl TrackedObject {
    pub fn bbox(&self) -> BoundingBox {
        self.detection.bbox
    }
}

/// Zones found in one frame, split by kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneDetections {
    pub box_junctions: Vec<BoundingBox>,
    pub crossings: Vec<BoundingBox>,
}

impl ZoneDetections {
    pub fn of_kind(&self, kind: ZoneKind) -> &[BoundingBox] {
        match kind {
            ZoneKind::BoxJunction => &self.box_junctions,
            ZoneKind::PedestrianCrossing => &self.crossings,
        }
    }
}

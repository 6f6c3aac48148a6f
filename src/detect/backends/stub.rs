use anyhow::{anyhow, Result};
use std::collections::BTreeSet;

use crate::detect::backend::{ObjectDetector, PlateRecognizer, ZoneDetector};
use crate::detect::result::{DetectedObject, ZoneDetections};
use crate::frame::Frame;
use crate::BoundingBox;

/// Stub object detector that replays a fixed script, one entry per call.
///
/// Used by tests and by the synthetic demo stream, where there is no model to
/// run. Calls listed in `fail_on` return an error instead of detections.
pub struct ScriptedObjectDetector {
    script: Vec<Vec<DetectedObject>>,
    cursor: usize,
    repeat: bool,
    fail_on: BTreeSet<usize>,
}

impl ScriptedObjectDetector {
    pub fn new(script: Vec<Vec<DetectedObject>>) -> Self {
        Self {
            script,
            cursor: 0,
            repeat: false,
            fail_on: BTreeSet::new(),
        }
    }

    /// Restart the script from the top once it runs out.
    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    /// Make the `call`-th invocation (zero-based) fail.
    pub fn failing_at(mut self, call: usize) -> Self {
        self.fail_on.insert(call);
        self
    }

    /// A single car that drives towards `zone`, stops on it for `stop_frames`,
    /// drives off and leaves the scene empty for `gap_frames`.
    pub fn stopping_vehicle(
        zone: BoundingBox,
        approach_frames: usize,
        stop_frames: usize,
        gap_frames: usize,
    ) -> Self {
        let width = (zone.width / 2).max(8);
        let height = (zone.height / 2).max(8);
        let parked_x = zone.x + zone.width / 4;
        let y = zone.y + zone.height / 4;
        let step = (zone.width / 4).max(4);
        let start_x = zone.x - step * approach_frames as i32 - width - 1;

        let mut script = Vec::with_capacity(approach_frames * 2 + stop_frames + gap_frames);
        let car = |x: i32| vec![DetectedObject::new("car", 0.92, BoundingBox::new(x, y, width, height))];
        for i in 0..approach_frames {
            script.push(car(start_x + step * i as i32));
        }
        for _ in 0..stop_frames {
            script.push(car(parked_x));
        }
        let exit_start = zone.x + zone.width + 1;
        for i in 0..approach_frames {
            script.push(car(exit_start + step * i as i32));
        }
        for _ in 0..gap_frames {
            script.push(Vec::new());
        }
        Self::new(script)
    }
}

impl ObjectDetector for ScriptedObjectDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectedObject>> {
        let call = self.cursor;
        self.cursor += 1;
        if self.fail_on.contains(&call) {
            return Err(anyhow!("scripted detector failure at call {}", call));
        }
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let index = if self.repeat {
            call % self.script.len()
        } else {
            call
        };
        Ok(self.script.get(index).cloned().unwrap_or_default())
    }
}

/// Zone detector that reports the same zones for every frame.
pub struct StaticZoneDetector {
    zones: ZoneDetections,
    fail_on: BTreeSet<usize>,
    calls: usize,
}

impl StaticZoneDetector {
    pub fn new(zones: ZoneDetections) -> Self {
        Self {
            zones,
            fail_on: BTreeSet::new(),
            calls: 0,
        }
    }

    pub fn failing_at(mut self, call: usize) -> Self {
        self.fail_on.insert(call);
        self
    }
}

impl ZoneDetector for StaticZoneDetector {
    fn name(&self) -> &'static str {
        "static"
    }

    fn detect_zones(&mut self, _frame: &Frame) -> Result<ZoneDetections> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on.contains(&call) {
            return Err(anyhow!("static zone detector failure at call {}", call));
        }
        Ok(self.zones.clone())
    }
}

/// Plate recogniser that never reads a plate.
#[derive(Default)]
pub struct NoPlateRecognizer;

impl PlateRecognizer for NoPlateRecognizer {
    fn name(&self) -> &'static str {
        "none"
    }

    fn recognize(&mut self, _frame: &Frame, _bbox: BoundingBox) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Plate recogniser that reads the same plate for every vehicle.
pub struct FixedPlateRecognizer {
    plate: String,
}

impl FixedPlateRecognizer {
    pub fn new(plate: &str) -> Self {
        Self {
            plate: plate.to_string(),
        }
    }
}

impl PlateRecognizer for FixedPlateRecognizer {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn recognize(&mut self, _frame: &Frame, _bbox: BoundingBox) -> Result<Option<String>> {
        Ok(Some(self.plate.clone()))
    }
}

use anyhow::Result;

use crate::detect::result::{DetectedObject, ZoneDetections};
use crate::frame::Frame;
use crate::BoundingBox;

/// Object detector capability.
///
/// # Audit Boundary
///
/// Implementations receive the frame read-only for the duration of the call
/// and return geometry only. They MUST NOT:
/// - Retain the frame beyond the `detect` call
/// - Mutate tracker or episode state
///
/// Errors are treated as "detection unavailable" for that frame.
pub trait ObjectDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Classify and localise objects in a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedObject>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Restricted-zone detector capability (pattern/colour based zone localisation).
pub trait ZoneDetector: Send {
    fn name(&self) -> &'static str;

    fn detect_zones(&mut self, frame: &Frame) -> Result<ZoneDetections>;
}

/// Plate recognition capability.
///
/// `Ok(None)` means the plate was not legible; errors are folded into the
/// same absent result by the caller.
pub trait PlateRecognizer: Send {
    fn name(&self) -> &'static str;

    fn recognize(&mut self, frame: &Frame, bbox: BoundingBox) -> Result<Option<String>>;
}

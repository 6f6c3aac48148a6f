mod backend;
pub mod backends;
mod result;
mod tracker;

pub use backend::{ObjectDetector, PlateRecognizer, ZoneDetector};
pub use backends::{FixedPlateRecognizer, NoPlateRecognizer, ScriptedObjectDetector, StaticZoneDetector};
pub use result::{DetectedObject, TrackedObject, ZoneDetections};
pub use tracker::{IouTracker, IouTrackerConfig};

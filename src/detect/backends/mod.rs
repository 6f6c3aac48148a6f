pub mod stub;

pub use stub::{FixedPlateRecognizer, NoPlateRecognizer, ScriptedObjectDetector, StaticZoneDetector};

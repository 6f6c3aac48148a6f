//! Frame ingestion sources.
//!
//! - `stub://<scene>`: deterministic synthetic frames (demo, tests)
//! - a local directory path (optionally `dir://<path>`): still images decoded
//!   in file-name order
//!
//! Frame timestamps are frame time, `frame_index / target_fps`, so dwell
//! accounting is reproducible for recorded input. Sources MUST NOT write
//! frames to disk; only the evidence store does that.

mod image_dir;
mod synthetic;

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::frame::Frame;
use image_dir::ImageDirSource;
use synthetic::SyntheticSource;

#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub url: String,
    pub target_fps: u32,
    /// Frame size for synthetic sources; decoded images keep their own size.
    pub width: u32,
    pub height: u32,
    /// Stop after this many frames (synthetic sources run forever otherwise).
    pub max_frames: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://junction".to_string(),
            target_fps: 20,
            width: 640,
            height: 480,
            max_frames: None,
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(anyhow!("source url must not be empty"));
        }
        if !(1..=120).contains(&self.target_fps) {
            return Err(anyhow!(
                "source target_fps must be in 1..=120 (got {})",
                self.target_fps
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("source frame size must be non-zero"));
        }
        Ok(())
    }
}

/// Frame source.
pub struct FrameSource {
    backend: SourceBackend,
}

enum SourceBackend {
    Synthetic(SyntheticSource),
    ImageDir(ImageDirSource),
}

impl FrameSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        config.validate()?;
        let backend = if let Some(scene) = config.url.strip_prefix("stub://") {
            let scene = scene.to_string();
            SourceBackend::Synthetic(SyntheticSource::new(config, scene))
        } else if let Some(path) = config.url.strip_prefix("dir://") {
            let path = path.to_string();
            SourceBackend::ImageDir(ImageDirSource::new(config, path.into()))
        } else if config.url.contains("://") {
            return Err(anyhow!(
                "unsupported source url {} (expected stub:// or a local directory)",
                config.url
            ));
        } else {
            let path = config.url.clone();
            SourceBackend::ImageDir(ImageDirSource::new(config, path.into()))
        };
        Ok(Self { backend })
    }

    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.connect(),
            SourceBackend::ImageDir(source) => source.connect(),
        }
    }

    /// Next frame, or `None` once the source is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.next_frame(),
            SourceBackend::ImageDir(source) => source.next_frame(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.is_healthy(),
            SourceBackend::ImageDir(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        match &self.backend {
            SourceBackend::Synthetic(source) => source.stats(),
            SourceBackend::ImageDir(source) => source.stats(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub decode_errors: u64,
    pub url: String,
}

fn frame_time(index: u64, fps: u32) -> Duration {
    Duration::from_secs_f64(index as f64 / fps as f64)
}

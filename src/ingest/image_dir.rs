use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::PathBuf;

use super::{frame_time, SourceConfig, SourceStats};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Consecutive decode errors after which the source reports unhealthy.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Still images from a local directory, in file-name order.
pub(super) struct ImageDirSource {
    config: SourceConfig,
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    frames_captured: u64,
    decode_errors: u64,
    consecutive_errors: u32,
    connected: bool,
}

impl ImageDirSource {
    pub(super) fn new(config: SourceConfig, dir: PathBuf) -> Self {
        Self {
            config,
            dir,
            files: Vec::new(),
            cursor: 0,
            frames_captured: 0,
            decode_errors: 0,
            consecutive_errors: 0,
            connected: false,
        }
    }

    pub(super) fn connect(&mut self) -> Result<()> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("reading image directory {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no images found in {}", self.dir.display()));
        }
        files.sort();
        log::info!(
            "FrameSource: connected to {} ({} images @ {} fps)",
            self.dir.display(),
            files.len(),
            self.config.target_fps
        );
        self.files = files;
        self.cursor = 0;
        self.connected = true;
        Ok(())
    }

    /// Decode failures advance past the image and return an error.
    pub(super) fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Err(anyhow!("image directory source not connected"));
        }
        if let Some(max) = self.config.max_frames {
            if self.frames_captured + self.decode_errors >= max {
                return Ok(None);
            }
        }
        let Some(path) = self.files.get(self.cursor).cloned() else {
            return Ok(None);
        };
        let index = self.cursor as u64;
        self.cursor += 1;

        let decoded = image::open(&path).map_err(|e| anyhow!("decode {}: {}", path.display(), e));
        match decoded {
            Ok(img) => {
                let rgb = img.to_rgb8();
                let (width, height) = rgb.dimensions();
                self.frames_captured += 1;
                self.consecutive_errors = 0;
                Ok(Some(Frame::new(
                    frame_time(index, self.config.target_fps),
                    width,
                    height,
                    rgb.into_raw(),
                )))
            }
            Err(e) => {
                self.decode_errors += 1;
                self.consecutive_errors += 1;
                Err(e)
            }
        }
    }

    pub(super) fn is_healthy(&self) -> bool {
        self.connected && self.consecutive_errors < MAX_CONSECUTIVE_ERRORS
    }

    pub(super) fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            decode_errors: self.decode_errors,
            url: self.dir.display().to_string(),
        }
    }
}

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::detect::IouTrackerConfig;
use crate::dwell::DwellConfig;
use crate::episode::EpisodeConfig;
use crate::evidence::{EvidenceConfig, DEFAULT_CLIPS_DIR, DEFAULT_IMAGES_DIR, DEFAULT_MAX_STORAGE_BYTES};
use crate::frame::MAX_BUFFER_FRAMES;
use crate::ingest::SourceConfig;
use crate::pipeline::{PipelineConfig, DEFAULT_TRACKED_CLASSES};

const DEFAULT_DB_PATH: &str = "zone_witness.db";
const DEFAULT_STREAM_ID: &str = "stream:default";
const DEFAULT_SOURCE_URL: &str = "stub://junction";
const DEFAULT_SOURCE_FPS: u32 = 20;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_MIN_STOP_SECS: f64 = 3.0;
const DEFAULT_TIMEOUT_MULTIPLIER: f64 = 2.0;
const DEFAULT_BUFFER_FRAMES: usize = 100;
const DEFAULT_CLIP_FRAMES: usize = 60;
const DEFAULT_CLIP_FPS: u32 = 20;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.7;
const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_QUOTA_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_PERSISTENCE_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize, Default)]
struct ZoneWitnessConfigFile {
    stream_id: Option<String>,
    db_path: Option<String>,
    dwell: Option<DwellConfigFile>,
    storage: Option<StorageConfigFile>,
    clip: Option<ClipConfigFile>,
    detection: Option<DetectionConfigFile>,
    source: Option<SourceConfigFile>,
    buffer_capacity_frames: Option<usize>,
    quota_interval_secs: Option<u64>,
    max_persistence_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DwellConfigFile {
    min_stop_time_secs: Option<f64>,
    timeout_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    images_dir: Option<PathBuf>,
    clips_dir: Option<PathBuf>,
    max_storage_bytes: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct ClipConfigFile {
    frame_count: Option<usize>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence_threshold: Option<f32>,
    tracked_classes: Option<Vec<String>>,
    iou_match_threshold: Option<f32>,
    track_max_idle_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    max_frames: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ZoneWitnessConfig {
    pub stream_id: String,
    pub db_path: String,
    pub dwell: DwellSettings,
    pub storage: StorageSettings,
    pub buffer_capacity_frames: usize,
    pub clip_frame_count: usize,
    pub clip_fps: u32,
    pub detection: DetectionSettings,
    pub quota_interval: Duration,
    pub max_persistence_attempts: u32,
    pub source: SourceConfig,
}

#[derive(Debug, Clone)]
pub struct DwellSettings {
    pub min_stop_time_secs: f64,
    pub timeout_multiplier: f64,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub images_dir: PathBuf,
    pub clips_dir: PathBuf,
    pub max_storage_bytes: u64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub confidence_threshold: f32,
    pub tracked_classes: Vec<String>,
    pub iou_match_threshold: f32,
    /// Track lifetime without a match. `None` uses the dwell stale window.
    pub track_max_idle_secs: Option<f64>,
}

impl ZoneWitnessConfig {
    /// Defaults, then the file named by `ZONE_WITNESS_CONFIG` (JSON, or TOML
    /// for a `.toml` path), then `ZONE_WITNESS_*` overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ZONE_WITNESS_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ZoneWitnessConfigFile) -> Self {
        let dwell = file.dwell.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let clip = file.clip.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let source = file.source.unwrap_or_default();

        Self {
            stream_id: file
                .stream_id
                .unwrap_or_else(|| DEFAULT_STREAM_ID.to_string()),
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            dwell: DwellSettings {
                min_stop_time_secs: dwell.min_stop_time_secs.unwrap_or(DEFAULT_MIN_STOP_SECS),
                timeout_multiplier: dwell
                    .timeout_multiplier
                    .unwrap_or(DEFAULT_TIMEOUT_MULTIPLIER),
            },
            storage: StorageSettings {
                images_dir: storage
                    .images_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGES_DIR)),
                clips_dir: storage
                    .clips_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CLIPS_DIR)),
                max_storage_bytes: storage
                    .max_storage_bytes
                    .unwrap_or(DEFAULT_MAX_STORAGE_BYTES),
                jpeg_quality: storage.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            buffer_capacity_frames: file
                .buffer_capacity_frames
                .unwrap_or(DEFAULT_BUFFER_FRAMES),
            clip_frame_count: clip.frame_count.unwrap_or(DEFAULT_CLIP_FRAMES),
            clip_fps: clip.fps.unwrap_or(DEFAULT_CLIP_FPS),
            detection: DetectionSettings {
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(DEFAULT_MIN_CONFIDENCE),
                tracked_classes: detection.tracked_classes.unwrap_or_else(|| {
                    DEFAULT_TRACKED_CLASSES.iter().map(|c| c.to_string()).collect()
                }),
                iou_match_threshold: detection
                    .iou_match_threshold
                    .unwrap_or(DEFAULT_IOU_THRESHOLD),
                track_max_idle_secs: detection.track_max_idle_secs,
            },
            quota_interval: Duration::from_secs(
                file.quota_interval_secs
                    .unwrap_or(DEFAULT_QUOTA_INTERVAL_SECS),
            ),
            max_persistence_attempts: file
                .max_persistence_attempts
                .unwrap_or(DEFAULT_MAX_PERSISTENCE_ATTEMPTS),
            source: SourceConfig {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
                max_frames: source.max_frames,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(secs) = env_parse::<f64>("ZONE_WITNESS_MIN_STOP_SECS")? {
            self.dwell.min_stop_time_secs = secs;
        }
        if let Some(multiplier) = env_parse::<f64>("ZONE_WITNESS_TIMEOUT_MULTIPLIER")? {
            self.dwell.timeout_multiplier = multiplier;
        }
        if let Some(bytes) = env_parse::<u64>("ZONE_WITNESS_MAX_STORAGE_BYTES")? {
            self.storage.max_storage_bytes = bytes;
        }
        if let Some(frames) = env_parse::<usize>("ZONE_WITNESS_BUFFER_FRAMES")? {
            self.buffer_capacity_frames = frames;
        }
        if let Some(frames) = env_parse::<usize>("ZONE_WITNESS_CLIP_FRAMES")? {
            self.clip_frame_count = frames;
        }
        if let Some(confidence) = env_parse::<f32>("ZONE_WITNESS_MIN_CONFIDENCE")? {
            self.detection.confidence_threshold = confidence;
        }
        if let Some(root) = env_string("ZONE_WITNESS_STORAGE_ROOT") {
            let root = PathBuf::from(root);
            self.storage.images_dir = root.join("images");
            self.storage.clips_dir = root.join("videos");
        }
        if let Some(path) = env_string("ZONE_WITNESS_DB_PATH") {
            self.db_path = path;
        }
        if let Some(url) = env_string("ZONE_WITNESS_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(stream_id) = env_string("ZONE_WITNESS_STREAM_ID") {
            self.stream_id = stream_id;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        crate::validate_stream_id(&self.stream_id)?;

        let min_stop = self.dwell.min_stop_time_secs;
        if !min_stop.is_finite() || min_stop <= 0.0 {
            return Err(anyhow!("min_stop_time_secs must be greater than zero"));
        }
        if !self.dwell.timeout_multiplier.is_finite() || self.dwell.timeout_multiplier < 1.0 {
            return Err(anyhow!("timeout_multiplier must be at least 1"));
        }
        if self.storage.max_storage_bytes == 0 {
            return Err(anyhow!("max_storage_bytes must be greater than zero"));
        }
        if !(1..=100).contains(&self.storage.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be in 1..=100"));
        }
        if self.buffer_capacity_frames == 0 || self.buffer_capacity_frames > MAX_BUFFER_FRAMES {
            return Err(anyhow!(
                "buffer_capacity_frames must be in 1..={}",
                MAX_BUFFER_FRAMES
            ));
        }
        if self.clip_frame_count == 0 {
            return Err(anyhow!("clip_frame_count must be at least 1"));
        }
        if self.clip_frame_count > self.buffer_capacity_frames {
            log::warn!(
                "clip_frame_count {} exceeds buffer_capacity_frames {}; clamping",
                self.clip_frame_count,
                self.buffer_capacity_frames
            );
            self.clip_frame_count = self.buffer_capacity_frames;
        }
        if self.clip_fps == 0 {
            return Err(anyhow!("clip fps must be greater than zero"));
        }

        let confidence = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!("confidence_threshold must be in 0..=1"));
        }
        let iou = self.detection.iou_match_threshold;
        if !(iou > 0.0 && iou <= 1.0) {
            return Err(anyhow!("iou_match_threshold must be in (0, 1]"));
        }
        self.detection.tracked_classes = self
            .detection
            .tracked_classes
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        if self.detection.tracked_classes.is_empty() {
            return Err(anyhow!("tracked_classes must name at least one class"));
        }

        if self.quota_interval.is_zero() {
            return Err(anyhow!("quota_interval_secs must be greater than zero"));
        }
        if self.max_persistence_attempts == 0 {
            return Err(anyhow!("max_persistence_attempts must be at least 1"));
        }
        self.dwell_config()?;
        self.track_max_idle()?;
        self.source.validate()?;
        Ok(())
    }

    pub fn dwell_config(&self) -> Result<DwellConfig> {
        DwellConfig::new(
            secs_to_duration("min_stop_time_secs", self.dwell.min_stop_time_secs)?,
            self.dwell.timeout_multiplier,
        )
    }

    fn track_max_idle(&self) -> Result<Duration> {
        match self.detection.track_max_idle_secs {
            Some(secs) => secs_to_duration("track_max_idle_secs", secs),
            None => Ok(self.dwell_config()?.stale_after()),
        }
    }

    pub fn evidence_config(&self) -> EvidenceConfig {
        EvidenceConfig {
            images_dir: self.storage.images_dir.clone(),
            clips_dir: self.storage.clips_dir.clone(),
            max_storage_bytes: self.storage.max_storage_bytes,
            jpeg_quality: self.storage.jpeg_quality,
        }
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        Ok(PipelineConfig {
            dwell: self.dwell_config()?,
            episodes: EpisodeConfig {
                stream_id: self.stream_id.clone(),
                clip_frame_count: self.clip_frame_count,
                clip_fps: self.clip_fps,
                max_persistence_attempts: self.max_persistence_attempts,
            },
            tracker: IouTrackerConfig {
                match_threshold: self.detection.iou_match_threshold,
                max_idle: self.track_max_idle()?,
            },
            confidence_threshold: self.detection.confidence_threshold,
            tracked_classes: self.detection.tracked_classes.clone(),
            buffer_capacity: self.buffer_capacity_frames,
            maintenance_interval: self.quota_interval,
        })
    }

    pub fn source_config(&self) -> SourceConfig {
        self.source.clone()
    }
}

fn read_config_file(path: &Path) -> Result<ZoneWitnessConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn secs_to_duration(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{} is out of range (got {})", name, secs))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value)),
    }
}

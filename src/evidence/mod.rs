//! Evidence artifact storage.
//!
//! The store writes violation stills (JPEG) and clips (Motion-JPEG) under two
//! local roots and keeps their aggregate size under a byte budget.
//!
//! Writes go to a dot-prefixed `.partial` staging file that is renamed into
//! place once synced, and the final path is held in an in-flight registry
//! until the write returns. Quota enforcement never counts or deletes staged
//! or in-flight files. One writer is assumed to own the evidence roots.

mod encode;
mod quota;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::frame::Frame;
use crate::{duration_ms, epoch_now, TrackedObjectKey};

pub use quota::QuotaReport;

pub const DEFAULT_IMAGES_DIR: &str = "storage/images";
pub const DEFAULT_CLIPS_DIR: &str = "storage/videos";
pub const DEFAULT_MAX_STORAGE_BYTES: u64 = 1024 * 1024 * 1024;

const STAGING_SUFFIX: &str = ".partial";
const IMAGE_EXT: &str = "jpg";
const CLIP_EXT: &str = "mjpeg";

#[derive(Clone, Debug)]
pub struct EvidenceConfig {
    pub images_dir: PathBuf,
    pub clips_dir: PathBuf,
    pub max_storage_bytes: u64,
    pub jpeg_quality: u8,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            clips_dir: PathBuf::from(DEFAULT_CLIPS_DIR),
            max_storage_bytes: DEFAULT_MAX_STORAGE_BYTES,
            jpeg_quality: 85,
        }
    }
}

impl EvidenceConfig {
    /// Images and clips under one root directory.
    pub fn under_root(root: &Path, max_storage_bytes: u64) -> Self {
        Self {
            images_dir: root.join("images"),
            clips_dir: root.join("videos"),
            max_storage_bytes,
            ..Self::default()
        }
    }
}

/// One artifact written by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(with = "hex_digest")]
    pub sha256: [u8; 32],
}

/// Evidence captured for one episode. Either artifact may be absent when its
/// write failed or was refused.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub image: Option<EvidenceFile>,
    pub clip: Option<EvidenceFile>,
    /// Capture time as an offset from the Unix epoch.
    pub created_at: Duration,
}

impl EvidenceBundle {
    pub fn image_path(&self) -> Option<&Path> {
        self.image.as_ref().map(|f| f.path.as_path())
    }

    pub fn clip_path(&self) -> Option<&Path> {
        self.clip.as_ref().map(|f| f.path.as_path())
    }

    pub fn is_complete(&self) -> bool {
        self.image.is_some() && self.clip.is_some()
    }
}

pub struct EvidenceStore {
    images_dir: PathBuf,
    clips_dir: PathBuf,
    max_storage_bytes: u64,
    jpeg_quality: u8,
    in_flight: Mutex<BTreeSet<PathBuf>>,
    sequence: AtomicU64,
    exhausted: AtomicBool,
}

impl EvidenceStore {
    /// Create both roots and remove staging files left by an interrupted run.
    pub fn open(cfg: EvidenceConfig) -> Result<Self> {
        if cfg.max_storage_bytes == 0 {
            return Err(anyhow!("max_storage_bytes must be greater than zero"));
        }
        if !(1..=100).contains(&cfg.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be in 1..=100"));
        }
        fs::create_dir_all(&cfg.images_dir)?;
        fs::create_dir_all(&cfg.clips_dir)?;
        let store = Self {
            images_dir: cfg.images_dir,
            clips_dir: cfg.clips_dir,
            max_storage_bytes: cfg.max_storage_bytes,
            jpeg_quality: cfg.jpeg_quality,
            in_flight: Mutex::new(BTreeSet::new()),
            sequence: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
        };
        let swept = store.sweep_staging()?;
        if swept > 0 {
            log::warn!("removed {} interrupted evidence write(s)", swept);
        }
        Ok(store)
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn clips_dir(&self) -> &Path {
        &self.clips_dir
    }

    pub fn max_storage_bytes(&self) -> u64 {
        self.max_storage_bytes
    }

    /// True after an eviction pass could not get back under budget. New
    /// writes are refused until a later pass succeeds.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight().len()
    }

    /// Save a still of `frame` for `key`.
    pub fn save_image(&self, frame: &Frame, key: &TrackedObjectKey) -> Result<EvidenceFile> {
        let bytes = encode::encode_jpeg(frame, self.jpeg_quality)?;
        let path = self.artifact_path(&self.images_dir, key, IMAGE_EXT)?;
        self.write_artifact(&path, &bytes)
    }

    /// Save `frames` as a clip for `key`. An empty sequence writes nothing.
    pub fn save_clip(&self, frames: &[Frame], key: &TrackedObjectKey) -> Result<Option<EvidenceFile>> {
        if frames.is_empty() {
            return Ok(None);
        }
        let bytes = encode::encode_mjpeg(frames, self.jpeg_quality)?;
        let path = self.artifact_path(&self.clips_dir, key, CLIP_EXT)?;
        self.write_artifact(&path, &bytes).map(Some)
    }

    /// `{key}_{epoch millis}_{sequence}.{ext}`; the per-store sequence keeps
    /// names unique within one millisecond.
    fn artifact_path(&self, dir: &Path, key: &TrackedObjectKey, ext: &str) -> Result<PathBuf> {
        let millis = duration_ms(epoch_now()?);
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(dir.join(format!("{}_{:013}_{:06}.{}", key, millis, seq, ext)))
    }

    fn write_artifact(&self, path: &Path, bytes: &[u8]) -> Result<EvidenceFile> {
        if self.is_exhausted() {
            return Err(anyhow!(
                "evidence store over budget; write of {} refused",
                path.display()
            ));
        }
        let size_bytes = bytes.len() as u64;
        if size_bytes > self.max_storage_bytes {
            return Err(anyhow!(
                "artifact of {} bytes exceeds evidence budget of {} bytes",
                size_bytes,
                self.max_storage_bytes
            ));
        }
        if path.exists() {
            return Err(anyhow!("evidence file already exists: {}", path.display()));
        }

        let _guard = InFlightGuard::register(self, path);
        write_staged(path, bytes)?;

        Ok(EvidenceFile {
            path: path.to_path_buf(),
            size_bytes,
            sha256: Sha256::digest(bytes).into(),
        })
    }

    fn in_flight(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        // The set holds plain paths; a panic elsewhere cannot leave it inconsistent.
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweep_staging(&self) -> Result<usize> {
        let mut removed = 0;
        for root in [&self.images_dir, &self.clips_dir] {
            for path in walk_files(root)? {
                if is_staging(&path) {
                    match fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) => log::warn!(
                            "failed to remove staging file {}: {}",
                            path.display(),
                            e
                        ),
                    }
                }
            }
        }
        Ok(removed)
    }
}

struct InFlightGuard<'a> {
    store: &'a EvidenceStore,
    path: PathBuf,
}

impl<'a> InFlightGuard<'a> {
    fn register(store: &'a EvidenceStore, path: &Path) -> Self {
        store.in_flight().insert(path.to_path_buf());
        Self {
            store,
            path: path.to_path_buf(),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.store.in_flight().remove(&self.path);
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}{}", name, STAGING_SUFFIX))
}

fn is_staging(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(STAGING_SUFFIX))
        .unwrap_or(false)
}

fn write_staged(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = staging_path(path);
    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Regular files under `root`, recursively.
fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                out.push(entry.path());
            }
        }
    }
    out.sort();
    Ok(out)
}

mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(digest: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let value = String::deserialize(d)?;
        let bytes = hex::decode(&value).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("sha256 digest must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(t: u64) -> Frame {
        Frame::new(Duration::from_secs(t), 8, 6, vec![(t % 256) as u8; 8 * 6 * 3])
    }

    fn open_store(root: &Path, budget: u64) -> EvidenceStore {
        EvidenceStore::open(EvidenceConfig::under_root(root, budget)).unwrap()
    }

    #[test]
    fn save_image_writes_under_images_root() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 1 << 20);
        let key = TrackedObjectKey(42);

        let file = store.save_image(&frame(1), &key)?;
        assert!(file.path.starts_with(store.images_dir()));
        let name = file.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("obj-42_"));
        assert!(name.ends_with(".jpg"));
        let on_disk = fs::read(&file.path)?;
        assert_eq!(on_disk.len() as u64, file.size_bytes);
        assert_eq!(file.sha256, <[u8; 32]>::from(Sha256::digest(&on_disk)));
        assert_eq!(store.in_flight_count(), 0);
        Ok(())
    }

    #[test]
    fn save_clip_with_no_frames_creates_nothing() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 1 << 20);
        assert!(store.save_clip(&[], &TrackedObjectKey(1))?.is_none());
        assert!(walk_files(store.clips_dir())?.is_empty());
        Ok(())
    }

    #[test]
    fn save_clip_writes_mjpeg_under_clips_root() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 1 << 20);
        let frames: Vec<_> = (0..5).map(frame).collect();
        let clip = store.save_clip(&frames, &TrackedObjectKey(3))?.unwrap();
        assert!(clip.path.starts_with(store.clips_dir()));
        assert!(clip.path.to_string_lossy().ends_with(".mjpeg"));
        Ok(())
    }

    #[test]
    fn names_are_unique_for_repeated_saves() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 1 << 20);
        let key = TrackedObjectKey(5);
        let a = store.save_image(&frame(1), &key)?;
        let b = store.save_image(&frame(1), &key)?;
        assert_ne!(a.path, b.path);
        Ok(())
    }

    #[test]
    fn oversized_artifact_is_refused() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 16);
        assert!(store.save_image(&frame(1), &TrackedObjectKey(1)).is_err());
        assert!(walk_files(store.images_dir())?.is_empty());
        Ok(())
    }

    #[test]
    fn open_sweeps_interrupted_writes() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let cfg = EvidenceConfig::under_root(temp_dir.path(), 1 << 20);
        fs::create_dir_all(&cfg.images_dir)?;
        let stale = cfg.images_dir.join(".obj-1_0000000000000_000000.jpg.partial");
        fs::write(&stale, b"half a jpeg")?;

        let _store = EvidenceStore::open(cfg)?;
        assert!(!stale.exists());
        Ok(())
    }

    #[test]
    fn evidence_file_serializes_digest_as_hex() -> Result<()> {
        let file = EvidenceFile {
            path: PathBuf::from("storage/images/a.jpg"),
            size_bytes: 3,
            sha256: [0xab; 32],
        };
        let json = serde_json::to_string(&file)?;
        assert!(json.contains(&"ab".repeat(32)));
        let back: EvidenceFile = serde_json::from_str(&json)?;
        assert_eq!(back, file);
        Ok(())
    }
}

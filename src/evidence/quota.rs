//! Oldest-first eviction under the evidence byte budget.

use anyhow::Result;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{is_staging, walk_files, EvidenceStore};

/// Outcome of one `enforce_quota` pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaReport {
    pub budget_bytes: u64,
    pub files_considered: usize,
    pub total_bytes_before: u64,
    pub total_bytes_after: u64,
    /// Deleted files, in deletion order.
    pub deleted: Vec<PathBuf>,
    pub bytes_freed: u64,
    /// Files that alone exceeded the budget.
    pub oversized: Vec<PathBuf>,
    /// Still above budget after the pass; writes are refused until a later
    /// pass gets back under.
    pub over_budget: bool,
}

#[derive(Clone, Debug)]
struct ManagedFile {
    path: PathBuf,
    size: u64,
    created: SystemTime,
}

impl EvidenceStore {
    /// Total bytes of all completed artifacts under both roots.
    pub fn total_bytes(&self) -> Result<u64> {
        Ok(self.managed_files()?.iter().map(|f| f.size).sum())
    }

    /// Delete artifacts oldest-first until the total is within budget.
    ///
    /// Order is ascending creation time, ties broken by full path. Files that
    /// alone exceed the budget can never be retained within it and are
    /// evicted before anything else, so no other file is deleted on their
    /// account. Staged and in-flight files are neither counted nor deleted.
    ///
    /// Idempotent: with no writes in between, a second call deletes nothing.
    pub fn enforce_quota(&self) -> Result<QuotaReport> {
        let budget = self.max_storage_bytes;
        let mut files = self.managed_files()?;
        let total_before: u64 = files.iter().map(|f| f.size).sum();

        let mut report = QuotaReport {
            budget_bytes: budget,
            files_considered: files.len(),
            total_bytes_before: total_before,
            total_bytes_after: total_before,
            ..QuotaReport::default()
        };

        if total_before <= budget {
            self.exhausted.store(false, Ordering::SeqCst);
            return Ok(report);
        }

        files.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.path.cmp(&b.path)));
        let (oversized, regular): (Vec<_>, Vec<_>) =
            files.into_iter().partition(|f| f.size > budget);

        let mut total = total_before;
        for file in &oversized {
            log::warn!(
                "evidence artifact {} ({} bytes) alone exceeds budget of {} bytes",
                file.path.display(),
                file.size,
                budget
            );
            report.oversized.push(file.path.clone());
        }
        for file in oversized.iter().chain(regular.iter()) {
            if total <= budget {
                break;
            }
            if let Err(e) = fs::remove_file(&file.path) {
                log::warn!(
                    "failed to delete {} during quota enforcement: {}",
                    file.path.display(),
                    e
                );
                continue;
            }
            total -= file.size;
            report.bytes_freed += file.size;
            report.deleted.push(file.path.clone());
            log::debug!(
                "evicted {} ({} bytes) for quota enforcement",
                file.path.display(),
                file.size
            );
        }

        report.total_bytes_after = total;
        report.over_budget = total > budget;
        self.exhausted.store(report.over_budget, Ordering::SeqCst);

        if report.over_budget {
            log::warn!(
                "evidence store still over budget after eviction: {} > {} bytes; refusing new writes",
                total,
                budget
            );
        } else if !report.deleted.is_empty() {
            log::info!(
                "evidence quota enforced: deleted={} bytes_freed={} total={}",
                report.deleted.len(),
                report.bytes_freed,
                total
            );
        }
        Ok(report)
    }

    fn managed_files(&self) -> Result<Vec<ManagedFile>> {
        let in_flight: BTreeSet<PathBuf> = self.in_flight().clone();
        let mut out = Vec::new();
        for root in [&self.images_dir, &self.clips_dir] {
            for path in walk_files(root)? {
                if is_staging(&path) || in_flight.contains(&path) {
                    continue;
                }
                // A file can vanish between listing and stat.
                let Ok(meta) = fs::metadata(&path) else {
                    continue;
                };
                let created = meta
                    .created()
                    .or_else(|_| meta.modified())
                    .unwrap_or(UNIX_EPOCH);
                out.push(ManagedFile {
                    path,
                    size: meta.len(),
                    created,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceConfig, InFlightGuard};
    use std::path::Path;
    use std::thread::sleep;
    use std::time::Duration;

    const MB: u64 = 1024 * 1024;

    fn open_store(root: &Path, budget: u64) -> EvidenceStore {
        EvidenceStore::open(EvidenceConfig::under_root(root, budget)).unwrap()
    }

    fn write_file(dir: &Path, name: &str, size: u64) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; size as usize]).unwrap();
        // distinct creation times on coarse-grained filesystems
        sleep(Duration::from_millis(20));
        path
    }

    #[test]
    fn evicts_oldest_file_to_get_under_budget() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 10 * MB);
        let first = write_file(store.images_dir(), "a.jpg", 4 * MB);
        let second = write_file(store.clips_dir(), "b.mjpeg", 4 * MB);
        let third = write_file(store.images_dir(), "c.jpg", 4 * MB);

        let report = store.enforce_quota()?;
        assert_eq!(report.deleted, vec![first.clone()]);
        assert_eq!(report.total_bytes_before, 12 * MB);
        assert_eq!(report.total_bytes_after, 8 * MB);
        assert!(!report.over_budget);
        assert!(!first.exists());
        assert!(second.exists() && third.exists());
        assert_eq!(store.total_bytes()?, 8 * MB);
        Ok(())
    }

    #[test]
    fn second_pass_without_writes_deletes_nothing() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 10 * MB);
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            write_file(store.images_dir(), name, 4 * MB);
        }
        assert_eq!(store.enforce_quota()?.deleted.len(), 1);
        let again = store.enforce_quota()?;
        assert!(again.deleted.is_empty());
        assert_eq!(again.total_bytes_after, 8 * MB);
        Ok(())
    }

    #[test]
    fn oversized_file_is_evicted_without_touching_others() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 1000);
        let small_old = write_file(store.images_dir(), "a.jpg", 300);
        let huge = write_file(store.clips_dir(), "b.mjpeg", 5000);
        let small_new = write_file(store.images_dir(), "c.jpg", 300);

        let report = store.enforce_quota()?;
        assert_eq!(report.oversized, vec![huge.clone()]);
        assert_eq!(report.deleted, vec![huge]);
        assert!(small_old.exists() && small_new.exists());
        assert_eq!(report.total_bytes_after, 600);
        Ok(())
    }

    #[test]
    fn staged_and_in_flight_files_are_excluded() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 100);
        let staged = write_file(store.images_dir(), ".x.jpg.partial", 500);
        let writing = write_file(store.images_dir(), "y.jpg", 500);
        let done = write_file(store.images_dir(), "z.jpg", 50);

        let _guard = InFlightGuard::register(&store, &writing);
        let report = store.enforce_quota()?;
        assert_eq!(report.files_considered, 1);
        assert_eq!(report.total_bytes_before, 50);
        assert!(report.deleted.is_empty());
        assert!(staged.exists() && writing.exists() && done.exists());
        Ok(())
    }

    #[test]
    fn ties_on_creation_time_break_by_path() {
        let created = UNIX_EPOCH;
        let mut files = vec![
            ManagedFile {
                path: PathBuf::from("/e/videos/b"),
                size: 1,
                created,
            },
            ManagedFile {
                path: PathBuf::from("/e/images/z"),
                size: 1,
                created,
            },
        ];
        files.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.path.cmp(&b.path)));
        assert_eq!(files[0].path, PathBuf::from("/e/images/z"));
    }

    #[test]
    fn writes_are_refused_while_over_budget() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = open_store(temp_dir.path(), 100_000);
        let frame = crate::Frame::new(Duration::ZERO, 4, 4, vec![0; 48]);
        let key = crate::TrackedObjectKey(1);

        store.exhausted.store(true, Ordering::SeqCst);
        assert!(store.save_image(&frame, &key).is_err());

        // back under budget: the flag clears and writes resume
        let report = store.enforce_quota()?;
        assert!(!report.over_budget);
        assert!(!store.is_exhausted());
        assert!(store.save_image(&frame, &key).is_ok());
        Ok(())
    }
}

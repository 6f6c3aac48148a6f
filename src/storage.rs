use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::evidence::EvidenceBundle;
use crate::{epoch_now, BoundingBox, EpisodeStatus, TrackedObjectKey, ZoneKind};

/// Metadata persisted for one violation episode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpisodeData {
    pub stream_id: String,
    pub violation_type: ZoneKind,
    pub tracked_key: TrackedObjectKey,
    /// Frame time at which the object entered the zone.
    pub started_at: Duration,
    pub dwell_secs: f64,
    /// Zone region the object was first found overlapping.
    pub location: BoundingBox,
    pub object_bbox: BoundingBox,
    pub license_plate: Option<String>,
    pub evidence: EvidenceBundle,
    pub clip_fps: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub id: String,
    /// Unix seconds at `create`.
    pub created_at: i64,
    pub status: EpisodeStatus,
    pub data: EpisodeData,
}

/// Episode metadata store.
///
/// `create` stores the record as `pending` and returns its id; the caller
/// confirms it with `update_status(id, Recorded)` once the episode is
/// complete.
pub trait PersistenceAdapter: Send {
    fn create(&mut self, data: &EpisodeData) -> Result<String>;

    fn update_status(&mut self, id: &str, status: EpisodeStatus) -> Result<()>;

    fn fetch(&mut self, id: &str) -> Result<Option<EpisodeRecord>>;

    /// Most recently created records first.
    fn list_recent(&mut self, limit: usize) -> Result<Vec<EpisodeRecord>>;
}

/// Random 128-bit id, hex encoded.
fn new_episode_id() -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

fn created_now() -> Result<i64> {
    i64::try_from(epoch_now()?.as_secs()).map_err(|_| anyhow!("clock exceeds i64 range"))
}

pub struct SqliteEpisodeStore {
    conn: Connection,
}

impl SqliteEpisodeStore {
    /// Open (or create) the store at `db_path`; `:memory:` is accepted.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS episodes (
              id TEXT PRIMARY KEY,
              created_at INTEGER NOT NULL,
              violation_type TEXT NOT NULL,
              license_plate TEXT,
              status TEXT NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_created ON episodes(created_at);
            "#,
        )?;
        Ok(())
    }

    fn decode_row(
        id: String,
        created_at: i64,
        status: String,
        payload_json: String,
    ) -> Result<EpisodeRecord> {
        let data: EpisodeData = serde_json::from_str(&payload_json)
            .map_err(|e| anyhow!("corrupt episode {}: {}", id, e))?;
        Ok(EpisodeRecord {
            status: EpisodeStatus::parse(&status)?,
            id,
            created_at,
            data,
        })
    }
}

impl PersistenceAdapter for SqliteEpisodeStore {
    fn create(&mut self, data: &EpisodeData) -> Result<String> {
        let id = new_episode_id();
        let payload_json = serde_json::to_string(data)?;
        self.conn.execute(
            r#"
            INSERT INTO episodes(id, created_at, violation_type, license_plate, status, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                id,
                created_now()?,
                data.violation_type.as_str(),
                data.license_plate,
                EpisodeStatus::Pending.as_str(),
                payload_json
            ],
        )?;
        Ok(id)
    }

    fn update_status(&mut self, id: &str, status: EpisodeStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE episodes SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            return Err(anyhow!("unknown episode id {}", id));
        }
        Ok(())
    }

    fn fetch(&mut self, id: &str) -> Result<Option<EpisodeRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, created_at, status, payload_json FROM episodes WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, created_at, status, payload)| Self::decode_row(id, created_at, status, payload))
            .transpose()
    }

    fn list_recent(&mut self, limit: usize) -> Result<Vec<EpisodeRecord>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                "SELECT id, created_at, status, payload_json FROM episodes \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ));
            }
            out
        };

        rows.into_iter()
            .map(|(id, created_at, status, payload)| Self::decode_row(id, created_at, status, payload))
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryEpisodeStore {
    records: Vec<EpisodeRecord>,
}

impl InMemoryEpisodeStore {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EpisodeRecord] {
        &self.records
    }
}

impl PersistenceAdapter for InMemoryEpisodeStore {
    fn create(&mut self, data: &EpisodeData) -> Result<String> {
        let id = new_episode_id();
        self.records.push(EpisodeRecord {
            id: id.clone(),
            created_at: created_now()?,
            status: EpisodeStatus::Pending,
            data: data.clone(),
        });
        Ok(id)
    }

    fn update_status(&mut self, id: &str, status: EpisodeStatus) -> Result<()> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("unknown episode id {}", id))?;
        record.status = status;
        Ok(())
    }

    fn fetch(&mut self, id: &str) -> Result<Option<EpisodeRecord>> {
        Ok(self.records.iter().find(|r| r.id == id).cloned())
    }

    fn list_recent(&mut self, limit: usize) -> Result<Vec<EpisodeRecord>> {
        Ok(self.records.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample(key: u64, plate: Option<&str>) -> EpisodeData {
        EpisodeData {
            stream_id: "stream:junction".to_string(),
            violation_type: ZoneKind::BoxJunction,
            tracked_key: TrackedObjectKey(key),
            started_at: Duration::from_secs(12),
            dwell_secs: 3.0,
            location: BoundingBox::new(100, 100, 200, 120),
            object_bbox: BoundingBox::new(140, 120, 60, 40),
            license_plate: plate.map(str::to_string),
            evidence: EvidenceBundle {
                image: None,
                clip: None,
                created_at: Duration::from_secs(1_700_000_000),
            },
            clip_fps: 20,
        }
    }

    fn exercise(store: &mut dyn PersistenceAdapter) -> Result<()> {
        let id = store.create(&sample(7, Some("KA01AB1234")))?;
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let fetched = store.fetch(&id)?.unwrap();
        assert_eq!(fetched.status, EpisodeStatus::Pending);
        assert_eq!(fetched.data, sample(7, Some("KA01AB1234")));

        store.update_status(&id, EpisodeStatus::Recorded)?;
        assert_eq!(store.fetch(&id)?.unwrap().status, EpisodeStatus::Recorded);

        assert!(store.fetch("0000")?.is_none());
        assert!(store.update_status("0000", EpisodeStatus::Recorded).is_err());

        let second = store.create(&sample(8, None))?;
        assert_ne!(id, second);
        let recent = store.list_recent(10)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second);
        assert_eq!(store.list_recent(1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn sqlite_store_round_trips_records() -> Result<()> {
        let mut store = SqliteEpisodeStore::open(":memory:")?;
        exercise(&mut store)
    }

    #[test]
    fn in_memory_store_round_trips_records() -> Result<()> {
        let mut store = InMemoryEpisodeStore::default();
        exercise(&mut store)?;
        assert_eq!(store.len(), 2);
        Ok(())
    }

    #[test]
    fn sqlite_store_persists_across_reopen() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let db_path = temp_dir.path().join("episodes.db");
        let db_path = db_path.to_string_lossy().into_owned();

        let mut data = sample(3, None);
        data.evidence.image = Some(crate::evidence::EvidenceFile {
            path: PathBuf::from("storage/images/obj-3_0000000000001_000000.jpg"),
            size_bytes: 1234,
            sha256: [7u8; 32],
        });
        let id = {
            let mut store = SqliteEpisodeStore::open(&db_path)?;
            store.create(&data)?
        };

        let mut reopened = SqliteEpisodeStore::open(&db_path)?;
        let record = reopened.fetch(&id)?.unwrap();
        assert_eq!(record.data, data);
        assert_eq!(record.data.license_plate, None);
        Ok(())
    }
}

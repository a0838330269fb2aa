//! Persistent history storage for odometry events.
//!
//! One JSON object per line, append-only. The last line carrying a pose is
//! the authoritative restart pose; truncation happens only through
//! [`JsonlHistoryStore::clear`].

use crate::error::{Error, Result};
use crate::geometry::Pose;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One odometry history line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Server time, microseconds since the Unix epoch.
    pub ts: u64,
    /// "reset" or "update".
    pub event: String,
    /// Integration source: "encoders", "distance" or "snap". Absent on reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
    /// Step translation, millimetres.
    #[serde(default)]
    pub distance_mm: f64,
    /// Step rotation, degrees.
    #[serde(default)]
    pub angle_deg: f64,
}

impl HistoryRecord {
    fn now_us() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    pub fn reset(pose: Pose) -> Self {
        Self {
            ts: Self::now_us(),
            event: "reset".to_string(),
            source: None,
            x_mm: pose.x_mm,
            y_mm: pose.y_mm,
            theta_deg: pose.theta_deg,
            distance_mm: 0.0,
            angle_deg: 0.0,
        }
    }

    pub fn update(pose: Pose, source: &str, distance_mm: f64, angle_deg: f64) -> Self {
        Self {
            ts: Self::now_us(),
            event: "update".to_string(),
            source: Some(source.to_string()),
            x_mm: pose.x_mm,
            y_mm: pose.y_mm,
            theta_deg: pose.theta_deg,
            distance_mm,
            angle_deg,
        }
    }

    pub fn pose(&self) -> Pose {
        Pose::new(self.x_mm, self.y_mm, self.theta_deg)
    }
}

/// Append-only JSON-lines store, line-buffered.
pub struct JsonlHistoryStore {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl JsonlHistoryStore {
    /// Open (or create) the store. Parent directories are created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            writer: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush the line.
    pub fn append(&self, record: &HistoryRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut guard = self.writer.lock().map_err(|_| Error::MutexPoisoned)?;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *guard = Some(BufWriter::new(file));
        }
        let writer = guard.as_mut().expect("writer opened above");
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    /// Truncate the file. The only permitted non-append operation.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.writer.lock().map_err(|_| Error::MutexPoisoned)?;
        *guard = None;
        File::create(&self.path)?;
        Ok(())
    }

    /// The pose of the last parseable line, if any.
    ///
    /// Unparseable or incomplete trailing lines (a crash mid-write) are
    /// skipped; the scan walks backwards to the newest intact record.
    pub fn last_pose(&self) -> Option<Pose> {
        let text = fs::read_to_string(&self.path).ok()?;
        for line in text.lines().rev() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<HistoryRecord>(line) {
                return Some(record.pose());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_restore_last_pose() {
        let dir = tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path().join("history.jsonl")).unwrap();

        store.append(&HistoryRecord::reset(Pose::new(10.0, 20.0, 0.0))).unwrap();
        store
            .append(&HistoryRecord::update(
                Pose::new(1234.0, 567.0, 45.0),
                "encoders",
                30.0,
                5.0,
            ))
            .unwrap();

        let pose = store.last_pose().unwrap();
        assert_eq!(pose, Pose::new(1234.0, 567.0, 45.0));
    }

    #[test]
    fn test_restored_pose_is_bit_exact() {
        let dir = tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path().join("history.jsonl")).unwrap();
        let pose = Pose::new(1234.567891011, -0.1, 179.99999999);
        store
            .append(&HistoryRecord::update(pose, "snap", 0.0, 0.0))
            .unwrap();
        let restored = store.last_pose().unwrap();
        assert_eq!(restored.x_mm.to_bits(), pose.x_mm.to_bits());
        assert_eq!(restored.y_mm.to_bits(), pose.y_mm.to_bits());
        assert_eq!(restored.theta_deg.to_bits(), pose.theta_deg.to_bits());
    }

    #[test]
    fn test_torn_trailing_line_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = JsonlHistoryStore::open(&path).unwrap();
        store
            .append(&HistoryRecord::update(
                Pose::new(5.0, 6.0, 7.0),
                "encoders",
                1.0,
                0.0,
            ))
            .unwrap();
        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"ts\":123,\"event\":\"upd").unwrap();
        drop(file);

        assert_eq!(store.last_pose().unwrap(), Pose::new(5.0, 6.0, 7.0));
    }

    #[test]
    fn test_clear_truncates() {
        let dir = tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path().join("history.jsonl")).unwrap();
        store.append(&HistoryRecord::reset(Pose::default())).unwrap();
        store.clear().unwrap();
        assert!(store.last_pose().is_none());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "");
    }

    #[test]
    fn test_missing_file_restores_nothing() {
        let dir = tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path().join("absent.jsonl")).unwrap();
        assert!(store.last_pose().is_none());
    }
}

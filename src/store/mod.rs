//! Persistent engagement database and the single writer that merges into it.

pub mod debug_log;
pub mod index;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::stats::DriveStats;

pub use debug_log::{DebugEvent, DebugEventLog, DebugKind, DebugMode};
pub use index::{DriveKey, ProcessedDrivesIndex};

pub const DEFAULT_DB_FILE: &str = "engagement_db.json";
pub const DEFAULT_INDEX_FILE: &str = "processed_drives.json";

/// Device id -> drives in merge order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementDatabase {
    #[serde(default)]
    pub devices: BTreeMap<String, Vec<DriveStats>>,
}

impl EngagementDatabase {
    /// A missing file is an empty database; an unreadable one is an error so
    /// it never gets overwritten.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read database {}", path.display()))
            }
        };
        serde_json::from_str(&text)
            .with_context(|| format!("Database {} is not valid JSON", path.display()))
    }

    pub fn to_json(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn drive_count(&self) -> usize {
        self.devices.values().map(Vec::len).sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = DriveKey> + '_ {
        self.devices.iter().flat_map(|(device, drives)| {
            drives
                .iter()
                .map(move |stats| DriveKey::new(device.clone(), stats.drive.clone()))
        })
    }

    /// Replace the drive's record in place, or append it. Returns what was
    /// there before so the caller can undo.
    fn upsert(&mut self, stats: DriveStats) -> Option<(usize, DriveStats)> {
        let drives = self.devices.entry(stats.device_id.clone()).or_default();
        match drives.iter().position(|d| d.drive == stats.drive) {
            Some(pos) => Some((pos, std::mem::replace(&mut drives[pos], stats))),
            None => {
                drives.push(stats);
                None
            }
        }
    }

    fn undo_upsert(&mut self, device_id: &str, drive: &str, previous: Option<(usize, DriveStats)>) {
        let Some(drives) = self.devices.get_mut(device_id) else {
            return;
        };
        match previous {
            Some((pos, old)) => drives[pos] = old,
            None => {
                drives.retain(|d| d.drive != drive);
                if drives.is_empty() {
                    self.devices.remove(device_id);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StorePaths {
    pub db: PathBuf,
    pub index: PathBuf,
    pub backup_dir: Option<PathBuf>,
}

impl StorePaths {
    pub fn new(db: impl Into<PathBuf>, index: impl Into<PathBuf>) -> Self {
        Self {
            db: db.into(),
            index: index.into(),
            backup_dir: None,
        }
    }
}

struct StoreState {
    db: EngagementDatabase,
    index: ProcessedDrivesIndex,
    backed_up: bool,
}

/// Serialises every read-modify-write of the database behind one lock
pub struct MergeEngine {
    paths: StorePaths,
    state: Mutex<StoreState>,
}

impl MergeEngine {
    pub fn open(paths: StorePaths) -> anyhow::Result<Self> {
        let db = EngagementDatabase::load(&paths.db)?;
        let index = ProcessedDrivesIndex::load_reconciled(&paths.index, &db);
        log::info!(
            "Loaded {} drives for {} devices from {}",
            db.drive_count(),
            db.devices.len(),
            paths.db.display()
        );
        Ok(Self {
            paths,
            state: Mutex::new(StoreState {
                db,
                index,
                backed_up: false,
            }),
        })
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| EngineError::DatabaseWrite {
            path: self.paths.db.clone(),
            source: io::Error::new(io::ErrorKind::Other, "store lock poisoned"),
        })
    }

    pub fn is_processed(&self, device_id: &str, drive: &str) -> bool {
        self.lock()
            .map(|state| state.index.contains(device_id, drive))
            .unwrap_or(false)
    }

    /// Merge one drive's stats. Without `reprocess` an already-indexed drive
    /// is left untouched.
    pub fn merge(
        &self,
        device_id: &str,
        drive: &str,
        mut stats: DriveStats,
        reprocess: bool,
    ) -> EngineResult<MergeOutcome> {
        let mut state = self.lock()?;
        if !reprocess && state.index.contains(device_id, drive) {
            return Ok(MergeOutcome::Skipped);
        }

        stats.device_id = device_id.to_string();
        stats.drive = drive.to_string();
        let previous = state.db.upsert(stats);
        let outcome = if previous.is_some() {
            MergeOutcome::Replaced
        } else {
            MergeOutcome::Inserted
        };

        if let Err(source) = self.persist(&mut state) {
            state.db.undo_upsert(device_id, drive, previous);
            return Err(EngineError::DatabaseWrite {
                path: self.paths.db.clone(),
                source,
            });
        }

        state.index.insert(device_id, drive);
        if let Err(e) = state.index.save(&self.paths.index) {
            log::warn!(
                "Could not write processed-drives index {}: {}",
                self.paths.index.display(),
                e
            );
        }
        Ok(outcome)
    }

    fn persist(&self, state: &mut StoreState) -> io::Result<()> {
        if !state.backed_up {
            if let Some(dir) = &self.paths.backup_dir {
                if let Some(backup) = backup_file(&self.paths.db, dir)? {
                    log::info!("Backed up database to {}", backup.display());
                }
            }
            state.backed_up = true;
        }
        let json = state.db.to_json()?;
        atomic_write(&self.paths.db, &json)
    }

    pub fn snapshot(&self) -> EngagementDatabase {
        self.lock().map(|state| state.db.clone()).unwrap_or_default()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.db.devices.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Write `bytes` beside `path` as `.<name>.tmp`, fsync, then rename over it
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Copy `path` into `dir` with a timestamp suffix. `None` if there was
/// nothing to back up.
pub fn backup_file(path: &Path, dir: &Path) -> io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::create_dir_all(dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_DB_FILE.to_string());
    let backup = dir.join(format!("{}.{}.bak", name, Local::now().format("%Y%m%d%H%M%S")));
    fs::copy(path, &backup)?;
    Ok(Some(backup))
}

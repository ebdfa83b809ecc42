use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{atomic_write, EngagementDatabase};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriveKey {
    pub device_id: String,
    pub drive: String,
}

impl DriveKey {
    pub fn new(device_id: impl Into<String>, drive: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            drive: drive.into(),
        }
    }
}

/// Drives already aggregated. A cache of the database's keys, never the
/// source of truth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedDrivesIndex {
    keys: BTreeSet<DriveKey>,
}

impl ProcessedDrivesIndex {
    pub fn from_database(db: &EngagementDatabase) -> Self {
        Self {
            keys: db.keys().collect(),
        }
    }

    /// Read the index file and bring it in line with `db`. Anything
    /// unreadable is rebuilt from the database.
    pub fn load_reconciled(path: &Path, db: &EngagementDatabase) -> Self {
        let rebuilt = Self::from_database(db);
        let stored: Vec<DriveKey> = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(keys) => keys,
                Err(e) => {
                    log::warn!(
                        "Processed-drives index {} is corrupt ({}); rebuilding from database",
                        path.display(),
                        e
                    );
                    return rebuilt;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => return rebuilt,
            Err(e) => {
                log::warn!("Could not read {} ({}); rebuilding from database", path.display(), e);
                return rebuilt;
            }
        };

        let stored: BTreeSet<DriveKey> = stored.into_iter().collect();
        let stale = stored.difference(&rebuilt.keys).count();
        let missing = rebuilt.keys.difference(&stored).count();
        if stale > 0 || missing > 0 {
            log::warn!(
                "Processed-drives index out of sync: dropped {} stale, added {} missing",
                stale,
                missing
            );
        }
        rebuilt
    }

    pub fn contains(&self, device_id: &str, drive: &str) -> bool {
        self.keys.contains(&DriveKey::new(device_id, drive))
    }

    pub fn insert(&mut self, device_id: &str, drive: &str) -> bool {
        self.keys.insert(DriveKey::new(device_id, drive))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let keys: Vec<&DriveKey> = self.keys.iter().collect();
        let json = serde_json::to_vec_pretty(&keys)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        atomic_write(path, &json)
    }
}

//! Local segment layout: `<root>/<device>/<drive>--<index>/rlog.gz`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const SEGMENT_LOG_FILE: &str = "rlog.gz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub index: u32,
    pub dir: PathBuf,
    /// `None` when the directory exists but its log was never fetched
    pub log_path: Option<PathBuf>,
}

/// One drive's segments, sorted by index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveListing {
    pub device_id: String,
    pub drive: String,
    pub segments: Vec<SegmentEntry>,
}

impl DriveListing {
    pub fn present(&self) -> impl Iterator<Item = (u32, bool)> + '_ {
        self.segments.iter().map(|s| (s.index, s.log_path.is_some()))
    }
}

/// Split `2025-07-10--10-00-00--3` into drive name and segment index
pub fn split_segment_dir(name: &str) -> Option<(&str, u32)> {
    let (drive, index) = name.rsplit_once("--")?;
    if drive.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((drive, index.parse().ok()?))
}

/// All drives recorded for `device_id` under `root`, sorted by drive name
pub fn list_drives(root: &Path, device_id: &str) -> io::Result<Vec<DriveListing>> {
    let device_dir = root.join(device_id);
    let mut drives: BTreeMap<String, Vec<SegmentEntry>> = BTreeMap::new();

    let entries = match fs::read_dir(&device_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some((drive, index)) = name.to_str().and_then(split_segment_dir) else {
            log::debug!("Ignoring {}", entry.path().display());
            continue;
        };
        let dir = entry.path();
        let log = dir.join(SEGMENT_LOG_FILE);
        drives.entry(drive.to_string()).or_default().push(SegmentEntry {
            index,
            log_path: log.is_file().then_some(log),
            dir,
        });
    }

    Ok(drives
        .into_iter()
        .map(|(drive, mut segments)| {
            segments.sort_by_key(|s| s.index);
            DriveListing {
                device_id: device_id.to_string(),
                drive,
                segments,
            }
        })
        .collect())
}

/// Device directories under `root` plus devices already in the database
pub fn list_devices(root: &Path, known: impl IntoIterator<Item = String>) -> io::Result<Vec<String>> {
    let mut devices: BTreeSet<String> = known.into_iter().collect();
    match fs::read_dir(root) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        if !name.starts_with('.') {
                            devices.insert(name.to_string());
                        }
                    }
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(devices.into_iter().collect())
}

/// Keep drives named within `[start, stop]` (inclusive, lexicographic)
pub fn filter_by_range(
    drives: Vec<DriveListing>,
    start: Option<&str>,
    stop: Option<&str>,
) -> Vec<DriveListing> {
    drives
        .into_iter()
        .filter(|d| start.map_or(true, |s| d.drive.as_str() >= s))
        .filter(|d| stop.map_or(true, |s| d.drive.as_str() <= s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(root: &Path, device: &str, name: &str, with_log: bool) {
        let dir = root.join(device).join(name);
        fs::create_dir_all(&dir).unwrap();
        if with_log {
            fs::write(dir.join(SEGMENT_LOG_FILE), b"").unwrap();
        }
    }

    #[test]
    fn test_split_segment_dir() {
        assert_eq!(
            split_segment_dir("2025-07-10--10-00-00--12"),
            Some(("2025-07-10--10-00-00", 12))
        );
        assert_eq!(split_segment_dir("2025-07-10--10-00-00"), None);
        assert_eq!(split_segment_dir("--3"), None);
        assert_eq!(split_segment_dir("drive--x1"), None);
    }

    #[test]
    fn test_list_drives_groups_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        segment(root, "dev", "2025-07-10--10-00-00--10", true);
        segment(root, "dev", "2025-07-10--10-00-00--2", true);
        segment(root, "dev", "2025-07-10--10-00-00--0", false);
        segment(root, "dev", "2025-07-11--08-00-00--0", true);
        fs::write(root.join("dev").join("notes.txt"), b"").unwrap();

        let drives = list_drives(root, "dev").unwrap();
        assert_eq!(drives.len(), 2);
        let indices: Vec<u32> = drives[0].segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 2, 10]);
        assert!(drives[0].segments[0].log_path.is_none());
        assert_eq!(drives[1].drive, "2025-07-11--08-00-00");

        assert!(list_drives(root, "unknown").unwrap().is_empty());
    }

    #[test]
    fn test_list_devices_unions_database() {
        let dir = tempfile::tempdir().unwrap();
        segment(dir.path(), "b", "d--0", true);
        let devices = list_devices(dir.path(), vec!["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(devices, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_filter_by_range() {
        let listing = |drive: &str| DriveListing {
            device_id: "dev".to_string(),
            drive: drive.to_string(),
            segments: Vec::new(),
        };
        let drives = vec![
            listing("2025-07-01--00-00-00"),
            listing("2025-07-10--00-00-00"),
            listing("2025-07-20--00-00-00"),
        ];
        let kept = filter_by_range(drives, Some("2025-07-05"), Some("2025-07-10--00-00-00"));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].drive, "2025-07-10--00-00-00");
    }
}

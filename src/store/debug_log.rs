use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::atomic_write;

pub const DEFAULT_DEBUG_LOG_FILE: &str = "debug_events.json";

pub const EVENT_STEER_INTERVENTION: &str = "steer_intervention";
pub const EVENT_DISENGAGEMENT: &str = "disengagement";

/// Which events get written to the debug log
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DebugKind {
    Steer,
    Disengagement,
    All,
}

impl DebugKind {
    pub fn wants_steer(self) -> bool {
        matches!(self, DebugKind::Steer | DebugKind::All)
    }

    pub fn wants_disengagement(self) -> bool {
        matches!(self, DebugKind::Disengagement | DebugKind::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DebugMode {
    /// Keep existing events, skipping exact duplicates
    #[default]
    Add,
    /// Drop a drive's previous events before adding new ones
    Replace,
}

/// One reviewable event. Times are seconds from drive start unless the
/// field says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    pub device_id: String,
    pub drive: String,
    pub event_type: String,
    pub segment_index: u32,
    /// Log file the visualiser should open
    pub segment_path: String,
    pub time_in_segment_s: f64,
    pub window_start_s: f64,
    pub window_end_s: f64,
    pub review_start_s: f64,
    pub review_end_s: f64,
    pub detail: String,
}

pub struct DebugEventLog {
    path: PathBuf,
    mode: DebugMode,
    events: Vec<DebugEvent>,
    dirty: bool,
}

impl DebugEventLog {
    pub fn load(path: &Path, mode: DebugMode) -> anyhow::Result<Self> {
        let events = match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("Debug log {} is not valid JSON", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read debug log {}", path.display()))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            events,
            dirty: false,
        })
    }

    pub fn events(&self) -> &[DebugEvent] {
        &self.events
    }

    /// Record a processed drive's events according to the log mode
    pub fn record_drive(&mut self, device_id: &str, drive: &str, events: Vec<DebugEvent>) {
        if self.mode == DebugMode::Replace {
            let before = self.events.len();
            self.events
                .retain(|e| !(e.device_id == device_id && e.drive == drive));
            self.dirty |= self.events.len() != before;
        }
        for event in events {
            if self.mode == DebugMode::Add && self.events.contains(&event) {
                continue;
            }
            self.events.push(event);
            self.dirty = true;
        }
    }

    /// Write the log if anything changed this run
    pub fn save(&mut self) -> io::Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let json = serde_json::to_vec_pretty(&self.events)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        atomic_write(&self.path, &json)?;
        self.dirty = false;
        Ok(true)
    }
}

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Operator-tunable thresholds for the whole engine.
///
/// Every section defaults independently, so a tuning file only needs the
/// keys it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub decoder: DecoderConfig,
    pub tracker: TrackerConfig,
    pub classifier: ClassifierConfig,
}

impl EngineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse engine config {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub min_version: u16,
    pub max_version: u16,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            min_version: crate::segment::MIN_SUPPORTED_VERSION,
            max_version: crate::segment::FORMAT_VERSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Filtered driver torque (N·m) that opens a candidate window
    pub possible_override_torque: f64,
    /// Torque (N·m) that keeps an open window alive
    pub sustain_torque: f64,
    /// Longest gap between torque samples before a window times out
    pub max_torque_gap_s: f64,
    /// Moving average length applied to driver torque
    pub torque_filter_window: usize,
    /// Torque is ignored for this long after any engagement change
    pub engagement_settle_s: f64,
    /// Speed sample gaps longer than this contribute no distance
    pub max_speed_gap_s: f64,
    pub moving_speed_mps: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            possible_override_torque: 1.5,
            sustain_torque: 1.0,
            max_torque_gap_s: 0.5,
            torque_filter_window: 5,
            engagement_settle_s: 3.0,
            max_speed_gap_s: 1.0,
            moving_speed_mps: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub min_duration_s: f64,
    pub confirm_torque: f64,
    pub review_lead_s: f64,
    pub review_trail_s: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_duration_s: 0.8,
            confirm_torque: 3.0,
            review_lead_s: 5.0,
            review_trail_s: 5.0,
        }
    }
}

//! Per-drive statistics record and the reduction that produces it.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::engagement::{EngagementTimeline, SpeedBucket};
use crate::error::{EngineError, EngineResult};
use crate::intervention::InterventionEvent;

/// Drive directory names look like `2025-07-10--10-00-00`
pub const DRIVE_NAME_FORMAT: &str = "%Y-%m-%d--%H-%M-%S";

const NS_PER_S: f64 = 1e9;

/// Metadata found while decoding (first InitData / CarParams of the drive)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriveMetadata {
    pub fingerprint: Option<String>,
    pub openpilot_longitudinal: Option<bool>,
    pub version: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
    pub device_type: Option<String>,
}

/// Identity and provenance of the drive being reduced
#[derive(Debug, Clone, Default)]
pub struct DriveContext {
    pub device_id: String,
    pub drive: String,
    pub segment_count: u32,
    pub partial: bool,
    pub metadata: DriveMetadata,
    /// Vehicle profile used for CAN decoding, if any
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedBucketStats {
    pub seconds: f64,
    pub distance_km: f64,
    pub engaged_seconds: f64,
    pub engaged_distance_km: f64,
}

impl SpeedBucketStats {
    pub fn time_engagement_pct(&self) -> Option<f64> {
        percent(self.engaged_seconds, self.seconds)
    }

    pub fn distance_engagement_pct(&self) -> Option<f64> {
        percent(self.engaged_distance_km, self.distance_km)
    }

    fn add(&mut self, other: &SpeedBucketStats) {
        self.seconds += other.seconds;
        self.distance_km += other.distance_km;
        self.engaged_seconds += other.engaged_seconds;
        self.engaged_distance_km += other.engaged_distance_km;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedBreakdown {
    pub city: SpeedBucketStats,
    pub road: SpeedBucketStats,
    pub highway: SpeedBucketStats,
}

impl SpeedBreakdown {
    /// Buckets with their display labels, slowest first
    pub fn labelled(&self) -> [(&'static str, &SpeedBucketStats); 3] {
        [
            ("City (<55 km/h)", &self.city),
            ("Road (55-90 km/h)", &self.road),
            ("Highway (>=90 km/h)", &self.highway),
        ]
    }

    fn add(&mut self, other: &SpeedBreakdown) {
        self.city.add(&other.city);
        self.road.add(&other.road);
        self.highway.add(&other.highway);
    }
}

/// One authoritative record per (device, drive)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveStats {
    pub device_id: String,
    pub drive: String,
    /// Local time parsed from the drive name
    pub recorded_at: Option<String>,
    pub processed_at: String,
    pub segment_count: u32,
    pub partial: bool,

    pub elapsed_seconds: f64,
    pub engaged_seconds: f64,
    pub engagement_pct: f64,

    pub distance_km: f64,
    pub engaged_distance_km: f64,
    pub engagement_pct_distance: Option<f64>,

    /// Time above the moving-speed threshold
    pub drive_seconds: f64,
    pub engaged_drive_seconds: f64,
    pub drive_time_engagement_pct: Option<f64>,

    pub odometer_distance_km: Option<f64>,
    pub odometer_engaged_km: Option<f64>,

    pub cruise_press_seconds: f64,
    pub cruise_press_seconds_per_hour: f64,

    pub state_changes: u32,
    pub disengagements: u32,
    pub reengagements: u32,
    pub interventions: u32,
    pub rejected_windows: u32,
    pub interventions_per_100km: Option<f64>,

    pub fingerprint: Option<String>,
    pub profile: Option<String>,
    pub can_decoded: bool,
    pub openpilot_longitudinal: Option<bool>,
    pub version: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
    pub device_type: Option<String>,

    pub speed_buckets: SpeedBreakdown,
}

/// Fail unless every listed segment has a log file, or the drive is partial.
///
/// `present` pairs each listed segment index with whether its log exists.
pub fn check_complete(
    drive: &str,
    present: impl IntoIterator<Item = (u32, bool)>,
    partial: bool,
) -> EngineResult<()> {
    let missing: Vec<u32> = present
        .into_iter()
        .filter(|(_, has_log)| !has_log)
        .map(|(index, _)| index)
        .collect();
    if missing.is_empty() || partial {
        return Ok(());
    }
    Err(EngineError::IncompleteDrive {
        drive: drive.to_string(),
        missing,
    })
}

pub fn parse_drive_timestamp(drive: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(drive, DRIVE_NAME_FORMAT).ok()
}

/// Reduce one drive's timeline and classified windows to its stats record
pub fn aggregate(
    ctx: &DriveContext,
    timeline: &EngagementTimeline,
    events: &[InterventionEvent],
    processed_at: DateTime<Utc>,
) -> DriveStats {
    let elapsed_s = timeline.elapsed_ns() as f64 / NS_PER_S;
    let engaged_s = timeline.engaged_ns() as f64 / NS_PER_S;
    let motion = &timeline.motion;
    let distance_km = motion.distance_m / 1000.0;
    let engaged_km = motion.engaged_distance_m / 1000.0;
    let drive_s = motion.drive_time_ns as f64 / NS_PER_S;
    let engaged_drive_s = motion.engaged_drive_time_ns as f64 / NS_PER_S;
    let cruise_s = timeline.cruise_press_ns as f64 / NS_PER_S;

    let interventions = events.iter().filter(|e| e.is_confirmed()).count() as u32;
    let rejected_windows = events.len() as u32 - interventions;

    let odometer_distance_km = timeline.odometer.distance_km().map(|km| round_to(km, 3));
    let odometer_engaged_km = timeline
        .odometer
        .start_km
        .map(|_| round_to(timeline.odometer.engaged_km, 3));

    let meta = &ctx.metadata;
    DriveStats {
        device_id: ctx.device_id.clone(),
        drive: ctx.drive.clone(),
        recorded_at: parse_drive_timestamp(&ctx.drive)
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string()),
        processed_at: processed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        segment_count: ctx.segment_count,
        partial: ctx.partial,

        elapsed_seconds: round_to(elapsed_s, 3),
        engaged_seconds: round_to(engaged_s, 3),
        engagement_pct: percent(engaged_s, elapsed_s).unwrap_or(0.0),

        distance_km: round_to(distance_km, 3),
        engaged_distance_km: round_to(engaged_km, 3),
        engagement_pct_distance: percent(engaged_km, distance_km),

        drive_seconds: round_to(drive_s, 3),
        engaged_drive_seconds: round_to(engaged_drive_s, 3),
        drive_time_engagement_pct: percent(engaged_drive_s, drive_s),

        odometer_distance_km,
        odometer_engaged_km,

        cruise_press_seconds: round_to(cruise_s, 2),
        cruise_press_seconds_per_hour: if drive_s > 0.0 {
            round_to(cruise_s / drive_s * 3600.0, 2)
        } else {
            0.0
        },

        state_changes: timeline.counters.state_changes,
        disengagements: timeline.counters.disengagements,
        reengagements: timeline.counters.reengagements,
        interventions,
        rejected_windows,
        interventions_per_100km: if distance_km > 0.0 {
            Some(round_to(interventions as f64 / distance_km * 100.0, 2))
        } else {
            None
        },

        fingerprint: meta.fingerprint.clone(),
        profile: ctx.profile.clone(),
        can_decoded: ctx.profile.is_some(),
        openpilot_longitudinal: meta.openpilot_longitudinal,
        version: meta.version.clone(),
        git_branch: meta.git_branch.clone(),
        git_commit: meta.git_commit.clone(),
        device_type: meta.device_type.clone(),

        speed_buckets: speed_breakdown(timeline),
    }
}

fn speed_breakdown(timeline: &EngagementTimeline) -> SpeedBreakdown {
    let bucket = |b: SpeedBucket| {
        let totals = timeline.motion.bucket(b);
        SpeedBucketStats {
            seconds: round_to(totals.time_ns as f64 / NS_PER_S, 3),
            distance_km: round_to(totals.distance_m / 1000.0, 3),
            engaged_seconds: round_to(totals.engaged_time_ns as f64 / NS_PER_S, 3),
            engaged_distance_km: round_to(totals.engaged_distance_m / 1000.0, 3),
        }
    };
    SpeedBreakdown {
        city: bucket(SpeedBucket::City),
        road: bucket(SpeedBucket::Road),
        highway: bucket(SpeedBucket::Highway),
    }
}

fn percent(part: f64, whole: f64) -> Option<f64> {
    (whole > 0.0).then(|| round_to(part / whole * 100.0, 2))
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Totals across a device's drives, for the end-of-run summary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSummary {
    pub drives: usize,
    pub hours: f64,
    pub engaged_hours: f64,
    pub distance_km: f64,
    pub engaged_distance_km: f64,
    pub interventions: u32,
    pub disengagements: u32,
    pub drive_hours: f64,
    pub engaged_drive_hours: f64,
    pub cruise_press_seconds: f64,
    pub speed_buckets: SpeedBreakdown,
}

impl DeviceSummary {
    pub fn from_drives<'a>(drives: impl IntoIterator<Item = &'a DriveStats>) -> Self {
        let mut summary = DeviceSummary::default();
        for stats in drives {
            summary.drives += 1;
            summary.hours += stats.elapsed_seconds / 3600.0;
            summary.engaged_hours += stats.engaged_seconds / 3600.0;
            summary.distance_km += stats.distance_km;
            summary.engaged_distance_km += stats.engaged_distance_km;
            summary.interventions += stats.interventions;
            summary.disengagements += stats.disengagements;
            summary.drive_hours += stats.drive_seconds / 3600.0;
            summary.engaged_drive_hours += stats.engaged_drive_seconds / 3600.0;
            summary.cruise_press_seconds += stats.cruise_press_seconds;
            summary.speed_buckets.add(&stats.speed_buckets);
        }
        summary
    }

    pub fn engagement_pct(&self) -> f64 {
        percent(self.engaged_hours, self.hours).unwrap_or(0.0)
    }

    pub fn interventions_per_100km(&self) -> Option<f64> {
        (self.distance_km > 0.0).then(|| self.interventions as f64 / self.distance_km * 100.0)
    }

    /// Engaged share of time spent moving
    pub fn drive_time_engagement_pct(&self) -> Option<f64> {
        percent(self.engaged_drive_hours, self.drive_hours)
    }

    /// Cruise button hold time per hour of moving time
    pub fn cruise_press_seconds_per_hour(&self) -> Option<f64> {
        (self.drive_hours > 0.0).then(|| round_to(self.cruise_press_seconds / self.drive_hours, 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassifierConfig, TrackerConfig};
    use crate::engagement::{CandidateWindow, EngagementTracker, WindowClose};
    use crate::intervention::InterventionClassifier;
    use crate::segment::{CarState, ControlsState};
    use chrono::TimeZone;

    const S: u64 = 1_000_000_000;

    fn sample_timeline() -> EngagementTimeline {
        let mut t = EngagementTracker::new("2025-07-10--10-00-00", &TrackerConfig::default(), false);
        t.begin_segment(0, 0).unwrap();
        for i in 0..=100u64 {
            let time = i * S / 2;
            t.observe(time).unwrap();
            t.on_controls_state(
                time,
                &ControlsState {
                    enabled: i >= 20 && i < 80,
                    disengage_reason: 1,
                },
            );
            t.on_car_state(
                time,
                &CarState {
                    v_ego: 20.0,
                    steering_angle_deg: 0.0,
                },
            );
        }
        t.finish()
    }

    fn processed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 11, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_aggregate_totals() {
        let timeline = sample_timeline();
        let ctx = DriveContext {
            device_id: "abc123".to_string(),
            drive: "2025-07-10--10-00-00".to_string(),
            segment_count: 1,
            metadata: DriveMetadata {
                fingerprint: Some("HYUNDAI_IONIQ_5".to_string()),
                version: Some("0.9.8".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let stats = aggregate(&ctx, &timeline, &[], processed_at());

        assert_eq!(stats.elapsed_seconds, 50.0);
        assert_eq!(stats.engaged_seconds, 30.0);
        assert_eq!(stats.engagement_pct, 60.0);
        assert_eq!(stats.distance_km, 1.0);
        assert_eq!(stats.engaged_distance_km, 0.6);
        assert_eq!(stats.engagement_pct_distance, Some(60.0));
        assert_eq!(stats.speed_buckets.road.seconds, 50.0);
        assert_eq!(stats.disengagements, 1);
        assert_eq!(stats.interventions, 0);
        assert_eq!(stats.interventions_per_100km, Some(0.0));
        assert_eq!(stats.recorded_at.as_deref(), Some("2025-07-10T10:00:00"));
        assert_eq!(stats.processed_at, "2025-07-11T08:30:00Z");
        assert_eq!(stats.fingerprint.as_deref(), Some("HYUNDAI_IONIQ_5"));
        assert!(!stats.can_decoded);
        assert_eq!(stats.odometer_distance_km, None);
    }

    #[test]
    fn test_only_confirmed_events_count() {
        let timeline = sample_timeline();
        let classifier = InterventionClassifier::new(&ClassifierConfig::default());
        let mut with_windows = timeline.clone();
        let window = |peak: f64| CandidateWindow {
            start_ns: 20 * S,
            end_ns: 22 * S,
            peak_torque: peak,
            sample_count: 200,
            segment_index: 0,
            closed_by: WindowClose::Released,
        };
        with_windows.windows = vec![window(4.0), window(1.8)];
        let events = classifier.classify(&with_windows);

        let stats = aggregate(&DriveContext::default(), &with_windows, &events, processed_at());
        assert_eq!(stats.interventions, 1);
        assert_eq!(stats.rejected_windows, 1);
        assert_eq!(stats.interventions_per_100km, Some(100.0));
    }

    #[test]
    fn test_check_complete() {
        assert!(check_complete("d", vec![(0, true), (1, true)], false).is_ok());
        match check_complete("d", vec![(0, true), (1, false), (2, false)], false) {
            Err(EngineError::IncompleteDrive { missing, .. }) => assert_eq!(missing, vec![1, 2]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(check_complete("d", vec![(0, true), (1, false)], true).is_ok());
    }

    #[test]
    fn test_parse_drive_timestamp() {
        assert!(parse_drive_timestamp("2025-07-10--10-00-00").is_some());
        assert!(parse_drive_timestamp("not-a-drive").is_none());
    }

    #[test]
    fn test_serde_roundtrip_keeps_optional_fields() {
        let stats = aggregate(&DriveContext::default(), &sample_timeline(), &[], processed_at());
        let json = serde_json::to_string(&stats).unwrap();
        let parsed: DriveStats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, stats);
    }

    #[test]
    fn test_device_summary() {
        let stats = aggregate(&DriveContext::default(), &sample_timeline(), &[], processed_at());
        let summary = DeviceSummary::from_drives([&stats, &stats]);
        assert_eq!(summary.drives, 2);
        assert_eq!(summary.engagement_pct(), 60.0);
        assert!((summary.distance_km - 2.0).abs() < 1e-9);
        assert_eq!(summary.drive_time_engagement_pct(), Some(60.0));
        assert_eq!(summary.cruise_press_seconds_per_hour(), Some(0.0));
        assert_eq!(summary.speed_buckets.road.seconds, 100.0);
        assert_eq!(summary.speed_buckets.road.time_engagement_pct(), Some(60.0));
        assert_eq!(summary.speed_buckets.city.time_engagement_pct(), None);
        let labels: Vec<_> = summary.speed_buckets.labelled().iter().map(|(l, _)| *l).collect();
        assert_eq!(labels[0], "City (<55 km/h)");
    }

    #[test]
    fn test_device_summary_cruise_rate() {
        let mut stats = aggregate(&DriveContext::default(), &sample_timeline(), &[], processed_at());
        stats.drive_seconds = 1800.0;
        stats.engaged_drive_seconds = 900.0;
        stats.cruise_press_seconds = 12.0;
        let summary = DeviceSummary::from_drives([&stats]);
        assert_eq!(summary.cruise_press_seconds_per_hour(), Some(24.0));
        assert_eq!(summary.drive_time_engagement_pct(), Some(50.0));

        assert_eq!(DeviceSummary::default().cruise_press_seconds_per_hour(), None);
    }
}

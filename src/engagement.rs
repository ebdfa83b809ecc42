//! Engagement state machine for one drive.
//!
//! Records from every segment are fed in drive-clock order. The tracker keeps
//! the engagement intervals, motion totals and candidate steering-override
//! windows; `finish` turns them into an `EngagementTimeline`.

use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::error::{EngineError, EngineResult};
use crate::segment::{CarState, ControlsState};
use crate::signals::{SignalSample, CRUISE_STATE, ODOMETER, STEERING_DRIVER_TORQUE};
use crate::smoothing::TorqueSmoother;

const NS_PER_S: f64 = 1e9;

/// Upper bound of the city bucket (m/s, ~55 km/h)
pub const CITY_MAX_MPS: f64 = 15.3;
/// Lower bound of the highway bucket (m/s, 90 km/h)
pub const HIGHWAY_MIN_MPS: f64 = 25.0;

/// Odometer steps at or above this (km) are treated as glitches
const MAX_ODOMETER_STEP_KM: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngagementState {
    Disengaged,
    Engaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisengageCause {
    Unspecified,
    DriverBrake,
    DriverCancel,
    SteeringOverride,
    SystemFault,
    SpeedTooLow,
    Other(u16),
}

impl DisengageCause {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => DisengageCause::Unspecified,
            1 => DisengageCause::DriverBrake,
            2 => DisengageCause::DriverCancel,
            3 => DisengageCause::SteeringOverride,
            4 => DisengageCause::SystemFault,
            5 => DisengageCause::SpeedTooLow,
            other => DisengageCause::Other(other),
        }
    }
}

/// Half-open `[start_ns, end_ns)` span on the drive clock
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngagementInterval {
    pub start_ns: u64,
    pub end_ns: u64,
    pub engaged: bool,
    /// Set on disengaged intervals that follow a transition
    pub cause: Option<DisengageCause>,
}

impl EngagementInterval {
    pub fn duration_ns(&self) -> u64 {
        self.end_ns - self.start_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowClose {
    /// Torque fell below the sustain threshold
    Released,
    /// No torque sample within the allowed gap
    Timeout,
    Disengaged,
    EndOfDrive,
}

/// Span of elevated driver torque observed while engaged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateWindow {
    pub start_ns: u64,
    /// Time of the last sample that kept the window open
    pub end_ns: u64,
    /// Largest filtered torque magnitude (N·m)
    pub peak_torque: f64,
    pub sample_count: u32,
    /// Segment in which the window opened
    pub segment_index: u32,
    pub closed_by: WindowClose,
}

impl CandidateWindow {
    pub fn duration_s(&self) -> f64 {
        (self.end_ns - self.start_ns) as f64 / NS_PER_S
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisengageEvent {
    pub time_ns: u64,
    pub segment_index: u32,
    pub cause: DisengageCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedBucket {
    City,
    Road,
    Highway,
}

impl SpeedBucket {
    pub const ALL: [SpeedBucket; 3] = [SpeedBucket::City, SpeedBucket::Road, SpeedBucket::Highway];

    pub fn for_speed(v_mps: f64) -> Self {
        if v_mps < CITY_MAX_MPS {
            SpeedBucket::City
        } else if v_mps < HIGHWAY_MIN_MPS {
            SpeedBucket::Road
        } else {
            SpeedBucket::Highway
        }
    }

    fn slot(self) -> usize {
        match self {
            SpeedBucket::City => 0,
            SpeedBucket::Road => 1,
            SpeedBucket::Highway => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketTotals {
    pub time_ns: u64,
    pub distance_m: f64,
    pub engaged_time_ns: u64,
    pub engaged_distance_m: f64,
}

/// Speed-derived totals integrated from car-state samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionTotals {
    pub distance_m: f64,
    pub engaged_distance_m: f64,
    /// Time spent above the moving threshold
    pub drive_time_ns: u64,
    pub engaged_drive_time_ns: u64,
    buckets: [BucketTotals; 3],
}

impl MotionTotals {
    pub fn bucket(&self, bucket: SpeedBucket) -> &BucketTotals {
        &self.buckets[bucket.slot()]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OdometerTotals {
    pub start_km: Option<f64>,
    pub end_km: Option<f64>,
    pub engaged_km: f64,
}

impl OdometerTotals {
    pub fn distance_km(&self) -> Option<f64> {
        Some(self.end_km? - self.start_km?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionCounters {
    pub state_changes: u32,
    pub disengagements: u32,
    pub reengagements: u32,
}

/// Everything the tracker learned about one drive
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementTimeline {
    pub drive: String,
    pub first_ns: Option<u64>,
    pub last_ns: Option<u64>,
    pub intervals: Vec<EngagementInterval>,
    pub windows: Vec<CandidateWindow>,
    pub disengage_events: Vec<DisengageEvent>,
    /// (segment index, segment start on the drive clock)
    pub segment_starts: Vec<(u32, u64)>,
    pub motion: MotionTotals,
    pub odometer: OdometerTotals,
    pub cruise_press_ns: u64,
    pub counters: TransitionCounters,
}

impl EngagementTimeline {
    pub fn elapsed_ns(&self) -> u64 {
        match (self.first_ns, self.last_ns) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }

    pub fn engaged_ns(&self) -> u64 {
        self.intervals
            .iter()
            .filter(|i| i.engaged)
            .map(EngagementInterval::duration_ns)
            .sum()
    }

    /// Segment that contains `time_ns` and that segment's start
    pub fn segment_at(&self, time_ns: u64) -> Option<(u32, u64)> {
        self.segment_starts
            .iter()
            .rev()
            .find(|(_, start)| *start <= time_ns)
            .or_else(|| self.segment_starts.first())
            .copied()
    }
}

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    time_ns: u64,
    v_mps: f64,
    engaged: bool,
}

#[derive(Debug, Clone)]
struct OpenWindow {
    start_ns: u64,
    last_ns: u64,
    peak: f64,
    samples: u32,
    segment_index: u32,
}

impl OpenWindow {
    fn close(self, closed_by: WindowClose) -> CandidateWindow {
        CandidateWindow {
            start_ns: self.start_ns,
            end_ns: self.last_ns,
            peak_torque: self.peak,
            sample_count: self.samples,
            segment_index: self.segment_index,
            closed_by,
        }
    }
}

pub struct EngagementTracker {
    drive: String,
    config: TrackerConfig,
    tolerate_gaps: bool,

    state: EngagementState,
    open_start_ns: Option<u64>,
    open_cause: Option<DisengageCause>,
    last_change_ns: Option<u64>,
    has_disengaged: bool,

    first_ns: Option<u64>,
    last_ns: Option<u64>,
    current_segment: Option<u32>,
    segment_starts: Vec<(u32, u64)>,

    intervals: Vec<EngagementInterval>,
    disengage_events: Vec<DisengageEvent>,
    counters: TransitionCounters,

    last_speed: Option<SpeedSample>,
    motion: MotionTotals,

    odometer: OdometerTotals,
    last_odometer: Option<f64>,

    cruise_slots: Vec<bool>,
    last_cruise_ns: Option<u64>,
    cruise_press_ns: u64,

    smoother: TorqueSmoother,
    window: Option<OpenWindow>,
    windows: Vec<CandidateWindow>,
}

impl EngagementTracker {
    pub fn new(drive: impl Into<String>, config: &TrackerConfig, tolerate_gaps: bool) -> Self {
        Self {
            drive: drive.into(),
            config: config.clone(),
            tolerate_gaps,
            state: EngagementState::Disengaged,
            open_start_ns: None,
            open_cause: None,
            last_change_ns: None,
            has_disengaged: false,
            first_ns: None,
            last_ns: None,
            current_segment: None,
            segment_starts: Vec::new(),
            intervals: Vec::new(),
            disengage_events: Vec::new(),
            counters: TransitionCounters::default(),
            last_speed: None,
            motion: MotionTotals::default(),
            odometer: OdometerTotals::default(),
            last_odometer: None,
            cruise_slots: Vec::new(),
            last_cruise_ns: None,
            cruise_press_ns: 0,
            smoother: TorqueSmoother::new(config.torque_filter_window),
            window: None,
            windows: Vec::new(),
        }
    }

    /// Announce the next segment. Indices must be contiguous from 0 unless
    /// gaps are tolerated, in which case they only need to increase.
    pub fn begin_segment(&mut self, index: u32, start_ns: u64) -> EngineResult<()> {
        let in_order = match self.current_segment {
            None => self.tolerate_gaps || index == 0,
            Some(prev) if self.tolerate_gaps => index > prev,
            Some(prev) => prev.checked_add(1) == Some(index),
        };
        if !in_order {
            let detail = match self.current_segment {
                None => format!("drive starts at segment {} instead of 0", index),
                Some(prev) => format!("segment {} follows segment {}", index, prev),
            };
            return Err(self.ordering_error(detail));
        }
        self.current_segment = Some(index);
        self.segment_starts.push((index, start_ns));
        Ok(())
    }

    /// Advance the drive clock. Every record must pass through here first.
    pub fn observe(&mut self, time_ns: u64) -> EngineResult<()> {
        if let Some(last) = self.last_ns {
            if time_ns < last {
                let detail = format!(
                    "timestamp {} in segment {} precedes previous record at {}",
                    time_ns,
                    self.current_segment.unwrap_or(0),
                    last
                );
                return Err(self.ordering_error(detail));
            }
        }
        if self.first_ns.is_none() {
            self.first_ns = Some(time_ns);
            self.open_start_ns = Some(time_ns);
        }
        self.last_ns = Some(time_ns);
        Ok(())
    }

    pub fn on_controls_state(&mut self, time_ns: u64, controls: &ControlsState) {
        let next = if controls.enabled {
            EngagementState::Engaged
        } else {
            EngagementState::Disengaged
        };
        if next == self.state {
            return;
        }

        let segment_index = self.current_segment.unwrap_or(0);
        self.close_interval(time_ns);
        self.counters.state_changes += 1;
        self.last_change_ns = Some(time_ns);

        match next {
            EngagementState::Disengaged => {
                let cause = DisengageCause::from_code(controls.disengage_reason);
                self.counters.disengagements += 1;
                self.has_disengaged = true;
                self.open_cause = Some(cause);
                self.disengage_events.push(DisengageEvent {
                    time_ns,
                    segment_index,
                    cause,
                });
                if let Some(window) = self.window.take() {
                    self.windows.push(window.close(WindowClose::Disengaged));
                }
                log::debug!("{}: disengaged at {} ({:?})", self.drive, time_ns, cause);
            }
            EngagementState::Engaged => {
                if self.has_disengaged {
                    self.counters.reengagements += 1;
                }
                self.open_cause = None;
                log::debug!("{}: engaged at {}", self.drive, time_ns);
            }
        }
        self.state = next;
    }

    pub fn on_car_state(&mut self, time_ns: u64, car: &CarState) {
        let v = f64::from(car.v_ego);
        let engaged = self.state == EngagementState::Engaged;

        if let Some(prev) = self.last_speed {
            let dt_ns = time_ns.saturating_sub(prev.time_ns);
            let dt_s = dt_ns as f64 / NS_PER_S;
            if dt_ns > 0 && dt_s <= self.config.max_speed_gap_s {
                let distance = (prev.v_mps + v) / 2.0 * dt_s;
                let moving = prev.v_mps > self.config.moving_speed_mps;
                let bucket = &mut self.motion.buckets[SpeedBucket::for_speed(prev.v_mps).slot()];

                self.motion.distance_m += distance;
                bucket.time_ns += dt_ns;
                bucket.distance_m += distance;
                if moving {
                    self.motion.drive_time_ns += dt_ns;
                }
                if prev.engaged {
                    self.motion.engaged_distance_m += distance;
                    bucket.engaged_time_ns += dt_ns;
                    bucket.engaged_distance_m += distance;
                    if moving {
                        self.motion.engaged_drive_time_ns += dt_ns;
                    }
                }
            }
        }

        self.last_speed = Some(SpeedSample {
            time_ns,
            v_mps: v,
            engaged,
        });
    }

    /// Route a decoded CAN signal to the metric that consumes it
    pub fn on_signal(&mut self, sample: &SignalSample) {
        match sample.name.as_str() {
            STEERING_DRIVER_TORQUE => self.on_torque(sample.time_ns, sample.value),
            ODOMETER => self.on_odometer(sample.value),
            CRUISE_STATE => self.on_cruise(sample.time_ns, sample.slot, sample.value),
            _ => {}
        }
    }

    fn on_odometer(&mut self, km: f64) {
        if self.odometer.start_km.is_none() {
            self.odometer.start_km = Some(km);
        }
        self.odometer.end_km = Some(km);
        if let Some(last) = self.last_odometer {
            let step = km - last;
            if step > 0.0 && step < MAX_ODOMETER_STEP_KM && self.state == EngagementState::Engaged {
                self.odometer.engaged_km += step;
            }
        }
        self.last_odometer = Some(km);
    }

    fn on_cruise(&mut self, time_ns: u64, slot: usize, value: f64) {
        if let Some(last) = self.last_cruise_ns {
            if self.cruise_slots.iter().any(|&pressed| pressed) {
                self.cruise_press_ns += time_ns.saturating_sub(last);
            }
        }
        if self.cruise_slots.len() <= slot {
            self.cruise_slots.resize(slot + 1, false);
        }
        self.cruise_slots[slot] = value != 0.0;
        self.last_cruise_ns = Some(time_ns);
    }

    fn on_torque(&mut self, time_ns: u64, torque: f64) {
        let filtered = self.smoother.apply(torque).abs();
        let max_gap_ns = (self.config.max_torque_gap_s * NS_PER_S) as u64;

        if let Some(mut window) = self.window.take() {
            if time_ns.saturating_sub(window.last_ns) > max_gap_ns {
                self.windows.push(window.close(WindowClose::Timeout));
            } else if filtered >= self.config.sustain_torque {
                window.last_ns = time_ns;
                window.peak = window.peak.max(filtered);
                window.samples += 1;
                self.window = Some(window);
                return;
            } else {
                self.windows.push(window.close(WindowClose::Released));
                return;
            }
        }

        if self.state != EngagementState::Engaged || !self.settled(time_ns) {
            return;
        }
        if filtered > self.config.possible_override_torque {
            log::debug!(
                "{}: possible override at {} ({:.2} N·m)",
                self.drive,
                time_ns,
                filtered
            );
            self.window = Some(OpenWindow {
                start_ns: time_ns,
                last_ns: time_ns,
                peak: filtered,
                samples: 1,
                segment_index: self.current_segment.unwrap_or(0),
            });
        }
    }

    fn settled(&self, time_ns: u64) -> bool {
        let settle_ns = (self.config.engagement_settle_s * NS_PER_S) as u64;
        self.last_change_ns
            .map_or(true, |change| time_ns.saturating_sub(change) >= settle_ns)
    }

    fn close_interval(&mut self, end_ns: u64) {
        let Some(start_ns) = self.open_start_ns else {
            return;
        };
        if end_ns > start_ns {
            self.intervals.push(EngagementInterval {
                start_ns,
                end_ns,
                engaged: self.state == EngagementState::Engaged,
                cause: self.open_cause,
            });
        }
        self.open_start_ns = Some(end_ns);
    }

    fn ordering_error(&self, detail: String) -> EngineError {
        EngineError::SegmentOrdering {
            drive: self.drive.clone(),
            detail,
        }
    }

    /// Close everything at the last observed timestamp
    pub fn finish(mut self) -> EngagementTimeline {
        if let Some(window) = self.window.take() {
            self.windows.push(window.close(WindowClose::EndOfDrive));
        }
        if let (Some(start_ns), Some(last_ns)) = (self.open_start_ns, self.last_ns) {
            if last_ns > start_ns || self.intervals.is_empty() {
                self.intervals.push(EngagementInterval {
                    start_ns,
                    end_ns: last_ns,
                    engaged: self.state == EngagementState::Engaged,
                    cause: self.open_cause,
                });
            }
        }

        EngagementTimeline {
            drive: self.drive,
            first_ns: self.first_ns,
            last_ns: self.last_ns,
            intervals: self.intervals,
            windows: self.windows,
            disengage_events: self.disengage_events,
            segment_starts: self.segment_starts,
            motion: self.motion,
            odometer: self.odometer,
            cruise_press_ns: self.cruise_press_ns,
            counters: self.counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const S: u64 = 1_000_000_000;
    const MS: u64 = 1_000_000;

    fn tracker() -> EngagementTracker {
        let mut t = EngagementTracker::new("2025-07-10--10-00-00", &TrackerConfig::default(), false);
        t.begin_segment(0, 0).unwrap();
        t
    }

    fn controls(t: &mut EngagementTracker, time_ns: u64, enabled: bool, reason: u16) {
        t.observe(time_ns).unwrap();
        t.on_controls_state(
            time_ns,
            &ControlsState {
                enabled,
                disengage_reason: reason,
            },
        );
    }

    fn speed(t: &mut EngagementTracker, time_ns: u64, v: f32) {
        t.observe(time_ns).unwrap();
        t.on_car_state(
            time_ns,
            &CarState {
                v_ego: v,
                steering_angle_deg: 0.0,
            },
        );
    }

    fn signal(t: &mut EngagementTracker, name: &str, slot: usize, time_ns: u64, value: f64) {
        t.observe(time_ns).unwrap();
        t.on_signal(&SignalSample {
            name: name.to_string(),
            slot,
            time_ns,
            value,
        });
    }

    fn assert_partition(timeline: &EngagementTimeline) {
        let first = timeline.first_ns.unwrap();
        let last = timeline.last_ns.unwrap();
        assert_eq!(timeline.intervals.first().unwrap().start_ns, first);
        assert_eq!(timeline.intervals.last().unwrap().end_ns, last);
        for pair in timeline.intervals.windows(2) {
            assert_eq!(pair[0].end_ns, pair[1].start_ns);
        }
        let covered: u64 = timeline.intervals.iter().map(|i| i.duration_ns()).sum();
        assert_eq!(covered, last - first);
    }

    #[test]
    fn test_intervals_partition_drive() {
        let mut t = tracker();
        controls(&mut t, 0, false, 0);
        controls(&mut t, 2 * S, true, 0);
        controls(&mut t, 5 * S, false, 1);
        controls(&mut t, 7 * S, true, 0);
        controls(&mut t, 9 * S, true, 0);
        let timeline = t.finish();

        assert_partition(&timeline);
        assert_eq!(timeline.intervals.len(), 4);
        assert_eq!(timeline.engaged_ns(), 5 * S);
        assert_eq!(timeline.intervals[2].cause, Some(DisengageCause::DriverBrake));
        assert_eq!(timeline.intervals[0].cause, None);
        assert_eq!(timeline.counters.state_changes, 3);
        assert_eq!(timeline.counters.disengagements, 1);
        assert_eq!(timeline.counters.reengagements, 1);
    }

    #[test]
    fn test_final_disengage_closes_interval_at_last_record() {
        let mut t = tracker();
        controls(&mut t, S, true, 0);
        controls(&mut t, 4 * S, false, 2);
        let timeline = t.finish();

        assert_partition(&timeline);
        let last = timeline.intervals.last().unwrap();
        assert!(last.engaged);
        assert_eq!(last.end_ns, 4 * S);
        assert_eq!(timeline.disengage_events.len(), 1);
        assert_eq!(timeline.disengage_events[0].cause, DisengageCause::DriverCancel);
    }

    #[test]
    fn test_single_timestamp_drive_yields_zero_length_interval() {
        let mut t = tracker();
        controls(&mut t, 5 * S, true, 0);
        let timeline = t.finish();
        assert_eq!(timeline.intervals.len(), 1);
        assert_eq!(timeline.intervals[0].duration_ns(), 0);
        assert_eq!(timeline.elapsed_ns(), 0);
    }

    #[test]
    fn test_empty_drive_has_no_intervals() {
        let timeline = tracker().finish();
        assert!(timeline.intervals.is_empty());
        assert_eq!(timeline.engaged_ns(), 0);
    }

    #[test]
    fn test_segment_ordering() {
        let mut t = tracker();
        assert!(t.begin_segment(2, 0).is_err());

        let mut t = tracker();
        t.begin_segment(1, 60 * S).unwrap();
        let err = t.begin_segment(1, 120 * S).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SegmentOrdering);

        let mut t = EngagementTracker::new("d", &TrackerConfig::default(), false);
        assert!(t.begin_segment(1, 0).is_err());

        let mut t = EngagementTracker::new("d", &TrackerConfig::default(), true);
        t.begin_segment(1, 0).unwrap();
        t.begin_segment(4, 0).unwrap();
        assert!(t.begin_segment(3, 0).is_err());
    }

    #[test]
    fn test_clock_going_backwards_is_ordering_error() {
        let mut t = tracker();
        t.observe(10 * S).unwrap();
        t.begin_segment(1, 5 * S).unwrap();
        let err = t.observe(5 * S).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SegmentOrdering);
    }

    #[test]
    fn test_trapezoidal_distance_and_gaps() {
        let mut t = tracker();
        controls(&mut t, 0, true, 0);
        speed(&mut t, 0, 10.0);
        speed(&mut t, 500 * MS, 20.0); // 7.5 m
        speed(&mut t, 5 * S, 20.0); // 4.5 s gap: no distance
        speed(&mut t, 6 * S, 20.0); // 20 m
        let timeline = t.finish();

        assert_relative_eq!(timeline.motion.distance_m, 27.5, epsilon = 1e-9);
        assert_relative_eq!(timeline.motion.engaged_distance_m, 27.5, epsilon = 1e-9);
        assert_eq!(timeline.motion.drive_time_ns, 1500 * MS);
        let road = timeline.motion.bucket(SpeedBucket::Road);
        assert_eq!(road.time_ns, S);
        assert_relative_eq!(road.distance_m, 20.0, epsilon = 1e-9);
        assert_relative_eq!(timeline.motion.bucket(SpeedBucket::City).distance_m, 7.5, epsilon = 1e-9);
    }

    #[test]
    fn test_engaged_distance_uses_state_at_earlier_sample() {
        let mut t = tracker();
        speed(&mut t, 0, 10.0);
        controls(&mut t, 500 * MS, true, 0);
        speed(&mut t, S, 10.0); // attributed to disengaged
        speed(&mut t, 2 * S, 10.0); // engaged
        let timeline = t.finish();
        assert_relative_eq!(timeline.motion.distance_m, 20.0, epsilon = 1e-9);
        assert_relative_eq!(timeline.motion.engaged_distance_m, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_standstill_is_not_drive_time() {
        let mut t = tracker();
        speed(&mut t, 0, 0.5);
        speed(&mut t, S, 0.5);
        let timeline = t.finish();
        assert_eq!(timeline.motion.drive_time_ns, 0);
    }

    #[test]
    fn test_odometer_and_cruise() {
        let mut t = tracker();
        signal(&mut t, ODOMETER, 0, 0, 1000.0);
        controls(&mut t, S, true, 0);
        signal(&mut t, ODOMETER, 0, 2 * S, 1000.5);
        signal(&mut t, ODOMETER, 0, 3 * S, 1005.0); // glitch
        signal(&mut t, ODOMETER, 0, 4 * S, 1005.2);
        signal(&mut t, CRUISE_STATE, 1, 5 * S, 1.0);
        signal(&mut t, CRUISE_STATE, 1, 6 * S, 1.0);
        signal(&mut t, CRUISE_STATE, 1, 7 * S, 0.0);
        signal(&mut t, CRUISE_STATE, 0, 8 * S, 0.0);
        let timeline = t.finish();

        assert_eq!(timeline.odometer.start_km, Some(1000.0));
        assert_relative_eq!(timeline.odometer.distance_km().unwrap(), 5.2, epsilon = 1e-9);
        assert_relative_eq!(timeline.odometer.engaged_km, 0.7, epsilon = 1e-9);
        assert_eq!(timeline.cruise_press_ns, 2 * S);
    }

    fn torque_run(t: &mut EngagementTracker, from_ns: u64, to_ns: u64, value: f64) {
        let mut time = from_ns;
        while time < to_ns {
            signal(t, STEERING_DRIVER_TORQUE, 0, time, value);
            time += 10 * MS;
        }
    }

    #[test]
    fn test_torque_window_opens_and_releases() {
        let mut t = tracker();
        controls(&mut t, 0, true, 0);
        torque_run(&mut t, 4 * S, 5 * S, 0.0);
        torque_run(&mut t, 5 * S, 6 * S, 3.5);
        torque_run(&mut t, 6 * S, 7 * S, 0.0);
        let timeline = t.finish();

        assert_eq!(timeline.windows.len(), 1);
        let w = &timeline.windows[0];
        assert_eq!(w.closed_by, WindowClose::Released);
        assert_relative_eq!(w.peak_torque, 3.5, epsilon = 1e-9);
        assert!(w.duration_s() > 0.95 && w.duration_s() < 1.05);
    }

    #[test]
    fn test_torque_ignored_while_settling_or_disengaged() {
        let mut t = tracker();
        torque_run(&mut t, 0, S, 5.0);
        controls(&mut t, 2 * S, true, 0);
        torque_run(&mut t, 2 * S, 4 * S, 5.0);
        let timeline = t.finish();
        assert!(timeline.windows.is_empty());
    }

    #[test]
    fn test_window_closes_on_disengage_and_timeout() {
        let mut t = tracker();
        controls(&mut t, 0, true, 0);
        torque_run(&mut t, 4 * S, 5 * S, 4.0);
        signal(&mut t, STEERING_DRIVER_TORQUE, 0, 7 * S, 4.0);
        torque_run(&mut t, 7 * S + 10 * MS, 8 * S, 4.0);
        controls(&mut t, 8 * S, false, 3);
        let timeline = t.finish();

        assert_eq!(timeline.windows.len(), 2);
        assert_eq!(timeline.windows[0].closed_by, WindowClose::Timeout);
        assert_eq!(timeline.windows[1].closed_by, WindowClose::Disengaged);
    }

    #[test]
    fn test_open_window_closed_at_end_of_drive() {
        let mut t = tracker();
        controls(&mut t, 0, true, 0);
        torque_run(&mut t, 4 * S, 5 * S, 4.0);
        let timeline = t.finish();
        assert_eq!(timeline.windows.len(), 1);
        assert_eq!(timeline.windows[0].closed_by, WindowClose::EndOfDrive);
    }

    #[test]
    fn test_segment_at() {
        let mut t = tracker();
        t.observe(0).unwrap();
        t.begin_segment(1, 60 * S).unwrap();
        t.observe(61 * S).unwrap();
        let timeline = t.finish();
        assert_eq!(timeline.segment_at(30 * S), Some((0, 0)));
        assert_eq!(timeline.segment_at(61 * S), Some((1, 60 * S)));
    }

    #[test]
    fn test_cause_codes() {
        assert_eq!(DisengageCause::from_code(4), DisengageCause::SystemFault);
        assert_eq!(DisengageCause::from_code(42), DisengageCause::Other(42));
    }
}

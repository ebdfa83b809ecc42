use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;
use crate::engagement::{CandidateWindow, EngagementTimeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Confirmed,
    /// Held for less than the minimum duration
    TooShort,
    /// Never reached the confirmation torque
    TooWeak,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionEvent {
    pub window: CandidateWindow,
    pub outcome: Outcome,
    /// Padded span for manual review, clipped to the drive (confirmed only)
    pub review_start_ns: Option<u64>,
    pub review_end_ns: Option<u64>,
}

impl InterventionEvent {
    pub fn is_confirmed(&self) -> bool {
        self.outcome == Outcome::Confirmed
    }
}

pub struct InterventionClassifier {
    config: ClassifierConfig,
}

impl InterventionClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn classify_window(&self, window: &CandidateWindow) -> Outcome {
        if window.duration_s() < self.config.min_duration_s {
            Outcome::TooShort
        } else if window.peak_torque < self.config.confirm_torque {
            Outcome::TooWeak
        } else {
            Outcome::Confirmed
        }
    }

    /// Judge every candidate window of a drive, in window order
    pub fn classify(&self, timeline: &EngagementTimeline) -> Vec<InterventionEvent> {
        let first = timeline.first_ns.unwrap_or(0);
        let last = timeline.last_ns.unwrap_or(first);
        let lead_ns = (self.config.review_lead_s.max(0.0) * 1e9) as u64;
        let trail_ns = (self.config.review_trail_s.max(0.0) * 1e9) as u64;

        timeline
            .windows
            .iter()
            .map(|window| {
                let outcome = self.classify_window(window);
                let (review_start_ns, review_end_ns) = if outcome == Outcome::Confirmed {
                    (
                        Some(window.start_ns.saturating_sub(lead_ns).max(first)),
                        Some(window.end_ns.saturating_add(trail_ns).min(last)),
                    )
                } else {
                    (None, None)
                };
                if outcome == Outcome::Confirmed {
                    log::info!(
                        "{}: steering intervention {:.1}s, peak {:.2} N·m",
                        timeline.drive,
                        window.duration_s(),
                        window.peak_torque
                    );
                } else {
                    log::debug!(
                        "{}: rejected torque window ({:?}) {:.2}s / {:.2} N·m",
                        timeline.drive,
                        outcome,
                        window.duration_s(),
                        window.peak_torque
                    );
                }
                InterventionEvent {
                    window: window.clone(),
                    outcome,
                    review_start_ns,
                    review_end_ns,
                }
            })
            .collect()
    }
}

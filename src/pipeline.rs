//! Single-drive pipeline: decode -> extract -> track -> classify -> aggregate.

use std::path::PathBuf;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::discovery::DriveListing;
use crate::engagement::{EngagementTimeline, EngagementTracker};
use crate::error::{EngineError, EngineResult};
use crate::intervention::{InterventionClassifier, InterventionEvent};
use crate::segment::{LogSegment, RecordPayload, SegmentDecoder, SegmentId};
use crate::signals::{ProfileMatch, ProfileSet, SignalExtractor};
use crate::stats::{aggregate, check_complete, DriveContext, DriveMetadata, DriveStats};
use crate::store::debug_log::{EVENT_DISENGAGEMENT, EVENT_STEER_INTERVENTION};
use crate::store::{DebugEvent, DebugKind};

/// Version metadata is only looked for in the first few segments
pub const METADATA_SEGMENTS: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct DriveOptions {
    /// Drive is still being recorded or fetched; missing logs are allowed
    pub partial: bool,
    /// Accept non-contiguous segment indices
    pub tolerate_gaps: bool,
}

#[derive(Debug, Clone)]
pub struct DriveOutput {
    pub stats: DriveStats,
    pub events: Vec<InterventionEvent>,
    pub debug_events: Vec<DebugEvent>,
    /// CAN frames dropped by the signal extractor
    pub skipped_frames: usize,
}

pub struct DriveProcessor {
    config: EngineConfig,
    profiles: ProfileSet,
    profile_override: Option<String>,
    debug: Option<DebugKind>,
}

impl DriveProcessor {
    pub fn new(config: EngineConfig, profiles: ProfileSet) -> Self {
        Self {
            config,
            profiles,
            profile_override: None,
            debug: None,
        }
    }

    pub fn with_profile_override(mut self, name: Option<String>) -> Self {
        self.profile_override = name;
        self
    }

    pub fn with_debug(mut self, kind: Option<DebugKind>) -> Self {
        self.debug = kind;
        self
    }

    pub fn process(&self, listing: &DriveListing, options: DriveOptions) -> EngineResult<DriveOutput> {
        check_complete(&listing.drive, listing.present(), options.partial)?;

        let decoder = SegmentDecoder::new(&self.config.decoder);
        let mut segments: Vec<(LogSegment, PathBuf)> = Vec::with_capacity(listing.segments.len());
        for entry in &listing.segments {
            let Some(path) = &entry.log_path else {
                continue;
            };
            let id = SegmentId::new(listing.device_id.clone(), listing.drive.clone(), entry.index);
            let segment = decoder.decode_file(id, path)?;
            log::debug!("Decoded {} ({} records)", segment.id, segment.record_count());
            segments.push((segment, path.clone()));
        }
        if segments.is_empty() {
            return Err(EngineError::IncompleteDrive {
                drive: listing.drive.clone(),
                missing: listing.segments.iter().map(|s| s.index).collect(),
            });
        }

        let metadata = scan_metadata(segments.iter().map(|(s, _)| s).take(METADATA_SEGMENTS));
        let extractor = self.select_extractor(listing, &metadata);

        let mut tracker = EngagementTracker::new(
            listing.drive.clone(),
            &self.config.tracker,
            options.tolerate_gaps || options.partial,
        );
        let mut skipped_frames = 0usize;
        for (segment, _) in &segments {
            tracker.begin_segment(segment.id.index, segment.start_mono_ns)?;
            for record in &segment.records {
                let time_ns = segment.drive_time_ns(record);
                tracker.observe(time_ns)?;
                match &record.payload {
                    RecordPayload::ControlsState(controls) => {
                        tracker.on_controls_state(time_ns, controls)
                    }
                    RecordPayload::CarState(car) => tracker.on_car_state(time_ns, car),
                    RecordPayload::Can(frames) => {
                        let Some(extractor) = &extractor else {
                            continue;
                        };
                        for frame in frames {
                            match extractor.extract(frame, time_ns) {
                                Ok(samples) => samples.iter().for_each(|s| tracker.on_signal(s)),
                                Err(e) => {
                                    if skipped_frames == 0 {
                                        log::warn!("{}: {}: {}; skipping frame", segment.id, e.kind(), e);
                                    } else {
                                        log::debug!("{}: {}: {}; skipping frame", segment.id, e.kind(), e);
                                    }
                                    skipped_frames += 1;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        if skipped_frames > 1 {
            log::warn!(
                "{}/{}: skipped {} undecodable CAN frames",
                listing.device_id,
                listing.drive,
                skipped_frames
            );
        }

        let timeline = tracker.finish();
        let events = InterventionClassifier::new(&self.config.classifier).classify(&timeline);

        let ctx = DriveContext {
            device_id: listing.device_id.clone(),
            drive: listing.drive.clone(),
            segment_count: segments.len() as u32,
            partial: options.partial,
            metadata,
            profile: extractor.as_ref().map(|e| e.profile_name().to_string()),
        };
        let stats = aggregate(&ctx, &timeline, &events, Utc::now());

        let debug_events = match self.debug {
            Some(kind) => self.debug_events(kind, listing, &segments, &timeline, &events),
            None => Vec::new(),
        };

        Ok(DriveOutput {
            stats,
            events,
            debug_events,
            skipped_frames,
        })
    }

    fn select_extractor(&self, listing: &DriveListing, metadata: &DriveMetadata) -> Option<SignalExtractor> {
        let fingerprint = metadata.fingerprint.as_deref();
        match self.profiles.resolve(fingerprint, self.profile_override.as_deref()) {
            Some((profile, how)) => {
                if how != ProfileMatch::Fingerprint {
                    log::info!(
                        "{}/{}: using vehicle profile {} ({:?} match)",
                        listing.device_id,
                        listing.drive,
                        profile.name,
                        how
                    );
                }
                Some(SignalExtractor::new(profile))
            }
            None => {
                if let Some(name) = &self.profile_override {
                    log::warn!("Vehicle profile {} is not defined", name);
                }
                log::warn!(
                    "{}/{}: no vehicle profile for fingerprint {}; CAN decoding skipped",
                    listing.device_id,
                    listing.drive,
                    fingerprint.unwrap_or("<none>")
                );
                None
            }
        }
    }

    fn debug_events(
        &self,
        kind: DebugKind,
        listing: &DriveListing,
        segments: &[(LogSegment, PathBuf)],
        timeline: &EngagementTimeline,
        events: &[InterventionEvent],
    ) -> Vec<DebugEvent> {
        let first = timeline.first_ns.unwrap_or(0);
        let last = timeline.last_ns.unwrap_or(first);
        let rel = |t: u64| t.saturating_sub(first) as f64 / 1e9;
        let lead_ns = (self.config.classifier.review_lead_s.max(0.0) * 1e9) as u64;
        let trail_ns = (self.config.classifier.review_trail_s.max(0.0) * 1e9) as u64;

        let locate = |time_ns: u64| {
            let (segment_index, start) = timeline.segment_at(time_ns).unwrap_or((0, first));
            let path = segments
                .iter()
                .find(|(s, _)| s.id.index == segment_index)
                .map(|(_, p)| p.display().to_string())
                .unwrap_or_default();
            (segment_index, path, time_ns.saturating_sub(start) as f64 / 1e9)
        };

        let mut out = Vec::new();
        if kind.wants_steer() {
            for event in events.iter().filter(|e| e.is_confirmed()) {
                let w = &event.window;
                let (segment_index, segment_path, time_in_segment_s) = locate(w.start_ns);
                out.push(DebugEvent {
                    device_id: listing.device_id.clone(),
                    drive: listing.drive.clone(),
                    event_type: EVENT_STEER_INTERVENTION.to_string(),
                    segment_index,
                    segment_path,
                    time_in_segment_s,
                    window_start_s: rel(w.start_ns),
                    window_end_s: rel(w.end_ns),
                    review_start_s: rel(event.review_start_ns.unwrap_or(w.start_ns)),
                    review_end_s: rel(event.review_end_ns.unwrap_or(w.end_ns)),
                    detail: format!(
                        "peak {:.2} N·m over {:.2}s ({} samples)",
                        w.peak_torque,
                        w.duration_s(),
                        w.sample_count
                    ),
                });
            }
        }
        if kind.wants_disengagement() {
            for d in &timeline.disengage_events {
                let (segment_index, segment_path, time_in_segment_s) = locate(d.time_ns);
                out.push(DebugEvent {
                    device_id: listing.device_id.clone(),
                    drive: listing.drive.clone(),
                    event_type: EVENT_DISENGAGEMENT.to_string(),
                    segment_index,
                    segment_path,
                    time_in_segment_s,
                    window_start_s: rel(d.time_ns),
                    window_end_s: rel(d.time_ns),
                    review_start_s: rel(d.time_ns.saturating_sub(lead_ns).max(first)),
                    review_end_s: rel(d.time_ns.saturating_add(trail_ns).min(last)),
                    detail: format!("{:?}", d.cause),
                });
            }
        }
        out
    }
}

/// First InitData and CarParams among `segments`
pub fn scan_metadata<'a>(segments: impl IntoIterator<Item = &'a LogSegment>) -> DriveMetadata {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    let mut meta = DriveMetadata::default();
    let mut seen_init = false;
    let mut seen_params = false;

    for segment in segments {
        for record in &segment.records {
            match &record.payload {
                RecordPayload::InitData(init) if !seen_init => {
                    meta.version = non_empty(&init.version);
                    meta.git_branch = non_empty(&init.git_branch);
                    meta.git_commit = non_empty(&init.git_commit);
                    meta.device_type = non_empty(&init.device_type);
                    seen_init = true;
                }
                RecordPayload::CarParams(params) if !seen_params => {
                    meta.fingerprint = non_empty(&params.fingerprint);
                    meta.openpilot_longitudinal = Some(params.openpilot_longitudinal);
                    seen_params = true;
                }
                _ => {}
            }
            if seen_init && seen_params {
                return meta;
            }
        }
    }
    meta
}

//! Bounded parallel processing of many drives.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::discovery::DriveListing;
use crate::error::{EngineError, ErrorKind};
use crate::pipeline::{DriveOptions, DriveProcessor};
use crate::store::{DebugEventLog, MergeEngine, MergeOutcome};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub reprocess: bool,
    pub drive: DriveOptions,
    pub workers: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            reprocess: false,
            drive: DriveOptions::default(),
            workers: default_workers(),
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriveStatus {
    Merged(MergeOutcome),
    Skipped,
    Failed { kind: ErrorKind, message: String },
    /// Scheduling stopped before this drive ran
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriveReport {
    pub device_id: String,
    pub drive: String,
    pub status: DriveStatus,
}

impl fmt::Display for DriveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: ", self.device_id, self.drive)?;
        match &self.status {
            DriveStatus::Merged(MergeOutcome::Replaced) => write!(f, "ok (replaced)"),
            DriveStatus::Merged(_) => write!(f, "ok"),
            DriveStatus::Skipped => write!(f, "skipped"),
            DriveStatus::Failed { kind, message } => write!(f, "failed: {}: {}", kind, message),
            DriveStatus::NotAttempted => write!(f, "not attempted"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub drives: Vec<DriveReport>,
}

impl RunReport {
    pub fn database_failed(&self) -> bool {
        self.drives.iter().any(|r| {
            matches!(
                r.status,
                DriveStatus::Failed {
                    kind: ErrorKind::DatabaseWrite,
                    ..
                }
            )
        })
    }

    pub fn count(&self, pred: impl Fn(&DriveStatus) -> bool) -> usize {
        self.drives.iter().filter(|r| pred(&r.status)).count()
    }
}

pub struct Runner {
    processor: Arc<DriveProcessor>,
    store: Arc<MergeEngine>,
    debug_log: Option<Arc<Mutex<DebugEventLog>>>,
    options: RunOptions,
}

impl Runner {
    pub fn new(processor: DriveProcessor, store: Arc<MergeEngine>, options: RunOptions) -> Self {
        Self {
            processor: Arc::new(processor),
            store,
            debug_log: None,
            options,
        }
    }

    pub fn with_debug_log(mut self, log: Arc<Mutex<DebugEventLog>>) -> Self {
        self.debug_log = Some(log);
        self
    }

    /// Process `drives`, at most `workers` at a time. Reports come back in
    /// input order.
    pub async fn run(&self, drives: Vec<DriveListing>) -> RunReport {
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let stop = Arc::new(AtomicBool::new(false));
        let mut reports: Vec<DriveReport> = drives
            .iter()
            .map(|d| DriveReport {
                device_id: d.device_id.clone(),
                drive: d.drive.clone(),
                status: DriveStatus::NotAttempted,
            })
            .collect();
        let mut tasks = JoinSet::new();

        for (slot, listing) in drives.into_iter().enumerate() {
            if !self.options.reprocess && self.store.is_processed(&listing.device_id, &listing.drive) {
                log::info!("{}/{} already processed, skipping", listing.device_id, listing.drive);
                reports[slot].status = DriveStatus::Skipped;
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let processor = Arc::clone(&self.processor);
            let store = Arc::clone(&self.store);
            let debug_log = self.debug_log.clone();
            let stop = Arc::clone(&stop);
            let options = self.options;
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let status = guarded(&listing, || {
                    process_one(&processor, &store, debug_log.as_deref(), &listing, options)
                });
                if let DriveStatus::Failed {
                    kind: ErrorKind::DatabaseWrite,
                    ..
                } = status
                {
                    stop.store(true, Ordering::SeqCst);
                }
                (slot, status)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, status)) => reports[slot].status = status,
                Err(e) => log::error!("Drive task did not complete: {}", e),
            }
        }

        if stop.load(Ordering::SeqCst) {
            let skipped = reports
                .iter()
                .filter(|r| r.status == DriveStatus::NotAttempted)
                .count();
            log::error!("Database write failed; {} drives were not attempted", skipped);
        }
        RunReport { drives: reports }
    }
}

fn process_one(
    processor: &DriveProcessor,
    store: &MergeEngine,
    debug_log: Option<&Mutex<DebugEventLog>>,
    listing: &DriveListing,
    options: RunOptions,
) -> DriveStatus {
    log::info!(
        "Processing {}/{} ({} segments)",
        listing.device_id,
        listing.drive,
        listing.segments.len()
    );
    let output = match processor.process(listing, options.drive) {
        Ok(output) => output,
        Err(e) => return failed(listing, e),
    };

    let outcome = match store.merge(&listing.device_id, &listing.drive, output.stats, options.reprocess) {
        Ok(outcome) => outcome,
        Err(e) => return failed(listing, e),
    };
    if outcome == MergeOutcome::Skipped {
        return DriveStatus::Skipped;
    }

    if let Some(events_log) = debug_log {
        match events_log.lock() {
            Ok(mut events_log) => {
                events_log.record_drive(&listing.device_id, &listing.drive, output.debug_events)
            }
            Err(_) => log::warn!("Debug log lock poisoned; events for {} dropped", listing.drive),
        }
    }
    DriveStatus::Merged(outcome)
}

/// Run one drive, turning a panic into a `Failed` status for that drive
fn guarded(listing: &DriveListing, run: impl FnOnce() -> DriveStatus) -> DriveStatus {
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(status) => status,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic with no message".to_string());
            log::error!("{}/{} panicked: {}", listing.device_id, listing.drive, message);
            DriveStatus::Failed {
                kind: ErrorKind::Panic,
                message,
            }
        }
    }
}

fn failed(listing: &DriveListing, e: EngineError) -> DriveStatus {
    if e.is_per_drive() {
        log::warn!("{}/{} failed, will retry next run: {}", listing.device_id, listing.drive, e);
    } else {
        log::error!("{}/{} failed: {}", listing.device_id, listing.drive, e);
    }
    DriveStatus::Failed {
        kind: e.kind(),
        message: e.to_string(),
    }
}

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::Parser;

use engagement_gauge_rs::config::EngineConfig;
use engagement_gauge_rs::discovery::{filter_by_range, list_devices, list_drives};
use engagement_gauge_rs::pipeline::{DriveOptions, DriveProcessor};
use engagement_gauge_rs::runner::{default_workers, DriveStatus, RunOptions, Runner};
use engagement_gauge_rs::signals::ProfileSet;
use engagement_gauge_rs::stats::DeviceSummary;
use engagement_gauge_rs::store::debug_log::DEFAULT_DEBUG_LOG_FILE;
use engagement_gauge_rs::store::{
    DebugEventLog, DebugKind, DebugMode, MergeEngine, StorePaths, DEFAULT_DB_FILE,
    DEFAULT_INDEX_FILE,
};

#[derive(Parser, Debug)]
#[command(name = "engagement_gauge")]
#[command(about = "Aggregate driver-assist engagement statistics from recorded drive logs", long_about = None)]
struct Args {
    /// Device id, "all" for every device, or "list" to show known devices
    #[arg(long, default_value = "all")]
    device: String,

    /// Skip drives named before this (e.g. 2025-07-01--00-00-00)
    #[arg(long)]
    start: Option<String>,

    /// Skip drives named after this
    #[arg(long)]
    stop: Option<String>,

    /// Recompute drives that are already in the database
    #[arg(long, alias = "overwrite")]
    reprocess: bool,

    /// Accept drives whose segments are still missing
    #[arg(long)]
    partial: bool,

    /// Accept gaps in segment numbering
    #[arg(long)]
    tolerate_gaps: bool,

    /// Drives processed in parallel
    #[arg(long, default_value_t = default_workers())]
    workers: usize,

    /// Force a vehicle profile instead of matching by fingerprint
    #[arg(long)]
    vehicle_profile: Option<String>,

    /// Vehicle profile definitions
    #[arg(long, default_value = "config/vehicle_profiles.json")]
    profiles: PathBuf,

    /// Engine tuning file (thresholds); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Engagement database
    #[arg(long, default_value = DEFAULT_DB_FILE)]
    db: PathBuf,

    /// Processed-drives index (defaults to beside the database)
    #[arg(long)]
    index: Option<PathBuf>,

    /// Write reviewable events to the debug log
    #[arg(long, value_enum)]
    debug: Option<DebugKind>,

    /// How new debug events combine with existing ones
    #[arg(long, value_enum, default_value_t = DebugMode::Add)]
    debug_mode: DebugMode,

    /// Debug event log (defaults to beside the database)
    #[arg(long)]
    debug_log: Option<PathBuf>,

    /// Copy the database here before the first write of the run
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Root of the local log layout: <root>/<device>/<drive>--<segment>/rlog.gz
    #[arg(long, default_value = "rlogs")]
    root: PathBuf,

    /// Break the summary down by city/road/highway speed
    #[arg(long)]
    speed_buckets: bool,

    /// Explain every reported metric and exit
    #[arg(long)]
    info: bool,
}

const METRICS: &[(&str, &str)] = &[
    ("Engaged %", "Share of elapsed drive time spent engaged, from controls state."),
    (
        "Drive-time engaged %",
        "Share of moving time (speed above the moving threshold) spent engaged.",
    ),
    (
        "Distance",
        "Speed integrated over time; gaps between speed samples longer than the configured maximum add nothing.",
    ),
    (
        "Interventions",
        "Confirmed steering overrides: filtered driver torque held above the confirmation threshold for at least the minimum duration while engaged.",
    ),
    ("Interventions/100km", "Confirmed interventions per 100 km of integrated distance."),
    ("Disengagements", "Transitions from engaged to disengaged."),
    (
        "Cruise press s/h",
        "Seconds any cruise button was held, per hour of moving time. Needs a profile with cruise_state.",
    ),
    (
        "Speed buckets",
        "City below 55 km/h, road 55-90 km/h, highway 90 km/h and above. Shown as engaged time share and engaged distance share.",
    ),
];

fn print_metrics_info() {
    println!("Engagement metrics reference");
    for (name, description) in METRICS {
        println!("  {}", name);
        println!("      {}", description);
    }
}

fn beside(db: &Path, name: &str) -> PathBuf {
    db.with_file_name(name)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.info {
        print_metrics_info();
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let profiles = ProfileSet::load(&args.profiles)?;
    log::info!("Loaded {} vehicle profiles from {}", profiles.len(), args.profiles.display());

    let mut paths = StorePaths::new(
        &args.db,
        args.index
            .clone()
            .unwrap_or_else(|| beside(&args.db, DEFAULT_INDEX_FILE)),
    );
    paths.backup_dir = args.backup_dir.clone();
    let store = Arc::new(MergeEngine::open(paths)?);

    let devices = match args.device.as_str() {
        "list" => {
            let devices = list_devices(&args.root, store.device_ids())
                .with_context(|| format!("Failed to scan {}", args.root.display()))?;
            if devices.is_empty() {
                println!("No devices found under {}", args.root.display());
            }
            for device in devices {
                let local = list_drives(&args.root, &device)?.len();
                println!("{}  ({} local drives)", device, local);
            }
            return Ok(());
        }
        "all" => list_devices(&args.root, store.device_ids())
            .with_context(|| format!("Failed to scan {}", args.root.display()))?,
        device => vec![device.to_string()],
    };

    let mut drives = Vec::new();
    for device in &devices {
        let listed = list_drives(&args.root, device)
            .with_context(|| format!("Failed to list drives for {}", device))?;
        drives.extend(filter_by_range(listed, args.start.as_deref(), args.stop.as_deref()));
    }
    log::info!("Found {} drives across {} devices", drives.len(), devices.len());

    let debug_log = match args.debug {
        Some(_) => {
            let path = args
                .debug_log
                .clone()
                .unwrap_or_else(|| beside(&args.db, DEFAULT_DEBUG_LOG_FILE));
            Some(Arc::new(Mutex::new(DebugEventLog::load(&path, args.debug_mode)?)))
        }
        None => None,
    };

    let processor = DriveProcessor::new(config, profiles)
        .with_profile_override(args.vehicle_profile.clone())
        .with_debug(args.debug);
    let options = RunOptions {
        reprocess: args.reprocess,
        drive: DriveOptions {
            partial: args.partial,
            tolerate_gaps: args.tolerate_gaps,
        },
        workers: args.workers,
    };
    let mut runner = Runner::new(processor, Arc::clone(&store), options);
    if let Some(log) = &debug_log {
        runner = runner.with_debug_log(Arc::clone(log));
    }

    let report = runner.run(drives).await;
    for drive in &report.drives {
        println!("{}", drive);
    }

    if let Some(events_log) = &debug_log {
        match events_log.lock() {
            Ok(mut events_log) => match events_log.save() {
                Ok(true) => log::info!("Debug events written ({} total)", events_log.events().len()),
                Ok(false) => {}
                Err(e) => log::warn!("Could not write debug log: {}", e),
            },
            Err(_) => log::warn!("Debug log lock poisoned; not written"),
        }
    }

    print_summary(
        &store,
        &devices,
        args.start.as_deref(),
        args.stop.as_deref(),
        args.speed_buckets,
    );
    println!(
        "{} merged, {} skipped, {} failed, {} not attempted",
        report.count(|s| matches!(s, DriveStatus::Merged(_))),
        report.count(|s| matches!(s, DriveStatus::Skipped)),
        report.count(|s| matches!(s, DriveStatus::Failed { .. })),
        report.count(|s| matches!(s, DriveStatus::NotAttempted)),
    );

    if report.database_failed() {
        bail!("Engagement database {} could not be written", args.db.display());
    }
    Ok(())
}

fn pct(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1}%", v))
        .unwrap_or_else(|| "n/a".to_string())
}

fn print_summary(
    store: &MergeEngine,
    devices: &[String],
    start: Option<&str>,
    stop: Option<&str>,
    speed_buckets: bool,
) {
    let db = store.snapshot();
    for device in devices {
        let Some(drives) = db.devices.get(device) else {
            continue;
        };
        let in_range = drives.iter().filter(|d| {
            start.map_or(true, |s| d.drive.as_str() >= s) && stop.map_or(true, |s| d.drive.as_str() <= s)
        });
        let summary = DeviceSummary::from_drives(in_range);
        if summary.drives == 0 {
            continue;
        }
        let per_100km = summary
            .interventions_per_100km()
            .map(|r| format!("{:.2}/100km", r))
            .unwrap_or_else(|| "n/a".to_string());
        let press_rate = summary
            .cruise_press_seconds_per_hour()
            .map(|r| format!("{:.2}", r))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{}: {} drives, {:.1} h, {:.1}% engaged ({} of drive time), {:.1} km, {} interventions ({}), {} disengagements, cruise press {} s/h",
            device,
            summary.drives,
            summary.hours,
            summary.engagement_pct(),
            pct(summary.drive_time_engagement_pct()),
            summary.distance_km,
            summary.interventions,
            per_100km,
            summary.disengagements,
            press_rate
        );
        if speed_buckets {
            for (label, bucket) in summary.speed_buckets.labelled() {
                if bucket.seconds == 0.0 && bucket.distance_km == 0.0 {
                    continue;
                }
                println!(
                    "    {}: {} time / {} distance (time {:.1}/{:.1} min, dist {:.1}/{:.1} km)",
                    label,
                    pct(bucket.time_engagement_pct()),
                    pct(bucket.distance_engagement_pct()),
                    bucket.engaged_seconds / 60.0,
                    bucket.seconds / 60.0,
                    bucket.engaged_distance_km,
                    bucket.distance_km
                );
            }
        }
    }
}

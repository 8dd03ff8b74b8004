pub mod backfill;
pub mod capture;
pub mod chat;
pub mod cli;
pub mod clock;
pub mod dungeons;
pub mod history;
pub mod protocol;
pub mod replay;
pub mod settings;
pub mod stats;
pub mod storage;
pub mod tracker;
pub mod transcript;
pub mod watch;

use clap::Parser;
use serde::Serialize;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use crate::cli::{CliOptions, Command};
use crate::clock::{Clock, ManualClock, SystemClock};
use crate::dungeons::DungeonCatalog;
use crate::settings::{default_data_directory, TrackerSettings};
use crate::stats::{compute_stats, group_by_dungeon, group_by_team, GroupStats, RunStats};
use crate::storage::{FileStore, Persistence};
use crate::tracker::{CompletedRun, Tracker, TrackerUpdate};
use crate::transcript::FileTranscript;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsReport {
    overall: RunStats,
    by_team: Vec<GroupStats>,
    by_dungeon: Vec<GroupStats>,
}

pub fn run() -> Result<(), String> {
    init_tracing();

    let options = CliOptions::parse();
    let settings = match options.settings_path.as_deref() {
        Some(settings_path) => TrackerSettings::load(settings_path)?,
        None => TrackerSettings::default(),
    };
    let data_directory = match options.data_dir {
        Some(data_directory) => data_directory,
        None => default_data_directory()?,
    };
    let catalog = match options.client_data_path.as_deref() {
        Some(client_data_path) => load_catalog(client_data_path)?,
        None => DungeonCatalog::fallback(),
    };
    let backend = FileStore::new(data_directory);

    match options.command {
        Command::Replay { capture_path } => {
            let clock = ManualClock::new(SystemClock.now_ms());
            let mut tracker =
                Tracker::new(settings, catalog, Box::new(backend), Box::new(clock.clone()));
            tracker.on_update(Box::new(log_update));
            let summary = replay::replay_capture(&mut tracker, &clock, &capture_path)?;
            print_json(&summary)
        }
        Command::Watch { capture_path } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|error| format!("Failed to start async runtime: {error}"))?;
            let mut tracker =
                Tracker::new(settings, catalog, Box::new(backend), Box::new(SystemClock));
            tracker.on_update(Box::new(print_update));
            runtime.block_on(watch::watch_capture(&mut tracker, &capture_path))
        }
        Command::Backfill { transcript_path } => {
            let mut tracker =
                Tracker::new(settings, catalog, Box::new(backend), Box::new(SystemClock));
            let result = tracker.backfill_from_chat_history(&FileTranscript::new(transcript_path));
            print_json(&result)
        }
        Command::History {
            dungeon_id,
            difficulty_tier,
        } => {
            let runs = load_history(backend, &settings);
            let filter = stats::StatsFilter {
                dungeon_id,
                difficulty_tier,
                ..stats::StatsFilter::default()
            };
            print_json(&stats::filter_runs(&runs, &filter))
        }
        Command::Stats => {
            let runs = load_history(backend, &settings);
            print_json(&StatsReport {
                overall: compute_stats(&runs),
                by_team: group_by_team(&runs),
                by_dungeon: group_by_dungeon(&runs),
            })
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_catalog(client_data_path: &Path) -> Result<DungeonCatalog, String> {
    let raw_json = std::fs::read_to_string(client_data_path).map_err(|error| {
        format!(
            "Failed to read client data '{}': {error}",
            client_data_path.display()
        )
    })?;
    let client_data = serde_json::from_str::<serde_json::Value>(&raw_json).map_err(|error| {
        format!(
            "Failed to parse client data '{}': {error}",
            client_data_path.display()
        )
    })?;
    Ok(DungeonCatalog::from_client_data(&client_data))
}

/// Reads stored runs without constructing a tracker, so read-only commands never touch the
/// in-flight snapshot.
fn load_history(backend: FileStore, settings: &TrackerSettings) -> Vec<CompletedRun> {
    let persistence = Persistence::new(Box::new(backend), settings.debounce_ms);
    history::load_runs(&persistence)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), String> {
    let serialized = serde_json::to_string_pretty(value)
        .map_err(|error| format!("Failed to serialize output: {error}"))?;
    println!("{serialized}");
    Ok(())
}

fn log_update(update: &TrackerUpdate) {
    match update {
        TrackerUpdate::Completed(run) => tracing::info!(
            dungeon = %run.dungeon_name,
            total_time_ms = run.total_time,
            validated = run.validated,
            "Run completed"
        ),
        TrackerUpdate::Aborted {
            dungeon_name,
            reason,
        } => tracing::info!(dungeon = %dungeon_name, reason = %reason, "Run aborted"),
        TrackerUpdate::Live(_) | TrackerUpdate::Idle => {}
    }
}

fn print_update(update: &TrackerUpdate) {
    match serde_json::to_string(update) {
        Ok(serialized) => println!("{serialized}"),
        Err(error) => tracing::warn!("Failed to serialize tracker update: {error}"),
    }
}

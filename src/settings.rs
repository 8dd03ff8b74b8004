use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerSettings {
    pub snapshot_max_age_secs: u64,
    pub dedup_start_window_secs: u64,
    pub dedup_duration_tolerance_secs: u64,
    pub debounce_ms: u64,
    pub completion_grace_secs: u64,
    pub hibernation_gap_secs: u64,
    pub processed_marker_capacity: usize,
    pub tick_interval_ms: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            snapshot_max_age_secs: 600,
            dedup_start_window_secs: 10,
            dedup_duration_tolerance_secs: 2,
            debounce_ms: 1_000,
            completion_grace_secs: 10,
            hibernation_gap_secs: 300,
            processed_marker_capacity: 512,
            tick_interval_ms: 250,
        }
    }
}

impl TrackerSettings {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw_json = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => {
                return Err(format!(
                    "Failed to read tracker settings '{}': {error}",
                    path.display()
                ));
            }
        };

        serde_json::from_str::<TrackerSettings>(&raw_json).map_err(|error| {
            format!(
                "Failed to parse tracker settings '{}': {error}",
                path.display()
            )
        })
    }

    pub fn snapshot_max_age_ms(&self) -> i64 {
        secs_to_ms(self.snapshot_max_age_secs)
    }

    pub fn dedup_start_window_ms(&self) -> i64 {
        secs_to_ms(self.dedup_start_window_secs)
    }

    pub fn dedup_duration_tolerance_ms(&self) -> i64 {
        secs_to_ms(self.dedup_duration_tolerance_secs)
    }

    pub fn completion_grace_ms(&self) -> i64 {
        secs_to_ms(self.completion_grace_secs)
    }

    pub fn hibernation_gap_ms(&self) -> i64 {
        secs_to_ms(self.hibernation_gap_secs)
    }
}

fn secs_to_ms(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

pub fn default_data_directory() -> Result<PathBuf, String> {
    let home_dir = std::env::var("USERPROFILE")
        .or_else(|_| std::env::var("HOME"))
        .map_err(|_| "Unable to determine home directory")?;

    Ok(Path::new(&home_dir).join(".dungeon-tracker"))
}

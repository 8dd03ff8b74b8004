use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::chat::team_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunSource {
    #[serde(rename = "live")]
    Live,
    #[serde(rename = "chat-backfill")]
    ChatBackfill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRun {
    pub dungeon_name: String,
    #[serde(default)]
    pub dungeon_id: Option<String>,
    #[serde(default)]
    pub difficulty_tier: Option<u32>,
    pub total_time: i64,
    pub tracked_duration: i64,
    pub validated: bool,
    #[serde(default)]
    pub wave_times: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waves_completed: Option<u32>,
    pub team_key: String,
    pub source: RunSource,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub hibernation_detected: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The in-flight run, mirrored to the crash-safe snapshot after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub dungeon_hrid: String,
    pub dungeon_name: String,
    pub difficulty_tier: u32,
    pub battle_id: String,
    pub tracked_start_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_start: Option<NaiveDateTime>,
    pub current_wave: u32,
    pub waves_completed: u32,
    #[serde(default)]
    pub max_waves: Option<u32>,
    pub wave_started_ms: i64,
    #[serde(default)]
    pub wave_times: Vec<i64>,
    #[serde(default)]
    pub key_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub hibernation_suspected: bool,
    #[serde(default)]
    pub resumed: bool,
    pub saved_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
}

impl RunState {
    pub fn team_key(&self) -> String {
        team_key(self.key_counts.keys())
    }

    pub fn tracked_duration_ms(&self, now_ms: i64) -> i64 {
        self.completed_at_ms
            .unwrap_or(now_ms)
            .saturating_sub(self.tracked_start_ms)
            .max(0)
    }

    pub fn average_wave_ms(&self) -> Option<i64> {
        if self.wave_times.is_empty() {
            return None;
        }
        let total: i64 = self.wave_times.iter().sum();
        Some(total / self.wave_times.len() as i64)
    }

    pub fn live_snapshot(&self, now_ms: i64) -> LiveRunSnapshot {
        let average_wave_ms = self.average_wave_ms();
        let progress_percent = self.max_waves.filter(|max| *max > 0).map(|max| {
            (f64::from(self.waves_completed.min(max)) / f64::from(max) * 100.0 * 10.0).round()
                / 10.0
        });
        let estimated_remaining_ms = match (self.max_waves, average_wave_ms) {
            (Some(max), Some(average)) => {
                Some(i64::from(max.saturating_sub(self.waves_completed)) * average)
            }
            _ => None,
        };

        LiveRunSnapshot {
            dungeon_name: self.dungeon_name.clone(),
            dungeon_hrid: self.dungeon_hrid.clone(),
            difficulty_tier: self.difficulty_tier,
            battle_id: self.battle_id.clone(),
            current_wave: self.current_wave,
            waves_completed: self.waves_completed,
            max_waves: self.max_waves,
            progress_percent,
            elapsed_ms: self.tracked_duration_ms(now_ms),
            average_wave_ms,
            estimated_remaining_ms,
            chat_anchored: self.chat_start.is_some(),
            hibernation_suspected: self.hibernation_suspected,
            team_key: self.team_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveRunSnapshot {
    pub dungeon_name: String,
    pub dungeon_hrid: String,
    pub difficulty_tier: u32,
    pub battle_id: String,
    pub current_wave: u32,
    pub waves_completed: u32,
    pub max_waves: Option<u32>,
    pub progress_percent: Option<f64>,
    pub elapsed_ms: i64,
    pub average_wave_ms: Option<i64>,
    pub estimated_remaining_ms: Option<i64>,
    pub chat_anchored: bool,
    pub hibernation_suspected: bool,
    pub team_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TrackerUpdate {
    Live(LiveRunSnapshot),
    Completed(CompletedRun),
    Aborted {
        #[serde(rename = "dungeonName")]
        dungeon_name: String,
        reason: String,
    },
    Idle,
}

#[cfg(test)]
mod tests {
    use super::{CompletedRun, RunSource, RunState};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn sample_state() -> RunState {
        RunState {
            dungeon_hrid: "/actions/combat/chimerical_den".to_string(),
            dungeon_name: "Chimerical Den".to_string(),
            difficulty_tier: 1,
            battle_id: "77".to_string(),
            tracked_start_ms: 0,
            chat_start: None,
            current_wave: 10,
            waves_completed: 10,
            max_waves: Some(50),
            wave_started_ms: 100_000,
            wave_times: vec![10_000; 10],
            key_counts: BTreeMap::from([("Bob".to_string(), 2), ("Alice".to_string(), 3)]),
            hibernation_suspected: false,
            resumed: false,
            saved_at_ms: 100_000,
            completed_at_ms: None,
        }
    }

    #[test]
    fn live_snapshot_reports_progress_and_estimate() {
        let snapshot = sample_state().live_snapshot(105_000);

        assert_eq!(snapshot.progress_percent, Some(20.0));
        assert_eq!(snapshot.average_wave_ms, Some(10_000));
        assert_eq!(snapshot.estimated_remaining_ms, Some(400_000));
        assert_eq!(snapshot.elapsed_ms, 105_000);
        assert_eq!(snapshot.team_key, "Alice,Bob");
    }

    #[test]
    fn live_snapshot_without_max_waves_has_no_progress() {
        let mut state = sample_state();
        state.max_waves = None;

        let snapshot = state.live_snapshot(105_000);
        assert_eq!(snapshot.progress_percent, None);
        assert_eq!(snapshot.estimated_remaining_ms, None);
    }

    #[test]
    fn completed_run_uses_camel_case_and_source_tags() {
        let run = CompletedRun {
            dungeon_name: "Chimerical Den".to_string(),
            dungeon_id: None,
            difficulty_tier: None,
            total_time: 760_000,
            tracked_duration: 760_000,
            validated: true,
            wave_times: None,
            waves_completed: None,
            team_key: "Alice,Bob".to_string(),
            source: RunSource::ChatBackfill,
            timestamp: Utc
                .timestamp_millis_opt(1_767_607_205_000)
                .single()
                .expect("Expected valid timestamp"),
            hibernation_detected: false,
        };

        let value = serde_json::to_value(&run).expect("Expected run to serialize");
        assert_eq!(value["totalTime"], 760_000);
        assert_eq!(value["source"], "chat-backfill");
        assert_eq!(value["teamKey"], "Alice,Bob");
        assert!(value.get("hibernationDetected").is_none());

        let decoded: CompletedRun =
            serde_json::from_value(value).expect("Expected run to deserialize");
        assert_eq!(decoded, run);
    }
}

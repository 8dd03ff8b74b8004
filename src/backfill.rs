use chrono::NaiveDateTime;
use serde::Serialize;

use crate::chat::{parse_transcript_line, ChatReconciler, ReconcileOutcome};
use crate::clock::{ms_from_local_naive, utc_from_ms};
use crate::history::{add_runs, DedupPolicy};
use crate::storage::Persistence;
use crate::tracker::{CompletedRun, RunSource};
use crate::transcript::TranscriptLine;

const UNKNOWN_DUNGEON: &str = "Unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillResult {
    pub runs_added: usize,
    pub teams: Vec<String>,
}

/// Folds a transcript into completed runs. Only key-count pairs produce runs; a key count
/// followed by a fail or cancel produces nothing.
pub fn derive_runs(lines: &[TranscriptLine], now: NaiveDateTime) -> Vec<CompletedRun> {
    let mut events = lines
        .iter()
        .filter_map(|line| parse_transcript_line(&line.text, now, line.approx_local_time()))
        .collect::<Vec<_>>();
    events.sort_by_key(|event| event.at);

    let mut reconciler = ChatReconciler::new(events.len());
    let mut runs = Vec::new();
    for event in &events {
        let ReconcileOutcome::Bracketed(span) = reconciler.observe(event, None) else {
            continue;
        };
        if !span.is_validated() {
            continue;
        }
        let Some(start_ms) = ms_from_local_naive(span.start) else {
            tracing::debug!(start = %span.start, "Skipping run with unrepresentable start time");
            continue;
        };

        runs.push(CompletedRun {
            dungeon_name: span
                .dungeon_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_DUNGEON.to_string()),
            dungeon_id: None,
            difficulty_tier: None,
            total_time: span.duration_ms,
            tracked_duration: span.duration_ms,
            validated: true,
            wave_times: None,
            waves_completed: None,
            team_key: span.team_key(),
            source: RunSource::ChatBackfill,
            timestamp: utc_from_ms(start_ms),
            hibernation_detected: false,
        });
    }

    runs
}

pub fn backfill_runs(
    persistence: &mut Persistence,
    policy: DedupPolicy,
    lines: &[TranscriptLine],
    now: NaiveDateTime,
    now_ms: i64,
) -> BackfillResult {
    let candidates = derive_runs(lines, now);
    let candidate_count = candidates.len();

    let (added, failed) = add_runs(persistence, policy, candidates, now_ms);
    if failed {
        tracing::warn!(
            runs_found = candidate_count,
            "Failed to store runs recovered from chat history"
        );
        return BackfillResult::default();
    }

    let mut teams = added
        .iter()
        .map(|run| run.team_key.clone())
        .collect::<Vec<_>>();
    teams.sort();
    teams.dedup();

    tracing::info!(
        lines = lines.len(),
        runs_found = candidate_count,
        runs_added = added.len(),
        "Chat history backfill finished"
    );

    BackfillResult {
        runs_added: added.len(),
        teams,
    }
}

#[cfg(test)]
mod tests {
    use super::{backfill_runs, derive_runs};
    use crate::history::{load_runs, DedupPolicy};
    use crate::settings::TrackerSettings;
    use crate::storage::{MemoryStore, Persistence};
    use crate::transcript::TranscriptLine;
    use chrono::{NaiveDate, NaiveDateTime};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 6)
            .and_then(|date| date.and_hms_opt(12, 0, 0))
            .expect("Expected valid test timestamp")
    }

    fn lines(texts: &[&str]) -> Vec<TranscriptLine> {
        texts.iter().map(|text| TranscriptLine::new(*text)).collect()
    }

    fn fixture() -> (Persistence, DedupPolicy) {
        let persistence = Persistence::new(Box::new(MemoryStore::default()), 1_000);
        (persistence, DedupPolicy::from_settings(&TrackerSettings::default()))
    }

    #[test]
    fn recovers_run_from_key_count_pair() {
        let transcript = lines(&[
            "[1/5 10:00:00] Battle started: Chimerical Den",
            "[1/5 10:00:05] Key counts: [Alice - 3], [Bob - 2]",
            "[1/5 10:12:45] Key counts: [Alice - 5], [Bob - 4]",
        ]);
        let (mut persistence, policy) = fixture();

        let result = backfill_runs(&mut persistence, policy, &transcript, now(), 0);
        assert_eq!(result.runs_added, 1);
        assert_eq!(result.teams, vec!["Alice,Bob".to_string()]);

        let runs = load_runs(&persistence);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].dungeon_name, "Chimerical Den");
        assert_eq!(runs[0].total_time, 760_000);
        assert_eq!(runs[0].tracked_duration, 760_000);
        assert!(runs[0].validated);
        assert_eq!(runs[0].dungeon_id, None);
    }

    #[test]
    fn key_count_followed_by_fail_yields_nothing() {
        let transcript = lines(&[
            "[1/5 10:00:00] Battle started: Chimerical Den",
            "[1/5 10:00:05] Key counts: [Alice - 3]",
            "[1/5 10:10:05] Key counts: [Alice - 4]",
            "[1/5 10:11:00] Key counts: [Alice - 4]",
            "[1/5 10:14:00] Party failed on wave 9",
        ]);

        let runs = derive_runs(&transcript, now());
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].total_time, 600_000);
    }

    #[test]
    fn back_to_back_pairs_stay_separate_and_unnamed_runs_are_unknown() {
        let transcript = lines(&[
            "[1/5 09:00:00] Key counts: [Alice - 1]",
            "[1/5 09:10:00] Key counts: [Alice - 2]",
            "[1/5 09:10:05] Key counts: [Alice - 2]",
            "[1/5 09:25:05] Key counts: [Alice - 3]",
        ]);

        let runs = derive_runs(&transcript, now());
        let durations = runs.iter().map(|run| run.total_time).collect::<Vec<_>>();
        assert_eq!(durations, vec![600_000, 900_000]);
        assert!(runs.iter().all(|run| run.dungeon_name == "Unknown"));
    }

    #[test]
    fn out_of_order_lines_are_sorted_before_pairing() {
        let transcript = lines(&[
            "[1/5 10:12:45] Key counts: [Alice - 5]",
            "[1/5 10:00:00] Battle started: Pirate Cove",
            "[1/5 10:00:05] Key counts: [Alice - 3]",
        ]);

        let runs = derive_runs(&transcript, now());
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].dungeon_name, "Pirate Cove");
        assert_eq!(runs[0].total_time, 760_000);
    }

    #[test]
    fn second_pass_adds_nothing() {
        let transcript = lines(&[
            "[1/5 10:00:05] Key counts: [Alice - 3], [Bob - 2]",
            "[1/5 10:12:45] Key counts: [Alice - 5], [Bob - 4]",
            "[1/5 11:00:00] Key counts: [Carol - 1]",
            "[1/5 11:20:00] Key counts: [Carol - 2]",
        ]);
        let (mut persistence, policy) = fixture();

        let first = backfill_runs(&mut persistence, policy, &transcript, now(), 0);
        assert_eq!(first.runs_added, 2);
        assert_eq!(first.teams, vec!["Alice,Bob".to_string(), "Carol".to_string()]);

        let second = backfill_runs(&mut persistence, policy, &transcript, now(), 0);
        assert_eq!(second.runs_added, 0);
        assert!(second.teams.is_empty());
        assert_eq!(load_runs(&persistence).len(), 2);
    }
}

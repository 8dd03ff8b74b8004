use crate::settings::TrackerSettings;
use crate::storage::{Persistence, WriteMode, RUN_HISTORY_KEY, TRACKER_STORE};
use crate::tracker::CompletedRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupPolicy {
    pub start_window_ms: i64,
    pub duration_tolerance_ms: i64,
}

impl DedupPolicy {
    pub fn from_settings(settings: &TrackerSettings) -> Self {
        Self {
            start_window_ms: settings.dedup_start_window_ms(),
            duration_tolerance_ms: settings.dedup_duration_tolerance_ms(),
        }
    }

    /// Runs carry no server id, so identity is the team plus a start window and a duration
    /// tolerance.
    pub fn is_same_run(&self, existing: &CompletedRun, candidate: &CompletedRun) -> bool {
        if existing.team_key != candidate.team_key {
            return false;
        }

        let start_delta = existing
            .timestamp
            .signed_duration_since(candidate.timestamp)
            .num_milliseconds()
            .abs();
        let duration_delta = (existing.total_time - candidate.total_time).abs();

        start_delta <= self.start_window_ms && duration_delta <= self.duration_tolerance_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRunOutcome {
    Added,
    Duplicate,
    Failed,
}

pub fn load_runs(persistence: &Persistence) -> Vec<CompletedRun> {
    persistence.get_json(RUN_HISTORY_KEY, TRACKER_STORE, Vec::new())
}

pub fn add_run(
    persistence: &mut Persistence,
    policy: DedupPolicy,
    run: CompletedRun,
    now_ms: i64,
) -> AddRunOutcome {
    let (added, failed) = add_runs(persistence, policy, vec![run], now_ms);
    if failed {
        return AddRunOutcome::Failed;
    }
    if added.is_empty() {
        AddRunOutcome::Duplicate
    } else {
        AddRunOutcome::Added
    }
}

/// Adds every candidate not already present, in a single immediate write.
/// Returns the runs added and whether the write failed.
pub fn add_runs(
    persistence: &mut Persistence,
    policy: DedupPolicy,
    candidates: Vec<CompletedRun>,
    now_ms: i64,
) -> (Vec<CompletedRun>, bool) {
    let mut runs = load_runs(persistence);
    let mut added = Vec::new();

    for candidate in candidates {
        if runs
            .iter()
            .any(|existing| policy.is_same_run(existing, &candidate))
        {
            tracing::debug!(
                team_key = %candidate.team_key,
                total_time_ms = candidate.total_time,
                "Skipping duplicate dungeon run"
            );
            continue;
        }
        runs.push(candidate.clone());
        added.push(candidate);
    }

    if added.is_empty() {
        return (added, false);
    }

    sort_newest_first(&mut runs);
    let written = persistence.set_json(
        RUN_HISTORY_KEY,
        &runs,
        TRACKER_STORE,
        WriteMode::Immediate,
        now_ms,
    );
    if !written {
        return (Vec::new(), true);
    }

    (added, false)
}

pub fn delete_run(
    persistence: &mut Persistence,
    timestamp: chrono::DateTime<chrono::Utc>,
    team_key: &str,
    now_ms: i64,
) -> bool {
    let mut runs = load_runs(persistence);
    let before = runs.len();
    runs.retain(|run| !(run.timestamp == timestamp && run.team_key == team_key));
    if runs.len() == before {
        return false;
    }

    persistence.set_json(
        RUN_HISTORY_KEY,
        &runs,
        TRACKER_STORE,
        WriteMode::Immediate,
        now_ms,
    )
}

pub fn clear_runs(persistence: &mut Persistence) -> bool {
    persistence.delete(RUN_HISTORY_KEY, TRACKER_STORE)
}

fn sort_newest_first(runs: &mut [CompletedRun]) {
    runs.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
}

#[cfg(test)]
mod tests {
    use super::{add_run, add_runs, clear_runs, delete_run, load_runs, AddRunOutcome, DedupPolicy};
    use crate::settings::TrackerSettings;
    use crate::storage::{MemoryStore, Persistence};
    use crate::tracker::{CompletedRun, RunSource};
    use chrono::{TimeZone, Utc};

    fn run_at(start_ms: i64, total_time: i64, team_key: &str) -> CompletedRun {
        CompletedRun {
            dungeon_name: "Chimerical Den".to_string(),
            dungeon_id: None,
            difficulty_tier: None,
            total_time,
            tracked_duration: total_time,
            validated: true,
            wave_times: None,
            waves_completed: None,
            team_key: team_key.to_string(),
            source: RunSource::ChatBackfill,
            timestamp: Utc
                .timestamp_millis_opt(start_ms)
                .single()
                .expect("Expected valid timestamp"),
            hibernation_detected: false,
        }
    }

    fn fixture() -> (Persistence, MemoryStore, DedupPolicy) {
        let backend = MemoryStore::default();
        let persistence = Persistence::new(Box::new(backend.clone()), 1_000);
        let policy = DedupPolicy::from_settings(&TrackerSettings::default());
        (persistence, backend, policy)
    }

    #[test]
    fn saving_the_same_run_twice_stores_one_record() {
        let (mut persistence, _, policy) = fixture();
        let run = run_at(1_000_000, 760_000, "Alice,Bob");

        assert_eq!(add_run(&mut persistence, policy, run.clone(), 0), AddRunOutcome::Added);
        assert_eq!(add_run(&mut persistence, policy, run, 0), AddRunOutcome::Duplicate);
        assert_eq!(load_runs(&persistence).len(), 1);
    }

    #[test]
    fn dedup_respects_window_tolerance_and_team() {
        let (mut persistence, _, policy) = fixture();
        add_run(&mut persistence, policy, run_at(1_000_000, 760_000, "Alice,Bob"), 0);

        let near_duplicate = run_at(1_009_000, 761_500, "Alice,Bob");
        assert_eq!(add_run(&mut persistence, policy, near_duplicate, 0), AddRunOutcome::Duplicate);

        let outside_window = run_at(1_011_000, 760_000, "Alice,Bob");
        let different_duration = run_at(1_000_000, 763_000, "Alice,Bob");
        let different_team = run_at(1_000_000, 760_000, "Alice,Carol");
        let (added, failed) = add_runs(
            &mut persistence,
            policy,
            vec![outside_window, different_duration, different_team],
            0,
        );

        assert!(!failed);
        assert_eq!(added.len(), 3);
        assert_eq!(load_runs(&persistence).len(), 4);
    }

    #[test]
    fn history_is_kept_newest_first() {
        let (mut persistence, _, policy) = fixture();
        add_run(&mut persistence, policy, run_at(2_000_000, 1_000, "A"), 0);
        add_run(&mut persistence, policy, run_at(1_000_000, 1_000, "A"), 0);
        add_run(&mut persistence, policy, run_at(3_000_000, 1_000, "A"), 0);

        let starts = load_runs(&persistence)
            .iter()
            .map(|run| run.timestamp.timestamp_millis())
            .collect::<Vec<_>>();
        assert_eq!(starts, vec![3_000_000, 2_000_000, 1_000_000]);
    }

    #[test]
    fn failed_write_reports_failure() {
        let (mut persistence, backend, policy) = fixture();
        backend.set_unavailable(true);

        assert_eq!(
            add_run(&mut persistence, policy, run_at(1_000_000, 1_000, "A"), 0),
            AddRunOutcome::Failed
        );
    }

    #[test]
    fn deletes_single_runs_and_clears_history() {
        let (mut persistence, _, policy) = fixture();
        let first = run_at(1_000_000, 1_000, "A");
        add_run(&mut persistence, policy, first.clone(), 0);
        add_run(&mut persistence, policy, run_at(2_000_000, 1_000, "A"), 0);

        assert!(delete_run(&mut persistence, first.timestamp, "A", 0));
        assert!(!delete_run(&mut persistence, first.timestamp, "A", 0));
        assert_eq!(load_runs(&persistence).len(), 1);

        assert!(clear_runs(&mut persistence));
        assert!(load_runs(&persistence).is_empty());
    }
}

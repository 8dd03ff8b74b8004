use serde::Serialize;
use std::collections::BTreeMap;

use crate::tracker::{CompletedRun, RunSource};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsFilter {
    pub dungeon_id: Option<String>,
    pub dungeon_name: Option<String>,
    pub difficulty_tier: Option<u32>,
    pub team_key: Option<String>,
    pub source: Option<RunSource>,
    pub validated_only: bool,
}

impl StatsFilter {
    pub fn for_dungeon(dungeon_id: &str, difficulty_tier: Option<u32>) -> Self {
        Self {
            dungeon_id: Some(dungeon_id.to_string()),
            difficulty_tier,
            ..Self::default()
        }
    }

    pub fn matches(&self, run: &CompletedRun) -> bool {
        if let Some(dungeon_id) = self.dungeon_id.as_deref() {
            if run.dungeon_id.as_deref() != Some(dungeon_id) {
                return false;
            }
        }
        if let Some(dungeon_name) = self.dungeon_name.as_deref() {
            if !run.dungeon_name.eq_ignore_ascii_case(dungeon_name) {
                return false;
            }
        }
        if let Some(difficulty_tier) = self.difficulty_tier {
            if run.difficulty_tier != Some(difficulty_tier) {
                return false;
            }
        }
        if let Some(team_key) = self.team_key.as_deref() {
            if run.team_key != team_key {
                return false;
            }
        }
        if let Some(source) = self.source {
            if run.source != source {
                return false;
            }
        }
        !self.validated_only || run.validated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub total_runs: usize,
    pub validated_runs: usize,
    pub avg_time: Option<i64>,
    pub fastest_time: Option<i64>,
    pub slowest_time: Option<i64>,
    pub avg_wave_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub key: String,
    pub stats: RunStats,
}

pub fn filter_runs<'a>(runs: &'a [CompletedRun], filter: &StatsFilter) -> Vec<&'a CompletedRun> {
    runs.iter().filter(|run| filter.matches(run)).collect()
}

pub fn compute_stats<'a>(runs: impl IntoIterator<Item = &'a CompletedRun>) -> RunStats {
    let mut stats = RunStats::default();
    let mut total_time_sum: i64 = 0;
    let mut wave_time_sum: i64 = 0;
    let mut wave_count: i64 = 0;

    for run in runs {
        stats.total_runs += 1;
        if run.validated {
            stats.validated_runs += 1;
        }
        total_time_sum = total_time_sum.saturating_add(run.total_time);
        stats.fastest_time = Some(
            stats
                .fastest_time
                .map_or(run.total_time, |fastest| fastest.min(run.total_time)),
        );
        stats.slowest_time = Some(
            stats
                .slowest_time
                .map_or(run.total_time, |slowest| slowest.max(run.total_time)),
        );

        if let Some(wave_times) = run.wave_times.as_ref() {
            wave_time_sum = wave_time_sum.saturating_add(wave_times.iter().sum::<i64>());
            wave_count += wave_times.len() as i64;
        }
    }

    if stats.total_runs > 0 {
        stats.avg_time = Some(total_time_sum / stats.total_runs as i64);
    }
    if wave_count > 0 {
        stats.avg_wave_time = Some(wave_time_sum / wave_count);
    }

    stats
}

pub fn group_by_team<'a>(runs: impl IntoIterator<Item = &'a CompletedRun>) -> Vec<GroupStats> {
    group_by(runs, |run| run.team_key.clone())
}

pub fn group_by_dungeon<'a>(runs: impl IntoIterator<Item = &'a CompletedRun>) -> Vec<GroupStats> {
    group_by(runs, |run| match run.difficulty_tier {
        Some(difficulty_tier) => format!("{} T{difficulty_tier}", run.dungeon_name),
        None => run.dungeon_name.clone(),
    })
}

fn group_by<'a>(
    runs: impl IntoIterator<Item = &'a CompletedRun>,
    key_of: impl Fn(&CompletedRun) -> String,
) -> Vec<GroupStats> {
    let mut groups: BTreeMap<String, Vec<&CompletedRun>> = BTreeMap::new();
    for run in runs {
        groups.entry(key_of(run)).or_default().push(run);
    }

    let mut grouped = groups
        .into_iter()
        .map(|(key, runs)| GroupStats {
            key,
            stats: compute_stats(runs),
        })
        .collect::<Vec<_>>();
    grouped.sort_by(|left, right| {
        right
            .stats
            .total_runs
            .cmp(&left.stats.total_runs)
            .then_with(|| left.key.cmp(&right.key))
    });
    grouped
}

#[cfg(test)]
mod tests {
    use super::{compute_stats, filter_runs, group_by_dungeon, group_by_team, StatsFilter};
    use crate::tracker::{CompletedRun, RunSource};
    use chrono::{TimeZone, Utc};

    fn run(total_time: i64, team_key: &str, validated: bool) -> CompletedRun {
        CompletedRun {
            dungeon_name: "Chimerical Den".to_string(),
            dungeon_id: Some("/actions/combat/chimerical_den".to_string()),
            difficulty_tier: Some(0),
            total_time,
            tracked_duration: total_time,
            validated,
            wave_times: None,
            waves_completed: None,
            team_key: team_key.to_string(),
            source: RunSource::Live,
            timestamp: Utc
                .timestamp_millis_opt(1_767_607_205_000 + total_time)
                .single()
                .expect("Expected valid timestamp"),
            hibernation_detected: false,
        }
    }

    #[test]
    fn computes_average_fastest_and_slowest() {
        let runs = vec![run(60_000, "A", true), run(70_000, "A", false), run(80_000, "B", true)];
        let stats = compute_stats(&runs);

        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.validated_runs, 2);
        assert_eq!(stats.avg_time, Some(70_000));
        assert_eq!(stats.fastest_time, Some(60_000));
        assert_eq!(stats.slowest_time, Some(80_000));
        assert_eq!(stats.avg_wave_time, None);
    }

    #[test]
    fn empty_history_has_no_times() {
        let stats = compute_stats(&Vec::<CompletedRun>::new());
        assert_eq!(stats.total_runs, 0);
        assert_eq!(stats.avg_time, None);
        assert_eq!(stats.fastest_time, None);
    }

    #[test]
    fn averages_wave_times_across_runs() {
        let mut first = run(60_000, "A", true);
        first.wave_times = Some(vec![10_000, 20_000]);
        let mut second = run(70_000, "A", true);
        second.wave_times = Some(vec![30_000]);

        let stats = compute_stats(&[first, second]);
        assert_eq!(stats.avg_wave_time, Some(20_000));
    }

    #[test]
    fn filters_by_team_tier_and_validation() {
        let mut other_tier = run(90_000, "A", true);
        other_tier.difficulty_tier = Some(2);
        let runs = vec![run(60_000, "A", true), run(70_000, "A", false), run(80_000, "B", true), other_tier];

        let filter = StatsFilter {
            team_key: Some("A".to_string()),
            validated_only: true,
            ..StatsFilter::for_dungeon("/actions/combat/chimerical_den", Some(0))
        };
        let matching = filter_runs(&runs, &filter);
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].total_time, 60_000);
    }

    #[test]
    fn groups_by_team_and_dungeon_ordered_by_run_count() {
        let runs = vec![run(60_000, "B", true), run(70_000, "A", true), run(80_000, "A", true)];

        let teams = group_by_team(&runs);
        assert_eq!(teams[0].key, "A");
        assert_eq!(teams[0].stats.total_runs, 2);
        assert_eq!(teams[0].stats.avg_time, Some(75_000));
        assert_eq!(teams[1].key, "B");

        let dungeons = group_by_dungeon(&runs);
        assert_eq!(dungeons.len(), 1);
        assert_eq!(dungeons[0].key, "Chimerical Den T0");
        assert_eq!(dungeons[0].stats.total_runs, 3);
    }
}

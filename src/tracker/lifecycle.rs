use crate::chat::{BracketedSpan, ChatAnchor};
use crate::clock::{local_naive_from_ms, ms_from_local_naive, utc_from_ms};
use crate::history::{add_run, AddRunOutcome};
use crate::protocol::{CharacterAction, NewBattle};
use crate::storage::{WriteMode, ACTIVE_RUN_KEY, TRACKER_STORE};

use super::chat::span_matches_run;
use super::model::{CompletedRun, RunSource, RunState, TrackerUpdate};
use super::{ActiveAction, PendingCompletion, Tracker};

/// How far a chat start anchor may sit from the wave-0 battle and still be adopted by it.
const ANCHOR_ADOPTION_WINDOW_MS: i64 = 120_000;

impl Tracker {
    pub(super) fn on_new_battle(&mut self, new_battle: &NewBattle) {
        let (Some(battle_id), Some(wave)) = (new_battle.battle_id(), new_battle.wave) else {
            tracing::debug!("Dropping new_battle without battle id or wave");
            return;
        };
        let now_ms = self.now_ms();

        if let Some(mut restored) = self.restored.take() {
            if restored.battle_id == battle_id && self.is_snapshot_fresh(&restored, now_ms) {
                tracing::info!(
                    dungeon = %restored.dungeon_name,
                    battle_id = %battle_id,
                    wave = restored.current_wave,
                    "Resuming interrupted dungeon run"
                );
                restored.resumed = true;
                if let Some(chat_start) = restored.chat_start {
                    self.reconciler.seed_anchor(ChatAnchor {
                        at: chat_start,
                        counts: restored.key_counts.clone(),
                        dungeon_name: Some(restored.dungeon_name.clone()),
                    });
                }
                self.run = Some(restored);
            } else {
                tracing::info!(
                    snapshot_battle_id = %restored.battle_id,
                    battle_id = %battle_id,
                    "Discarding run snapshot for a different battle"
                );
                self.sync_snapshot();
            }
        }

        if let Some(run) = self.run.as_ref() {
            if run.battle_id == battle_id {
                if wave > run.current_wave {
                    self.advance_wave(wave, now_ms);
                } else {
                    tracing::debug!(battle_id = %battle_id, wave, "Ignoring repeated battle");
                }
                return;
            }
            self.abort("a new battle started");
        }

        if wave != 0 {
            tracing::debug!(
                battle_id = %battle_id,
                wave,
                "Ignoring battle joined mid-run; its start was not observed"
            );
            return;
        }

        self.start_run(battle_id, now_ms);
    }

    fn start_run(&mut self, battle_id: String, now_ms: i64) {
        let Some(action) = self.active_action.clone() else {
            tracing::debug!(battle_id = %battle_id, "Ignoring battle with no active action");
            return;
        };
        let Some(dungeon) = self.catalog.get(&action.hrid).cloned() else {
            tracing::debug!(action = %action.hrid, "Ignoring battle for a non-dungeon action");
            return;
        };
        if dungeon.max_waves.is_none() {
            tracing::warn!(
                dungeon = %dungeon.name,
                "Dungeon wave count is unknown; tracking wall-clock time only"
            );
        }

        let adopted_anchor = local_naive_from_ms(now_ms).and_then(|now_local| {
            self.reconciler
                .open_anchor()
                .filter(|anchor| {
                    now_local
                        .signed_duration_since(anchor.at)
                        .num_milliseconds()
                        .abs()
                        <= ANCHOR_ADOPTION_WINDOW_MS
                })
                .filter(|anchor| {
                    anchor
                        .dungeon_name
                        .as_deref()
                        .map_or(true, |name| name.eq_ignore_ascii_case(&dungeon.name))
                })
                .cloned()
        });

        let (chat_start, key_counts) = match adopted_anchor {
            Some(anchor) => (Some(anchor.at), anchor.counts),
            None => (None, Default::default()),
        };

        tracing::info!(
            dungeon = %dungeon.name,
            difficulty_tier = action.difficulty_tier,
            battle_id = %battle_id,
            chat_anchored = chat_start.is_some(),
            "Started tracking dungeon run"
        );

        self.closed_span = None;
        self.run = Some(RunState {
            dungeon_hrid: dungeon.hrid,
            dungeon_name: dungeon.name,
            difficulty_tier: action.difficulty_tier,
            battle_id,
            tracked_start_ms: now_ms,
            chat_start,
            current_wave: 0,
            waves_completed: 0,
            max_waves: dungeon.max_waves,
            wave_started_ms: now_ms,
            wave_times: Vec::new(),
            key_counts,
            hibernation_suspected: false,
            resumed: false,
            saved_at_ms: now_ms,
            completed_at_ms: None,
        });
        self.persist_run(WriteMode::Immediate);
        self.emit_live();
    }

    fn advance_wave(&mut self, wave: u32, now_ms: i64) {
        let hibernation_gap_ms = self.settings.hibernation_gap_ms();
        let Some(run) = self.run.as_mut() else {
            return;
        };

        let wave_ms = now_ms.saturating_sub(run.wave_started_ms).max(0);
        run.wave_times.push(wave_ms);
        if wave_ms > hibernation_gap_ms && !run.hibernation_suspected {
            run.hibernation_suspected = true;
            tracing::warn!(
                battle_id = %run.battle_id,
                wave = run.current_wave,
                wave_ms,
                "Wave gap exceeds hibernation threshold; tracked time is unreliable"
            );
        }
        run.current_wave = wave;
        run.waves_completed = run.waves_completed.max(wave);
        run.wave_started_ms = now_ms;

        tracing::debug!(battle_id = %run.battle_id, wave, wave_ms, "Dungeon wave advanced");
        self.persist_run(WriteMode::Debounced);
        self.emit_live();
    }

    pub(super) fn on_action_completed(&mut self, action: &CharacterAction) {
        let Some(action_hrid) = action.action_hrid.as_deref() else {
            tracing::debug!("Dropping action_completed without actionHrid");
            return;
        };
        if action.is_done
            && self
                .active_action
                .as_ref()
                .is_some_and(|active| active.hrid == action_hrid)
        {
            self.active_action = None;
        }

        let Some(max_waves) = self
            .run
            .as_ref()
            .filter(|run| run.dungeon_hrid == action_hrid)
            .map(|run| run.max_waves)
        else {
            tracing::debug!(action = %action_hrid, "Ignoring completion for an untracked action");
            return;
        };
        let Some(reported_wave) = action.wave else {
            tracing::debug!(action = %action_hrid, "Dropping action_completed without wave");
            return;
        };

        match max_waves {
            Some(max_waves) if reported_wave < max_waves => {
                self.abort(&format!("ended on wave {reported_wave} of {max_waves}"));
            }
            _ => self.complete(reported_wave),
        }
    }

    pub(super) fn on_actions_updated(&mut self, actions: &[CharacterAction]) {
        for action in actions {
            let Some(action_hrid) = action.action_hrid.as_deref() else {
                continue;
            };

            if !action.is_done {
                self.active_action = Some(ActiveAction {
                    hrid: action_hrid.to_string(),
                    difficulty_tier: action.difficulty_tier.unwrap_or(0),
                });
                continue;
            }

            if self
                .active_action
                .as_ref()
                .is_some_and(|active| active.hrid == action_hrid)
            {
                self.active_action = None;
            }

            // The final wave's completion arrives separately; only an earlier exit is an abort.
            let waves_remaining = self
                .run
                .as_ref()
                .filter(|run| run.dungeon_hrid == action_hrid)
                .and_then(|run| run.max_waves.map(|max| run.current_wave + 1 < max));
            if waves_remaining == Some(true) {
                self.abort("left the dungeon with waves remaining");
            }
        }
    }

    pub(super) fn on_init_character_data(&mut self, actions: &[CharacterAction]) {
        self.active_action = actions
            .iter()
            .filter(|action| !action.is_done)
            .find_map(|action| {
                Some(ActiveAction {
                    hrid: action.action_hrid.clone()?,
                    difficulty_tier: action.difficulty_tier.unwrap_or(0),
                })
            });
        let active_hrid = self.active_action.as_ref().map(|active| active.hrid.clone());

        let restored_inactive = self
            .restored
            .as_ref()
            .is_some_and(|restored| active_hrid.as_deref() != Some(restored.dungeon_hrid.as_str()));
        if restored_inactive {
            tracing::info!("Discarding run snapshot; its dungeon is no longer active");
            self.restored = None;
            self.sync_snapshot();
        }

        let run_inactive = self
            .run
            .as_ref()
            .is_some_and(|run| active_hrid.as_deref() != Some(run.dungeon_hrid.as_str()));
        if run_inactive {
            self.abort("dungeon action is no longer active");
        }
    }

    fn complete(&mut self, reported_wave: u32) {
        let now_ms = self.now_ms();
        let Some(mut state) = self.run.take() else {
            return;
        };

        if state.wave_times.len() < reported_wave as usize {
            state
                .wave_times
                .push(now_ms.saturating_sub(state.wave_started_ms).max(0));
        }
        state.current_wave = state.current_wave.max(reported_wave);
        state.waves_completed = state.waves_completed.max(reported_wave);
        state.completed_at_ms = Some(now_ms);

        if let Some(previous) = self.pending_completion.take() {
            self.finalize(previous.state, None);
        }

        if let Some(span) = self.closed_span.take() {
            if span_matches_run(&state, &span) {
                self.finalize(state, Some(span));
                return;
            }
        }

        if state.chat_start.is_some() || state.resumed {
            tracing::info!(
                dungeon = %state.dungeon_name,
                battle_id = %state.battle_id,
                "Dungeon run completed; waiting for closing key counts"
            );
            self.pending_completion = Some(PendingCompletion {
                state,
                deadline_ms: now_ms.saturating_add(self.settings.completion_grace_ms()),
            });
            self.sync_snapshot();
            return;
        }

        self.finalize(state, None);
    }

    /// Records a completed run. A validated chat bracket supplies the duration and start
    /// time; otherwise the wall-clock tracked duration is used.
    pub(super) fn finalize(&mut self, state: RunState, span: Option<BracketedSpan>) {
        let now_ms = self.now_ms();
        let tracked_duration = state.tracked_duration_ms(now_ms);

        let (total_time, validated, start_ms) = match span.as_ref() {
            Some(span) if span.is_validated() => (
                span.duration_ms,
                true,
                ms_from_local_naive(span.start).unwrap_or(state.tracked_start_ms),
            ),
            Some(span) => (span.duration_ms, false, state.tracked_start_ms),
            None => (tracked_duration, false, state.tracked_start_ms),
        };
        let team_key = match span.as_ref() {
            Some(span) if state.key_counts.is_empty() => span.team_key(),
            _ => state.team_key(),
        };

        let run = CompletedRun {
            dungeon_name: state.dungeon_name.clone(),
            dungeon_id: Some(state.dungeon_hrid.clone()),
            difficulty_tier: Some(state.difficulty_tier),
            total_time,
            tracked_duration,
            validated,
            wave_times: (!state.wave_times.is_empty()).then(|| state.wave_times.clone()),
            waves_completed: Some(state.waves_completed),
            team_key,
            source: RunSource::Live,
            timestamp: utc_from_ms(start_ms),
            hibernation_detected: state.hibernation_suspected,
        };

        match add_run(&mut self.persistence, self.dedup, run.clone(), now_ms) {
            AddRunOutcome::Added => tracing::info!(
                dungeon = %run.dungeon_name,
                total_time_ms = run.total_time,
                validated = run.validated,
                team_key = %run.team_key,
                "Recorded completed dungeon run"
            ),
            AddRunOutcome::Duplicate => tracing::info!(
                dungeon = %run.dungeon_name,
                team_key = %run.team_key,
                "Completed dungeon run was already recorded"
            ),
            AddRunOutcome::Failed => {
                tracing::error!(
                    dungeon = %run.dungeon_name,
                    battle_id = %state.battle_id,
                    "Failed to record completed run; keeping snapshot for retry"
                );
                if self.run.is_none() {
                    self.persistence.set_json(
                        ACTIVE_RUN_KEY,
                        &state,
                        TRACKER_STORE,
                        WriteMode::Immediate,
                        now_ms,
                    );
                }
                self.emit(&TrackerUpdate::Completed(run));
                return;
            }
        }

        self.sync_snapshot();
        self.emit(&TrackerUpdate::Completed(run));
    }

    pub(super) fn abort(&mut self, reason: &str) {
        let Some(state) = self.run.take() else {
            return;
        };
        self.closed_span = None;

        tracing::info!(
            dungeon = %state.dungeon_name,
            battle_id = %state.battle_id,
            wave = state.current_wave,
            reason,
            "Aborted dungeon run"
        );
        self.sync_snapshot();
        self.emit(&TrackerUpdate::Aborted {
            dungeon_name: state.dungeon_name,
            reason: reason.to_string(),
        });
    }
}

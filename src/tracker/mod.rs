mod chat;
mod events;
mod lifecycle;
mod model;

use chrono::{DateTime, Utc};

use crate::backfill::{backfill_runs, BackfillResult};
use crate::chat::{parse_live_chat_message, parse_transcript_line, BracketedSpan, ChatReconciler};
use crate::clock::{local_naive_from_ms, Clock};
use crate::dungeons::DungeonCatalog;
use crate::history::{self, DedupPolicy};
use crate::protocol::{decode_push_message, PushMessage};
use crate::settings::TrackerSettings;
use crate::stats::{
    compute_stats, filter_runs, group_by_dungeon, group_by_team, GroupStats, RunStats,
    StatsFilter,
};
use crate::storage::{KeyValueStore, Persistence, WriteMode, ACTIVE_RUN_KEY, TRACKER_STORE};
use crate::transcript::{TranscriptLine, TranscriptSource};

use self::events::UpdateSubscribers;

pub use self::events::{SubscriptionId, UpdateCallback};
pub use self::model::{CompletedRun, LiveRunSnapshot, RunSource, RunState, TrackerUpdate};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveAction {
    hrid: String,
    difficulty_tier: u32,
}

/// A completed run held back until its closing key count arrives or the grace deadline passes.
#[derive(Debug)]
struct PendingCompletion {
    state: RunState,
    deadline_ms: i64,
}

/// Session-scoped dungeon run tracker.
///
/// Owns the run state machine, the chat reconciler, and the persisted snapshot and history.
/// All mutation happens synchronously inside the `handle_*` entry points and [`Tracker::tick`];
/// the host drives it from a single loop.
pub struct Tracker {
    settings: TrackerSettings,
    catalog: DungeonCatalog,
    clock: Box<dyn Clock>,
    persistence: Persistence,
    dedup: DedupPolicy,
    reconciler: ChatReconciler,
    active_action: Option<ActiveAction>,
    run: Option<RunState>,
    restored: Option<RunState>,
    pending_completion: Option<PendingCompletion>,
    closed_span: Option<BracketedSpan>,
    subscribers: UpdateSubscribers,
    disposed: bool,
}

impl Tracker {
    pub fn new(
        settings: TrackerSettings,
        catalog: DungeonCatalog,
        backend: Box<dyn KeyValueStore>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let persistence = Persistence::new(backend, settings.debounce_ms);
        let dedup = DedupPolicy::from_settings(&settings);
        let reconciler = ChatReconciler::new(settings.processed_marker_capacity);

        let mut tracker = Self {
            settings,
            catalog,
            clock,
            persistence,
            dedup,
            reconciler,
            active_action: None,
            run: None,
            restored: None,
            pending_completion: None,
            closed_span: None,
            subscribers: UpdateSubscribers::default(),
            disposed: false,
        };
        tracker.restore_snapshot();
        tracker
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn handle_raw_message(&mut self, raw_json: &str) {
        match decode_push_message(raw_json) {
            Ok(message) => self.handle_push_message(&message),
            Err(error) => tracing::debug!("Dropping push message: {error}"),
        }
    }

    pub fn handle_push_message(&mut self, message: &PushMessage) {
        if self.disposed {
            tracing::debug!("Ignoring push message after dispose");
            return;
        }

        match message {
            PushMessage::NewBattle(new_battle) => self.on_new_battle(new_battle),
            PushMessage::ActionCompleted(completed) => {
                let Some(action) = completed.end_character_action.as_ref() else {
                    tracing::debug!("Dropping action_completed without endCharacterAction");
                    return;
                };
                self.on_action_completed(action);
            }
            PushMessage::ActionsUpdated(updated) => {
                self.on_actions_updated(&updated.end_character_actions)
            }
            PushMessage::ChatMessageReceived(received) => {
                let Some(event) = received.message.as_ref().and_then(parse_live_chat_message)
                else {
                    return;
                };
                self.on_chat_event(&event);
            }
            PushMessage::InitCharacterData(character_data) => {
                self.on_init_character_data(&character_data.character_actions)
            }
            PushMessage::Unknown => {}
        }
    }

    /// Feeds one rendered transcript line through the same reconciler as live chat.
    pub fn handle_transcript_line(&mut self, line: &TranscriptLine) {
        if self.disposed {
            return;
        }

        let Some(now_local) = local_naive_from_ms(self.now_ms()) else {
            return;
        };
        let Some(event) = parse_transcript_line(&line.text, now_local, line.approx_local_time())
        else {
            return;
        };
        self.on_chat_event(&event);
    }

    /// Expires the completion grace and flushes debounced writes that are due.
    pub fn tick(&mut self) {
        if self.disposed {
            return;
        }

        let now_ms = self.now_ms();
        let grace_expired = self
            .pending_completion
            .as_ref()
            .is_some_and(|pending| now_ms >= pending.deadline_ms);
        if grace_expired {
            if let Some(pending) = self.pending_completion.take() {
                tracing::info!(
                    dungeon = %pending.state.dungeon_name,
                    battle_id = %pending.state.battle_id,
                    "Closing key counts did not arrive; using tracked duration"
                );
                self.finalize(pending.state, None);
            }
        }

        self.persistence.flush_due(now_ms);
    }

    pub fn flush(&mut self) -> usize {
        self.persistence.flush_all()
    }

    /// Tears the session down: finalizes a run awaiting its closing key count, notifies
    /// subscribers, drops pending writes, and clears the persisted snapshot.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        if let Some(pending) = self.pending_completion.take() {
            self.finalize(pending.state, None);
        }

        self.subscribers.emit(&TrackerUpdate::Idle);
        self.subscribers.clear();
        self.persistence.cancel_pending();
        self.reconciler.reset();
        self.active_action = None;
        self.run = None;
        self.restored = None;
        self.closed_span = None;
        self.persistence.delete(ACTIVE_RUN_KEY, TRACKER_STORE);
        self.disposed = true;

        tracing::info!("Dungeon tracker disposed");
    }

    pub fn on_update(&mut self, callback: UpdateCallback) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn off_update(&mut self, subscription_id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(subscription_id)
    }

    pub fn get_current_run(&self) -> Option<LiveRunSnapshot> {
        let now_ms = self.now_ms();
        self.run.as_ref().map(|run| run.live_snapshot(now_ms))
    }

    pub fn get_run_history(
        &self,
        dungeon_id: &str,
        difficulty_tier: Option<u32>,
    ) -> Vec<CompletedRun> {
        let filter = StatsFilter::for_dungeon(dungeon_id, difficulty_tier);
        filter_runs(&self.get_all_runs(), &filter)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_all_runs(&self) -> Vec<CompletedRun> {
        history::load_runs(&self.persistence)
    }

    pub fn get_stats(&self, filter: &StatsFilter) -> RunStats {
        let runs = self.get_all_runs();
        compute_stats(filter_runs(&runs, filter))
    }

    pub fn get_team_stats(&self, filter: &StatsFilter) -> Vec<GroupStats> {
        let runs = self.get_all_runs();
        group_by_team(filter_runs(&runs, filter))
    }

    pub fn get_dungeon_stats(&self, filter: &StatsFilter) -> Vec<GroupStats> {
        let runs = self.get_all_runs();
        group_by_dungeon(filter_runs(&runs, filter))
    }

    pub fn delete_run(&mut self, timestamp: DateTime<Utc>, team_key: &str) -> bool {
        let now_ms = self.now_ms();
        history::delete_run(&mut self.persistence, timestamp, team_key, now_ms)
    }

    pub fn clear_history(&mut self) -> bool {
        history::clear_runs(&mut self.persistence)
    }

    pub fn backfill_from_chat_history(&mut self, source: &dyn TranscriptSource) -> BackfillResult {
        if self.disposed {
            tracing::debug!("Ignoring chat backfill after dispose");
            return BackfillResult::default();
        }

        let now_ms = self.now_ms();
        let Some(now_local) = local_naive_from_ms(now_ms) else {
            return BackfillResult::default();
        };

        let lines = source.visible_log_lines();
        backfill_runs(&mut self.persistence, self.dedup, &lines, now_local, now_ms)
    }

    fn restore_snapshot(&mut self) {
        let snapshot: Option<RunState> =
            self.persistence.get_json(ACTIVE_RUN_KEY, TRACKER_STORE, None);
        let Some(snapshot) = snapshot else {
            return;
        };

        if snapshot.completed_at_ms.is_some() {
            tracing::info!(
                dungeon = %snapshot.dungeon_name,
                battle_id = %snapshot.battle_id,
                "Finalizing run completed before restart"
            );
            self.finalize(snapshot, None);
            return;
        }

        let now_ms = self.now_ms();
        if !self.is_snapshot_fresh(&snapshot, now_ms) {
            tracing::info!(
                dungeon = %snapshot.dungeon_name,
                battle_id = %snapshot.battle_id,
                saved_at_ms = snapshot.saved_at_ms,
                "Discarding stale run snapshot"
            );
            self.persistence.delete(ACTIVE_RUN_KEY, TRACKER_STORE);
            return;
        }

        tracing::info!(
            dungeon = %snapshot.dungeon_name,
            battle_id = %snapshot.battle_id,
            wave = snapshot.current_wave,
            "Found interrupted run snapshot; waiting for matching battle"
        );
        self.restored = Some(snapshot);
    }

    fn is_snapshot_fresh(&self, snapshot: &RunState, now_ms: i64) -> bool {
        now_ms.saturating_sub(snapshot.saved_at_ms) <= self.settings.snapshot_max_age_ms()
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn persist_run(&mut self, mode: WriteMode) {
        let now_ms = self.now_ms();
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.saved_at_ms = now_ms;

        if !self
            .persistence
            .set_json(ACTIVE_RUN_KEY, &*run, TRACKER_STORE, mode, now_ms)
        {
            tracing::warn!(
                battle_id = %run.battle_id,
                "Failed to persist run snapshot; continuing without durability"
            );
        }
    }

    /// Rewrites the snapshot to whatever is still in flight: the tracked run, else a run
    /// awaiting its closing key count, else nothing.
    fn sync_snapshot(&mut self) {
        if self.run.is_some() {
            self.persist_run(WriteMode::Immediate);
            return;
        }

        let now_ms = self.now_ms();
        match self.pending_completion.as_ref() {
            Some(pending) => {
                self.persistence.set_json(
                    ACTIVE_RUN_KEY,
                    &pending.state,
                    TRACKER_STORE,
                    WriteMode::Immediate,
                    now_ms,
                );
            }
            None => {
                self.persistence.delete(ACTIVE_RUN_KEY, TRACKER_STORE);
            }
        }
    }

    fn emit(&mut self, update: &TrackerUpdate) {
        self.subscribers.emit(update);
    }

    fn emit_live(&mut self) {
        let now_ms = self.now_ms();
        let Some(snapshot) = self.run.as_ref().map(|run| run.live_snapshot(now_ms)) else {
            return;
        };
        self.subscribers.emit(&TrackerUpdate::Live(snapshot));
    }
}

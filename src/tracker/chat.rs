use crate::chat::{AnchorSource, BracketedSpan, ChatAnchor, ChatEvent, ReconcileOutcome};
use crate::clock::local_naive_from_ms;
use crate::storage::WriteMode;

use super::model::RunState;
use super::Tracker;

/// Whether a closed bracket belongs to `state`: a key-count bracket must start at the run's
/// chat anchor, a tracked-start bracket only closes a resumed run that never had one.
pub(super) fn span_matches_run(state: &RunState, span: &BracketedSpan) -> bool {
    match span.anchor_source {
        AnchorSource::KeyCount => state.chat_start == Some(span.start),
        AnchorSource::TrackedStart => state.resumed && state.chat_start.is_none(),
    }
}

impl Tracker {
    pub(super) fn on_chat_event(&mut self, event: &ChatEvent) {
        let fallback_start = self
            .run
            .as_ref()
            .or(self.pending_completion.as_ref().map(|pending| &pending.state))
            .filter(|state| state.resumed && state.chat_start.is_none())
            .and_then(|state| local_naive_from_ms(state.tracked_start_ms));

        match self.reconciler.observe(event, fallback_start) {
            ReconcileOutcome::Duplicate => {
                tracing::debug!(kind = event.kind_label(), "Ignoring duplicate chat line");
            }
            ReconcileOutcome::DungeonAnnounced { dungeon_name } => {
                self.on_dungeon_announced(&dungeon_name)
            }
            ReconcileOutcome::StartAnchored(anchor) => self.on_start_anchor(anchor),
            ReconcileOutcome::Bracketed(span) => self.on_bracket_closed(span),
            ReconcileOutcome::Abandoned { failed } => self.on_chat_abandoned(failed),
        }
    }

    fn on_dungeon_announced(&mut self, dungeon_name: &str) {
        if let Some(pending) = self.pending_completion.take() {
            self.finalize(pending.state, None);
        }

        let announced_hrid = self
            .catalog
            .find_by_name(dungeon_name)
            .map(|dungeon| dungeon.hrid.as_str());
        let switched = !dungeon_name.is_empty()
            && self.run.as_ref().is_some_and(|run| match announced_hrid {
                Some(hrid) => hrid != run.dungeon_hrid,
                None => !run.dungeon_name.eq_ignore_ascii_case(dungeon_name.trim()),
            });
        if switched {
            tracing::warn!(
                announced_dungeon = %dungeon_name,
                "Chat announced a different dungeon while tracking; resetting"
            );
            self.abort("a different dungeon started");
        }
    }

    fn on_start_anchor(&mut self, anchor: ChatAnchor) {
        if let Some(pending) = self.pending_completion.take() {
            self.finalize(pending.state, None);
        }

        let Some(run) = self.run.as_mut() else {
            tracing::debug!(at = %anchor.at, "Chat start anchor recorded before any tracked run");
            return;
        };

        tracing::info!(
            battle_id = %run.battle_id,
            at = %anchor.at,
            party_size = anchor.counts.len(),
            "Anchored run start to chat key counts"
        );
        run.chat_start = Some(anchor.at);
        run.key_counts = anchor.counts;
        self.persist_run(WriteMode::Immediate);
        self.emit_live();
    }

    fn on_bracket_closed(&mut self, span: BracketedSpan) {
        if let Some(pending) = self.pending_completion.take() {
            if span_matches_run(&pending.state, &span) {
                self.finalize(pending.state, Some(span));
                return;
            }
            self.pending_completion = Some(pending);
        }

        if self
            .run
            .as_ref()
            .is_some_and(|run| span_matches_run(run, &span))
        {
            tracing::debug!(
                duration_ms = span.duration_ms,
                "Chat bracket closed ahead of the completion event"
            );
            self.closed_span = Some(span);
            return;
        }

        tracing::debug!(
            start = %span.start,
            end = %span.end,
            "Ignoring chat bracket unrelated to the tracked run"
        );
    }

    fn on_chat_abandoned(&mut self, failed: bool) {
        if let Some(pending) = self.pending_completion.take() {
            self.finalize(pending.state, None);
        }
        self.abort(if failed { "party failed" } else { "battle ended" });
    }
}

use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashSet, VecDeque};

use super::grammar::{elapsed_ms, team_key, ChatEvent, ChatEventKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatAnchor {
    pub at: NaiveDateTime,
    pub counts: BTreeMap<String, u32>,
    pub dungeon_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorSource {
    KeyCount,
    TrackedStart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BracketedSpan {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub duration_ms: i64,
    pub start_counts: BTreeMap<String, u32>,
    pub end_counts: BTreeMap<String, u32>,
    pub dungeon_name: Option<String>,
    pub anchor_source: AnchorSource,
}

impl BracketedSpan {
    /// Only a span opened and closed by two key-count messages is validated.
    pub fn is_validated(&self) -> bool {
        self.anchor_source == AnchorSource::KeyCount
    }

    pub fn team_key(&self) -> String {
        let counts = if self.start_counts.is_empty() {
            &self.end_counts
        } else {
            &self.start_counts
        };
        team_key(counts.keys())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Duplicate,
    DungeonAnnounced {
        dungeon_name: String,
    },
    StartAnchored(ChatAnchor),
    Bracketed(BracketedSpan),
    Abandoned {
        failed: bool,
    },
}

/// Bounded set of recently seen chat line identities.
#[derive(Debug)]
pub struct ProcessedMarkers {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl ProcessedMarkers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns `false` when the marker was already recorded.
    pub fn insert(&mut self, marker: String) -> bool {
        if self.seen.contains(&marker) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(marker.clone());
        self.order.push_back(marker);
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// Pairs key-count broadcasts into run brackets.
///
/// The first key count after a battle start (or after a closed pair, fail, or cancel) opens
/// a bracket and the next one closes it. Closed pairs never chain, so back-to-back runs stay
/// separate.
#[derive(Debug)]
pub struct ChatReconciler {
    current_dungeon: Option<String>,
    open_anchor: Option<ChatAnchor>,
    processed: ProcessedMarkers,
}

impl ChatReconciler {
    pub fn new(processed_capacity: usize) -> Self {
        Self {
            current_dungeon: None,
            open_anchor: None,
            processed: ProcessedMarkers::new(processed_capacity),
        }
    }

    pub fn open_anchor(&self) -> Option<&ChatAnchor> {
        self.open_anchor.as_ref()
    }

    /// Restores a start anchor persisted with an interrupted run.
    pub fn seed_anchor(&mut self, anchor: ChatAnchor) {
        self.open_anchor = Some(anchor);
    }

    pub fn reset(&mut self) {
        self.current_dungeon = None;
        self.open_anchor = None;
        self.processed.clear();
    }

    /// Feeds one chat event. `fallback_start` is the tracked start of a run resumed without a
    /// chat anchor; when no bracket is open, a key count then closes against it instead of
    /// opening a new bracket.
    pub fn observe(
        &mut self,
        event: &ChatEvent,
        fallback_start: Option<NaiveDateTime>,
    ) -> ReconcileOutcome {
        if !self.processed.insert(event.processed_marker()) {
            return ReconcileOutcome::Duplicate;
        }

        match &event.kind {
            ChatEventKind::BattleStarted { dungeon_name } => {
                self.open_anchor = None;
                self.current_dungeon =
                    Some(dungeon_name.clone()).filter(|dungeon_name| !dungeon_name.is_empty());
                ReconcileOutcome::DungeonAnnounced {
                    dungeon_name: dungeon_name.clone(),
                }
            }
            ChatEventKind::KeyCount { counts, .. } => {
                self.observe_key_count(event.at, counts, fallback_start)
            }
            ChatEventKind::PartyFailed { .. } => {
                self.open_anchor = None;
                ReconcileOutcome::Abandoned { failed: true }
            }
            ChatEventKind::BattleEnded => {
                self.open_anchor = None;
                ReconcileOutcome::Abandoned { failed: false }
            }
        }
    }

    fn observe_key_count(
        &mut self,
        at: NaiveDateTime,
        counts: &BTreeMap<String, u32>,
        fallback_start: Option<NaiveDateTime>,
    ) -> ReconcileOutcome {
        if let Some(start_anchor) = self.open_anchor.take() {
            return ReconcileOutcome::Bracketed(BracketedSpan {
                start: start_anchor.at,
                end: at,
                duration_ms: elapsed_ms(start_anchor.at, at),
                start_counts: start_anchor.counts,
                end_counts: counts.clone(),
                dungeon_name: start_anchor.dungeon_name,
                anchor_source: AnchorSource::KeyCount,
            });
        }

        if let Some(tracked_start) = fallback_start {
            return ReconcileOutcome::Bracketed(BracketedSpan {
                start: tracked_start,
                end: at,
                duration_ms: elapsed_ms(tracked_start, at),
                start_counts: BTreeMap::new(),
                end_counts: counts.clone(),
                dungeon_name: self.current_dungeon.clone(),
                anchor_source: AnchorSource::TrackedStart,
            });
        }

        let anchor = ChatAnchor {
            at,
            counts: counts.clone(),
            dungeon_name: self.current_dungeon.clone(),
        };
        self.open_anchor = Some(anchor.clone());
        ReconcileOutcome::StartAnchored(anchor)
    }
}

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::dungeons::display_name_from_hrid;
use crate::protocol::ChatMessage;

const BATTLE_STARTED_MARKER: &str = "Battle started:";
const KEY_COUNTS_MARKER: &str = "Key counts:";
const PARTY_FAILED_MARKER: &str = "Party failed on wave";
const BATTLE_ENDED_MARKER: &str = "Battle ended:";

const SYSTEM_KEY_BATTLE_STARTED: &str = "partyBattleStarted";
const SYSTEM_KEY_KEY_COUNT: &str = "partyKeyCount";
const SYSTEM_KEY_FAILED: &str = "partyFailed";
const SYSTEM_KEY_BATTLE_ENDED: &str = "partyBattleEnded";

pub const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEventKind {
    BattleStarted {
        dungeon_name: String,
    },
    KeyCount {
        counts: BTreeMap<String, u32>,
        source_text: String,
    },
    PartyFailed {
        wave: Option<u32>,
    },
    BattleEnded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub at: NaiveDateTime,
    pub kind: ChatEventKind,
}

impl ChatEvent {
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            ChatEventKind::BattleStarted { .. } => "battle_started",
            ChatEventKind::KeyCount { .. } => "key_count",
            ChatEventKind::PartyFailed { .. } => "party_failed",
            ChatEventKind::BattleEnded => "battle_ended",
        }
    }

    /// Identity used to drop duplicate deliveries of the same chat line.
    pub fn processed_marker(&self) -> String {
        let detail = match &self.kind {
            ChatEventKind::BattleStarted { dungeon_name } => dungeon_name.clone(),
            ChatEventKind::KeyCount { counts, .. } => format_counts(counts),
            ChatEventKind::PartyFailed { wave } => {
                wave.map(|wave| wave.to_string()).unwrap_or_default()
            }
            ChatEventKind::BattleEnded => String::new(),
        };
        format!(
            "{}|{}|{}",
            self.kind_label(),
            self.at.format("%Y-%m-%dT%H:%M:%S"),
            detail
        )
    }
}

/// Parses one rendered transcript line. `now` anchors the calendar year of the embedded
/// `[M/D h:mm:ss]` stamp; `fallback_at` is used when the line carries no stamp.
pub fn parse_transcript_line(
    text: &str,
    now: NaiveDateTime,
    fallback_at: Option<NaiveDateTime>,
) -> Option<ChatEvent> {
    let trimmed_line = text.trim();
    if trimmed_line.is_empty() {
        return None;
    }

    let (at, body) = match split_timestamp_prefix(trimmed_line, now) {
        Some((at, body)) => (at, body),
        None => (fallback_at?, trimmed_line),
    };

    let kind = parse_event_body(body)?;
    Some(ChatEvent { at, kind })
}

fn parse_event_body(body: &str) -> Option<ChatEventKind> {
    if let Some((_, rest)) = body.split_once(BATTLE_STARTED_MARKER) {
        let dungeon_name = rest.trim().trim_end_matches('.').trim();
        if dungeon_name.is_empty() {
            return None;
        }
        return Some(ChatEventKind::BattleStarted {
            dungeon_name: dungeon_name.to_string(),
        });
    }

    if let Some((_, rest)) = body.split_once(KEY_COUNTS_MARKER) {
        let source_text = rest.trim().to_string();
        let counts = parse_key_counts(&source_text)?;
        return Some(ChatEventKind::KeyCount {
            counts,
            source_text,
        });
    }

    if let Some((_, rest)) = body.split_once(PARTY_FAILED_MARKER) {
        let wave = rest
            .trim()
            .trim_end_matches('.')
            .split_whitespace()
            .next()
            .and_then(|value| value.parse::<u32>().ok());
        return Some(ChatEventKind::PartyFailed { wave });
    }

    if body.contains(BATTLE_ENDED_MARKER) {
        return Some(ChatEventKind::BattleEnded);
    }

    None
}

/// Parses `[Alice - 3], [Bob - 2]` into a name → count map. Names may contain dashes.
pub fn parse_key_counts(text: &str) -> Option<BTreeMap<String, u32>> {
    let mut counts = BTreeMap::new();
    let mut remaining = text;

    while let Some(open_index) = remaining.find('[') {
        let after_open = &remaining[open_index + 1..];
        let Some(close_index) = after_open.find(']') else {
            break;
        };
        let entry = &after_open[..close_index];
        remaining = &after_open[close_index + 1..];

        let Some((name, count)) = entry.rsplit_once('-') else {
            continue;
        };
        let name = name.trim();
        let Ok(count) = count.trim().parse::<u32>() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        counts.insert(name.to_string(), count);
    }

    if counts.is_empty() {
        return None;
    }
    Some(counts)
}

/// Recognizes live party system messages. Their timestamp is the server-assigned `t`,
/// converted to local wall-clock time so it lines up with rendered transcript stamps.
pub fn parse_live_chat_message(message: &ChatMessage) -> Option<ChatEvent> {
    if !message.is_system_message {
        return None;
    }

    let system_key = message.m.as_deref()?.rsplit('.').next()?;
    let at = parse_server_timestamp(message.t.as_deref()?)?;
    let metadata = message.metadata();

    let kind = match system_key {
        SYSTEM_KEY_BATTLE_STARTED => {
            let dungeon_name = metadata_str(metadata.as_ref(), "name")
                .map(str::to_string)
                .or_else(|| {
                    metadata_str(metadata.as_ref(), "actionHrid").map(display_name_from_hrid)
                })
                .unwrap_or_default();
            ChatEventKind::BattleStarted { dungeon_name }
        }
        SYSTEM_KEY_KEY_COUNT => {
            let source_text = metadata_str(metadata.as_ref(), "keyCountString")?.to_string();
            let counts = parse_key_counts(&source_text)?;
            ChatEventKind::KeyCount {
                counts,
                source_text,
            }
        }
        SYSTEM_KEY_FAILED => {
            let wave = metadata
                .as_ref()
                .and_then(|value| value.get("wave"))
                .and_then(|value| {
                    value
                        .as_u64()
                        .or_else(|| value.as_str().and_then(|text| text.parse::<u64>().ok()))
                })
                .and_then(|value| u32::try_from(value).ok());
            ChatEventKind::PartyFailed { wave }
        }
        SYSTEM_KEY_BATTLE_ENDED => ChatEventKind::BattleEnded,
        _ => return None,
    };

    Some(ChatEvent { at, kind })
}

fn metadata_str<'a>(metadata: Option<&'a Value>, field: &str) -> Option<&'a str> {
    metadata?
        .get(field)?
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub fn parse_server_timestamp(raw_timestamp: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(raw_timestamp.trim())
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Local).naive_local())
}

fn split_timestamp_prefix(line: &str, now: NaiveDateTime) -> Option<(NaiveDateTime, &str)> {
    let after_open = line.strip_prefix('[')?;
    let close_index = after_open.find(']')?;
    let stamp = &after_open[..close_index];
    let at = parse_chat_timestamp(stamp, now)?;
    Some((at, after_open[close_index + 1..].trim()))
}

/// Parses `M/D h:mm:ss` with an optional ` AM`/` PM` suffix against the year of `now`.
/// A result more than a day ahead of `now` belongs to the previous year.
pub fn parse_chat_timestamp(stamp: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let mut parts = stamp.split_whitespace();
    let date_part = parts.next()?;
    let time_part = parts.next()?;
    let meridiem = parts.next();
    if parts.next().is_some() {
        return None;
    }

    let (month, day) = date_part.split_once('/')?;
    let month = month.parse::<u32>().ok()?;
    let day = day.parse::<u32>().ok()?;

    let mut time_fields = time_part.split(':');
    let mut hour = time_fields.next()?.parse::<u32>().ok()?;
    let minute = time_fields.next()?.parse::<u32>().ok()?;
    let second = time_fields.next()?.parse::<u32>().ok()?;
    if time_fields.next().is_some() {
        return None;
    }

    match meridiem.map(str::to_ascii_uppercase).as_deref() {
        None => {}
        Some("AM") => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            if hour == 12 {
                hour = 0;
            }
        }
        Some("PM") => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            if hour != 12 {
                hour += 12;
            }
        }
        Some(_) => return None,
    }

    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    let candidate = NaiveDate::from_ymd_opt(now.year(), month, day)?.and_time(time);
    if candidate > now + Duration::days(1) {
        return NaiveDate::from_ymd_opt(now.year() - 1, month, day).map(|date| date.and_time(time));
    }

    Some(candidate)
}

/// Milliseconds from `start` to `end`; a negative delta is a midnight rollover.
pub fn elapsed_ms(start: NaiveDateTime, end: NaiveDateTime) -> i64 {
    let delta = end.signed_duration_since(start).num_milliseconds();
    if delta < 0 {
        delta + DAY_MS
    } else {
        delta
    }
}

/// Canonical, order-independent party identity: sorted member names joined by commas.
pub fn team_key<'a>(names: impl IntoIterator<Item = &'a String>) -> String {
    let mut names = names
        .into_iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .collect::<Vec<&str>>();
    names.sort_unstable();
    names.dedup();
    names.join(",")
}

fn format_counts(counts: &BTreeMap<String, u32>) -> String {
    counts
        .iter()
        .map(|(name, count)| format!("{name}={count}"))
        .collect::<Vec<String>>()
        .join(";")
}

use serde::Serialize;
use std::path::Path;

use crate::capture::{parse_capture_line, CaptureLine};
use crate::clock::ManualClock;
use crate::tracker::Tracker;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    pub push_messages: usize,
    pub transcript_lines: usize,
    pub skipped_lines: usize,
}

/// Dispatches one capture line into the tracker. Returns `false` for lines that were dropped.
pub fn apply_capture_line(tracker: &mut Tracker, line: &str) -> bool {
    match parse_capture_line(line) {
        Ok(CaptureLine::Push { message, .. }) => {
            tracker.handle_push_message(&message);
            true
        }
        Ok(CaptureLine::Transcript(transcript_line)) => {
            tracker.handle_transcript_line(&transcript_line);
            true
        }
        Ok(CaptureLine::Blank) => true,
        Err(error) => {
            tracing::debug!("Skipping capture line: {error}");
            false
        }
    }
}

/// Replays a capture against `tracker`, moving `clock` to each envelope's receive time.
/// Once the capture is exhausted the completion grace is allowed to lapse and everything is
/// flushed.
pub fn replay_capture(
    tracker: &mut Tracker,
    clock: &ManualClock,
    capture_path: &Path,
) -> Result<ReplaySummary, String> {
    let content = std::fs::read_to_string(capture_path).map_err(|error| {
        format!(
            "Failed to read capture file '{}': {error}",
            capture_path.display()
        )
    })?;

    let mut summary = ReplaySummary::default();
    for line in content.lines() {
        match parse_capture_line(line) {
            Ok(CaptureLine::Push {
                received_at_ms,
                message,
            }) => {
                if let Some(received_at_ms) = received_at_ms {
                    clock.set(received_at_ms);
                }
                tracker.handle_push_message(&message);
                summary.push_messages += 1;
            }
            Ok(CaptureLine::Transcript(transcript_line)) => {
                tracker.handle_transcript_line(&transcript_line);
                summary.transcript_lines += 1;
            }
            Ok(CaptureLine::Blank) => continue,
            Err(error) => {
                tracing::debug!("Skipping capture line: {error}");
                summary.skipped_lines += 1;
                continue;
            }
        }
        tracker.tick();
    }

    clock.advance(tracker.settings().completion_grace_ms());
    tracker.tick();
    tracker.flush();

    tracing::info!(
        capture = %capture_path.display(),
        push_messages = summary.push_messages,
        transcript_lines = summary.transcript_lines,
        skipped_lines = summary.skipped_lines,
        "Replayed capture"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::replay_capture;
    use crate::clock::ManualClock;
    use crate::dungeons::DungeonCatalog;
    use crate::settings::TrackerSettings;
    use crate::storage::MemoryStore;
    use crate::tracker::Tracker;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const START_MS: i64 = 1_767_607_205_000;

    fn unique_temp_file(name: &str) -> std::path::PathBuf {
        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let process_id = std::process::id();
        std::env::temp_dir().join(format!(
            "dungeon_tracker_replay_{process_id}_{timestamp_nanos}_{name}"
        ))
    }

    fn envelope(received_at_ms: i64, message: serde_json::Value) -> String {
        json!({ "receivedAt": received_at_ms, "message": message }).to_string()
    }

    #[test]
    fn replays_a_complete_run_from_capture() {
        let mut capture_lines = vec![
            envelope(
                START_MS,
                json!({
                    "type": "init_character_data",
                    "characterActions": [
                        { "actionHrid": "/actions/combat/pirate_cove", "isDone": false, "difficultyTier": 2 }
                    ]
                }),
            ),
            "not json and not a chat event".to_string(),
            "{\"broken\":".to_string(),
        ];
        for wave in 0..65_i64 {
            capture_lines.push(envelope(
                START_MS + wave * 20_000,
                json!({ "type": "new_battle", "battleId": "abc", "wave": wave }),
            ));
        }
        capture_lines.push(envelope(
            START_MS + 65 * 20_000,
            json!({
                "type": "action_completed",
                "endCharacterAction": {
                    "actionHrid": "/actions/combat/pirate_cove", "wave": 65, "isDone": true
                }
            }),
        ));

        let path = unique_temp_file("capture.jsonl");
        std::fs::write(&path, capture_lines.join("\n")).expect("Failed to write capture fixture");

        let clock = ManualClock::new(0);
        let backend = MemoryStore::default();
        let mut tracker = Tracker::new(
            TrackerSettings::default(),
            DungeonCatalog::fallback(),
            Box::new(backend),
            Box::new(clock.clone()),
        );

        let summary = replay_capture(&mut tracker, &clock, &path).expect("Expected replay to succeed");
        assert_eq!(summary.push_messages, 67);
        assert_eq!(summary.transcript_lines, 1);
        assert_eq!(summary.skipped_lines, 1);

        let runs = tracker.get_all_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].dungeon_name, "Pirate Cove");
        assert_eq!(runs[0].difficulty_tier, Some(2));
        assert_eq!(runs[0].total_time, 1_300_000);
        assert_eq!(runs[0].waves_completed, Some(65));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_capture_is_an_error() {
        let clock = ManualClock::new(0);
        let mut tracker = Tracker::new(
            TrackerSettings::default(),
            DungeonCatalog::fallback(),
            Box::new(MemoryStore::default()),
            Box::new(clock.clone()),
        );

        let error = replay_capture(&mut tracker, &clock, &unique_temp_file("missing.jsonl"))
            .expect_err("Expected missing capture to fail");
        assert!(error.contains("Failed to read capture file"));
    }
}

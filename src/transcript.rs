use chrono::{DateTime, Local, NaiveDateTime, Utc};
use std::path::PathBuf;

/// One rendered chat line. `approx_timestamp` stands in when the text carries no stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub text: String,
    pub approx_timestamp: Option<DateTime<Utc>>,
}

impl TranscriptLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            approx_timestamp: None,
        }
    }

    pub fn approx_local_time(&self) -> Option<NaiveDateTime> {
        self.approx_timestamp
            .map(|timestamp| timestamp.with_timezone(&Local).naive_local())
    }
}

/// Whatever currently holds the visible chat history.
pub trait TranscriptSource {
    fn visible_log_lines(&self) -> Vec<TranscriptLine>;
}

impl TranscriptSource for Vec<TranscriptLine> {
    fn visible_log_lines(&self) -> Vec<TranscriptLine> {
        self.clone()
    }
}

/// A saved transcript, one chat line per file line.
#[derive(Debug, Clone)]
pub struct FileTranscript {
    path: PathBuf,
}

impl FileTranscript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TranscriptSource for FileTranscript {
    fn visible_log_lines(&self) -> Vec<TranscriptLine> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(TranscriptLine::new)
                .collect(),
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "Failed to read chat transcript: {error}"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FileTranscript, TranscriptSource};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_file(name: &str) -> std::path::PathBuf {
        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let process_id = std::process::id();
        std::env::temp_dir().join(format!(
            "dungeon_tracker_transcript_{process_id}_{timestamp_nanos}_{name}"
        ))
    }

    #[test]
    fn reads_non_empty_lines_from_file() {
        let path = unique_temp_file("chat.txt");
        std::fs::write(
            &path,
            "[1/5 10:00:00] Battle started: Chimerical Den\n\n[1/5 10:00:05] Key counts: [Alice - 3]\n",
        )
        .expect("Failed to write transcript fixture");

        let lines = FileTranscript::new(&path).visible_log_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].text.contains("Key counts"));
        assert!(lines.iter().all(|line| line.approx_timestamp.is_none()));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_yields_no_lines() {
        let lines = FileTranscript::new(unique_temp_file("missing.txt")).visible_log_lines();
        assert!(lines.is_empty());
    }
}

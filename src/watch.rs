use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::replay::apply_capture_line;
use crate::tracker::Tracker;

/// Incremental reader over a capture file that is still being appended to.
#[derive(Debug)]
pub struct CaptureTail {
    path: PathBuf,
    offset: u64,
    partial_line: String,
}

impl CaptureTail {
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            partial_line: String::new(),
        }
    }

    /// Starts at the current end of the file so only new traffic is read.
    pub fn at_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = std::fs::metadata(&path)
            .map(|metadata| metadata.len())
            .unwrap_or(0);
        Self::new(path, offset)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Feeds every complete line appended since the last read into `tracker`. A trailing line
    /// without a newline is held until the rest of it arrives.
    pub fn read_new_lines(&mut self, tracker: &mut Tracker) -> Result<usize, String> {
        let mut file = File::open(&self.path).map_err(|error| {
            format!(
                "Failed to open capture file '{}': {error}",
                self.path.display()
            )
        })?;
        let file_length = file.metadata().map_err(|error| error.to_string())?.len();

        if file_length < self.offset {
            tracing::info!(
                capture = %self.path.display(),
                "Capture file was truncated; reading from the start"
            );
            self.offset = 0;
            self.partial_line.clear();
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|error| error.to_string())?;

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut applied_lines = 0;

        loop {
            line.clear();
            let bytes_read = reader
                .read_line(&mut line)
                .map_err(|error| error.to_string())?;
            if bytes_read == 0 {
                break;
            }

            self.offset = self.offset.saturating_add(bytes_read as u64);
            self.partial_line.push_str(&line);
            if !self.partial_line.ends_with('\n') {
                break;
            }

            let complete_line = std::mem::take(&mut self.partial_line);
            if apply_capture_line(tracker, &complete_line) {
                applied_lines += 1;
            }
        }

        Ok(applied_lines)
    }
}

/// Tails `capture_path` until Ctrl-C, feeding new lines into `tracker` and ticking it on the
/// configured interval.
pub async fn watch_capture(tracker: &mut Tracker, capture_path: &Path) -> Result<(), String> {
    let (notify_sender, mut notify_receiver) =
        mpsc::unbounded_channel::<Result<Event, notify::Error>>();

    let mut watcher = notify::recommended_watcher(move |result| {
        if notify_sender.send(result).is_err() {
            tracing::debug!("Capture watcher notification receiver dropped");
        }
    })
    .map_err(|error| error.to_string())?;

    let watch_directory = capture_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher
        .watch(watch_directory, RecursiveMode::NonRecursive)
        .map_err(|error| error.to_string())?;

    let mut tail = CaptureTail::at_end(capture_path);
    let tick_interval_ms = tracker.settings().tick_interval_ms.max(1);
    let mut tick_interval = tokio::time::interval(Duration::from_millis(tick_interval_ms));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!(
        capture = %capture_path.display(),
        offset = tail.offset(),
        "Watching capture file"
    );

    loop {
        tokio::select! {
            notification = notify_receiver.recv() => {
                let Some(notification_result) = notification else {
                    break;
                };
                match notification_result {
                    Ok(event) => {
                        if !is_relevant_notification(&event, capture_path) {
                            continue;
                        }
                        if let Err(error) = tail.read_new_lines(tracker) {
                            tracing::warn!("Failed to read capture update: {error}");
                        }
                    }
                    Err(error) => {
                        tracing::warn!("Capture watcher error: {error}");
                    }
                }
            }
            _ = tick_interval.tick() => {
                tracker.tick();
            }
            result = &mut shutdown => {
                if let Err(error) = result {
                    tracing::warn!("Failed to listen for shutdown signal: {error}");
                }
                break;
            }
        }
    }

    tracker.flush();
    tracing::info!("Stopped watching capture file");
    Ok(())
}

fn is_relevant_notification(event: &Event, capture_path: &Path) -> bool {
    let relevant_kind = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
    if !relevant_kind {
        return false;
    }

    let Some(capture_file_name) = capture_path.file_name() else {
        return false;
    };

    event.paths.iter().any(|path| {
        path == capture_path
            || path
                .file_name()
                .map(|file_name| file_name == capture_file_name)
                .unwrap_or(false)
    })
}

mod file_store;
mod memory;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

pub use file_store::FileStore;
pub use memory::MemoryStore;

pub const TRACKER_STORE: &str = "dungeonTracker";
pub const ACTIVE_RUN_KEY: &str = "activeRun";
pub const RUN_HISTORY_KEY: &str = "runHistory";

/// Raw keyed document storage. Values are serialized JSON documents.
pub trait KeyValueStore {
    fn read(&self, store: &str, key: &str) -> Result<Option<String>, String>;
    fn write(&self, store: &str, key: &str, value: &str) -> Result<(), String>;
    fn remove(&self, store: &str, key: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Debounced,
    Immediate,
}

#[derive(Debug)]
struct PendingWrite {
    value: String,
    due_at_ms: i64,
}

/// JSON get/set/delete over a [`KeyValueStore`], with debounced writes.
///
/// A debounced write is held in memory until `debounce_ms` of quiet has passed for its key
/// and is flushed by [`Persistence::flush_due`]. Reads always observe pending values.
/// Failures are logged and reported as `false` or the caller's default.
pub struct Persistence {
    backend: Box<dyn KeyValueStore>,
    debounce_ms: i64,
    pending: BTreeMap<(String, String), PendingWrite>,
}

impl Persistence {
    pub fn new(backend: Box<dyn KeyValueStore>, debounce_ms: u64) -> Self {
        Self {
            backend,
            debounce_ms: i64::try_from(debounce_ms).unwrap_or(i64::MAX),
            pending: BTreeMap::new(),
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str, store: &str, default: T) -> T {
        let raw_json = match self.pending.get(&pending_key(store, key)) {
            Some(pending_write) => Some(pending_write.value.clone()),
            None => match self.backend.read(store, key) {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(
                        store = %store,
                        key = %key,
                        store_error = %error,
                        "Failed to read persisted value"
                    );
                    None
                }
            },
        };

        let Some(raw_json) = raw_json else {
            return default;
        };

        match serde_json::from_str::<T>(&raw_json) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(
                    store = %store,
                    key = %key,
                    parse_error = %error,
                    "Discarding unparsable persisted value"
                );
                default
            }
        }
    }

    pub fn set_json<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
        store: &str,
        mode: WriteMode,
        now_ms: i64,
    ) -> bool {
        let serialized = match serde_json::to_string(value) {
            Ok(serialized) => serialized,
            Err(error) => {
                tracing::warn!(
                    store = %store,
                    key = %key,
                    serialize_error = %error,
                    "Failed to serialize value for persistence"
                );
                return false;
            }
        };

        match mode {
            WriteMode::Debounced => {
                self.pending.insert(
                    pending_key(store, key),
                    PendingWrite {
                        value: serialized,
                        due_at_ms: now_ms.saturating_add(self.debounce_ms),
                    },
                );
                true
            }
            WriteMode::Immediate => {
                self.pending.remove(&pending_key(store, key));
                self.write_through(store, key, &serialized)
            }
        }
    }

    pub fn delete(&mut self, key: &str, store: &str) -> bool {
        self.pending.remove(&pending_key(store, key));

        match self.backend.remove(store, key) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    store = %store,
                    key = %key,
                    store_error = %error,
                    "Failed to delete persisted value"
                );
                false
            }
        }
    }

    /// Writes every pending value whose quiet interval has elapsed. Returns the number written.
    pub fn flush_due(&mut self, now_ms: i64) -> usize {
        let due_keys = self
            .pending
            .iter()
            .filter(|(_, pending_write)| pending_write.due_at_ms <= now_ms)
            .map(|(pending_key, _)| pending_key.clone())
            .collect::<Vec<_>>();

        self.flush_keys(due_keys)
    }

    pub fn flush_all(&mut self) -> usize {
        let all_keys = self.pending.keys().cloned().collect::<Vec<_>>();
        self.flush_keys(all_keys)
    }

    pub fn cancel_pending(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(
                pending_writes = self.pending.len(),
                "Dropping pending debounced writes"
            );
        }
        self.pending.clear();
    }

    fn flush_keys(&mut self, keys: Vec<(String, String)>) -> usize {
        let mut written = 0;
        for pending_key in keys {
            let Some(pending_write) = self.pending.remove(&pending_key) else {
                continue;
            };
            let (store, key) = pending_key;
            if self.write_through(&store, &key, &pending_write.value) {
                written += 1;
            }
        }
        written
    }

    fn write_through(&self, store: &str, key: &str, serialized: &str) -> bool {
        match self.backend.write(store, key, serialized) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    store = %store,
                    key = %key,
                    store_error = %error,
                    "Failed to write persisted value"
                );
                false
            }
        }
    }
}

fn pending_key(store: &str, key: &str) -> (String, String) {
    (store.to_string(), key.to_string())
}

#[cfg(test)]
mod tests {
    use super::{MemoryStore, Persistence, WriteMode, TRACKER_STORE};

    fn persistence_with_memory(debounce_ms: u64) -> (Persistence, MemoryStore) {
        let backend = MemoryStore::default();
        let persistence = Persistence::new(Box::new(backend.clone()), debounce_ms);
        (persistence, backend)
    }

    #[test]
    fn debounced_writes_are_visible_to_reads_before_flush() {
        let (mut persistence, backend) = persistence_with_memory(1_000);

        assert!(persistence.set_json("counter", &1_u32, TRACKER_STORE, WriteMode::Debounced, 0));
        assert!(persistence.set_json("counter", &2_u32, TRACKER_STORE, WriteMode::Debounced, 500));

        assert_eq!(persistence.get_json("counter", TRACKER_STORE, 0_u32), 2);
        assert_eq!(backend.raw(TRACKER_STORE, "counter"), None);

        assert_eq!(persistence.flush_due(1_200), 0, "Quiet interval restarts on each write");
        assert_eq!(persistence.flush_due(1_500), 1);
        assert_eq!(backend.raw(TRACKER_STORE, "counter").as_deref(), Some("2"));
        assert_eq!(persistence.flush_all(), 0);
    }

    #[test]
    fn immediate_write_supersedes_pending_value() {
        let (mut persistence, backend) = persistence_with_memory(1_000);

        persistence.set_json("key", &"debounced", TRACKER_STORE, WriteMode::Debounced, 0);
        persistence.set_json("key", &"immediate", TRACKER_STORE, WriteMode::Immediate, 10);

        assert_eq!(
            backend.raw(TRACKER_STORE, "key").as_deref(),
            Some("\"immediate\"")
        );
        assert_eq!(persistence.flush_all(), 0);
    }

    #[test]
    fn delete_cancels_pending_write() {
        let (mut persistence, backend) = persistence_with_memory(1_000);

        persistence.set_json("key", &7_u32, TRACKER_STORE, WriteMode::Immediate, 0);
        persistence.set_json("key", &8_u32, TRACKER_STORE, WriteMode::Debounced, 0);
        assert!(persistence.delete("key", TRACKER_STORE));

        assert_eq!(persistence.flush_all(), 0);
        assert_eq!(backend.raw(TRACKER_STORE, "key"), None);
        assert_eq!(persistence.get_json("key", TRACKER_STORE, 99_u32), 99);
    }

    #[test]
    fn unavailable_backend_degrades_to_defaults() {
        let (mut persistence, backend) = persistence_with_memory(0);
        backend.set_unavailable(true);

        assert!(!persistence.set_json("key", &1_u32, TRACKER_STORE, WriteMode::Immediate, 0));
        assert!(!persistence.delete("key", TRACKER_STORE));
        assert_eq!(persistence.get_json("key", TRACKER_STORE, 5_u32), 5);
    }

    #[test]
    fn unparsable_value_falls_back_to_default() {
        let (persistence, backend) = persistence_with_memory(0);
        backend.insert_raw(TRACKER_STORE, "key", "{ broken");

        let value: Vec<u32> = persistence.get_json("key", TRACKER_STORE, vec![1]);
        assert_eq!(value, vec![1]);
    }
}

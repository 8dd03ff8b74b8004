use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::KeyValueStore;

/// In-process store. Clones share the same documents, so a test can keep a handle
/// to inspect what the tracker persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    documents: Arc<Mutex<BTreeMap<(String, String), String>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn raw(&self, store: &str, key: &str) -> Option<String> {
        self.documents
            .lock()
            .ok()?
            .get(&(store.to_string(), key.to_string()))
            .cloned()
    }

    pub fn insert_raw(&self, store: &str, key: &str, value: &str) {
        if let Ok(mut documents) = self.documents.lock() {
            documents.insert((store.to_string(), key.to_string()), value.to_string());
        }
    }

    fn ensure_available(&self) -> Result<(), String> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err("Memory store is unavailable".to_string());
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, store: &str, key: &str) -> Result<Option<String>, String> {
        self.ensure_available()?;
        let documents = self.documents.lock().map_err(|error| error.to_string())?;
        Ok(documents
            .get(&(store.to_string(), key.to_string()))
            .cloned())
    }

    fn write(&self, store: &str, key: &str, value: &str) -> Result<(), String> {
        self.ensure_available()?;
        let mut documents = self.documents.lock().map_err(|error| error.to_string())?;
        documents.insert((store.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn remove(&self, store: &str, key: &str) -> Result<(), String> {
        self.ensure_available()?;
        let mut documents = self.documents.lock().map_err(|error| error.to_string())?;
        documents.remove(&(store.to_string(), key.to_string()));
        Ok(())
    }
}

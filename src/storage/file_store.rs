use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::KeyValueStore;

/// One JSON document per key, laid out as `<root>/<store>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document_path(&self, store: &str, key: &str) -> Result<PathBuf, String> {
        if !is_safe_segment(store) {
            return Err(format!("Invalid store name '{store}'"));
        }
        if !is_safe_segment(key) {
            return Err(format!("Invalid store key '{key}'"));
        }

        Ok(self.root.join(store).join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, store: &str, key: &str) -> Result<Option<String>, String> {
        let document_path = self.document_path(store, key)?;
        match std::fs::read_to_string(&document_path) {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(format!(
                "Failed to read stored document '{}': {error}",
                document_path.display()
            )),
        }
    }

    fn write(&self, store: &str, key: &str, value: &str) -> Result<(), String> {
        let document_path = self.document_path(store, key)?;
        if let Some(parent_directory) = document_path.parent() {
            std::fs::create_dir_all(parent_directory).map_err(|error| {
                format!(
                    "Failed to create store directory '{}': {error}",
                    parent_directory.display()
                )
            })?;
        }

        let temp_path = temporary_document_path(&document_path);
        std::fs::write(&temp_path, value).map_err(|error| {
            format!(
                "Failed to write temporary document '{}': {error}",
                temp_path.display()
            )
        })?;

        if let Err(error) = std::fs::rename(&temp_path, &document_path) {
            let cleanup_error = std::fs::remove_file(&temp_path).err();
            if let Some(cleanup_error) = cleanup_error {
                return Err(format!(
                    "Failed to finalize stored document '{}': {error}; temporary cleanup failed '{}': {cleanup_error}",
                    document_path.display(),
                    temp_path.display()
                ));
            }

            return Err(format!(
                "Failed to finalize stored document '{}': {error}",
                document_path.display()
            ));
        }

        Ok(())
    }

    fn remove(&self, store: &str, key: &str) -> Result<(), String> {
        let document_path = self.document_path(store, key)?;
        match std::fs::remove_file(&document_path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(format!(
                "Failed to delete stored document '{}': {error}",
                document_path.display()
            )),
        }
    }
}

fn is_safe_segment(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '_' | '-'))
}

fn temporary_document_path(document_path: &Path) -> PathBuf {
    let Some(file_name) = document_path.file_name().and_then(|value| value.to_str()) else {
        return document_path.with_extension("json.tmp");
    };

    document_path.with_file_name(format!("{file_name}.tmp"))
}

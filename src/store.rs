use crate::{Result, log_debug};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

/// Atomic JSON document store backing one coordinator's state.
///
/// Writes go to a sibling temp file first and are moved into place with a
/// rename, so a crash mid-write never leaves a truncated document behind.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, or the type's default when the file does not exist.
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if !self.path.exists() {
            log_debug!("No state file at {}, starting empty", self.path.display());
            return Ok(T::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persist the document atomically (temp file + rename).
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        let raw = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "state.json".to_string());
        self.path.with_file_name(format!(".{}.tmp", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path().join("hosts.json"));
        let loaded: HashMap<String, u32> = store.load().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path().join("nested/volumes.json"));

        let mut state = HashMap::new();
        state.insert("vol-1".to_string(), 42u32);
        store.save(&state).unwrap();

        let loaded: HashMap<String, u32> = store.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn save_replaces_existing_document() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path().join("state.json"));

        store.save(&vec![1u32, 2, 3]).unwrap();
        store.save(&vec![9u32]).unwrap();

        let loaded: Vec<u32> = store.load().unwrap();
        assert_eq!(loaded, vec![9]);
        assert!(!store.tmp_path().exists());
    }
}

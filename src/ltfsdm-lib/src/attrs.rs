use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{unix_timestamp, DmError, DmResult, FileState};

/// Per-file HSM attributes. The real deployment keeps these in extended
/// attributes of the managed file system; this store keeps the same data
/// in one JSON file so the core and the client see identical state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttrs {
    pub state: FileState,
    /// Tapes holding a copy of this file, one entry per replica.
    pub tape_ids: Vec<String>,
    pub file_size: u64,
    pub updated_at: u64,
}

impl FileAttrs {
    fn resident(file_size: u64) -> FileAttrs {
        FileAttrs {
            state: FileState::Resident,
            tape_ids: Vec::new(),
            file_size,
            updated_at: unix_timestamp(),
        }
    }
}

pub struct AttrStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, FileAttrs>>,
}

impl AttrStore {
    pub fn open(path: PathBuf) -> DmResult<AttrStore> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| DmError::AttrFormat(format!("{}: {}", path.display(), e)))?
        } else {
            BTreeMap::new()
        };
        Ok(AttrStore {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Current state of a file; files without attributes are resident.
    pub fn state_of(&self, file_name: &str) -> FileState {
        let entries = self.entries.lock().unwrap();
        entries
            .get(file_name)
            .map(|a| a.state)
            .unwrap_or(FileState::Resident)
    }

    pub fn get(&self, file_name: &str) -> Option<FileAttrs> {
        let entries = self.entries.lock().unwrap();
        entries.get(file_name).cloned()
    }

    pub fn set_state(&self, file_name: &str, file_size: u64, state: FileState) -> DmResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let attrs = entries
            .entry(file_name.to_string())
            .or_insert_with(|| FileAttrs::resident(file_size));
        attrs.state = state;
        attrs.file_size = file_size;
        attrs.updated_at = unix_timestamp();
        self.save(&entries)
    }

    /// Record a finished tape copy for one replica.
    pub fn add_copy(&self, file_name: &str, file_size: u64, tape_id: &str) -> DmResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let attrs = entries
            .entry(file_name.to_string())
            .or_insert_with(|| FileAttrs::resident(file_size));
        if !attrs.tape_ids.iter().any(|t| t == tape_id) {
            attrs.tape_ids.push(tape_id.to_string());
        }
        attrs.updated_at = unix_timestamp();
        self.save(&entries)
    }

    /// Drop the tape copies after a recall back to resident.
    pub fn clear_copies(&self, file_name: &str) -> DmResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(attrs) = entries.get_mut(file_name) {
            attrs.tape_ids.clear();
            attrs.updated_at = unix_timestamp();
            self.save(&entries)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> Vec<(String, FileAttrs)> {
        let entries = self.entries.lock().unwrap();
        entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn save(&self, entries: &BTreeMap<String, FileAttrs>) -> DmResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| DmError::AttrFormat(e.to_string()))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

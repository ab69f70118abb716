//! File-backed key-value tables.
//!
//! Each table is one JSON file shaped `{"version": 1, "entries": [{"key", "value"}]}`,
//! rewritten in full on every mutation through a temp file and a rename.
//! Unreadable files load as empty tables. Write failures are logged and the
//! in-memory table stays authoritative until the next successful write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod payload;
pub mod workspace;

pub use payload::{ActionPayload, InterruptPayload, PayloadStore, QuestionPayload};
pub use workspace::{ChannelStore, WorkspaceMapping, WorkspaceStore};

pub const TABLE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct TableFile<V> {
    version: u32,
    entries: Vec<TableEntry<V>>,
}

#[derive(Serialize, Deserialize)]
struct TableEntry<V> {
    key: String,
    value: V,
}

/// An ordered string-keyed table persisted to a single JSON file.
#[derive(Debug)]
pub struct JsonTable<V> {
    path: PathBuf,
    entries: BTreeMap<String, V>,
}

impl<V: Serialize + DeserializeOwned> JsonTable<V> {
    /// Load the table at `path`. Missing, corrupt, or wrong-version files yield an empty table.
    pub fn load(path: PathBuf) -> Self {
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{e:#}"), "discarding unreadable store file");
                BTreeMap::new()
            }
        };
        Self { path, entries }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.entries.iter()
    }

    /// Insert or replace `key`, then persist.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), value);
        self.persist();
    }

    /// Remove `key`, persisting only if it was present.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Keep entries matching `keep`; returns the removed keys.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &V) -> bool) -> Vec<String> {
        let removed: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        if !removed.is_empty() {
            for key in &removed {
                self.entries.remove(key);
            }
            self.persist();
        }
        removed
    }

    pub fn save(&self) -> Result<()> {
        let file = TableFile {
            version: TABLE_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(key, value)| TableEntry {
                    key: key.clone(),
                    value,
                })
                .collect(),
        };
        let mut payload = serde_json::to_string_pretty(&file).context("failed to serialize table")?;
        payload.push('\n');
        write_text_atomic(&self.path, &payload)
            .with_context(|| format!("failed to write store file {}", self.path.display()))
    }

    fn persist(&self) {
        match self.save() {
            Ok(()) => debug!(path = %self.path.display(), entries = self.entries.len(), "store saved"),
            Err(e) => warn!(error = %format!("{e:#}"), "store write failed; keeping in-memory state"),
        }
    }
}

fn read_entries<V: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, V>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read store file {}", path.display()))?;
    let file: TableFile<V> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse store file {}", path.display()))?;
    if file.version != TABLE_VERSION {
        bail!(
            "unsupported store version: expected {}, found {}",
            TABLE_VERSION,
            file.version
        );
    }
    Ok(file
        .entries
        .into_iter()
        .map(|entry| (entry.key, entry.value))
        .collect())
}

/// Write `content` to a sibling temp file, then rename it over `path`.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let temp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("store"),
        std::process::id(),
    );
    let temp_path = parent_dir.join(temp_name);
    std::fs::write(&temp_path, content)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    replace_with(&temp_path, path)
}

/// Rename `temp_path` over `path`, deleting the temp file if that fails.
fn replace_with(temp_path: &Path, path: &Path) -> Result<()> {
    if let Err(e) = std::fs::rename(temp_path, path) {
        let _ = std::fs::remove_file(temp_path);
        return Err(e).with_context(|| {
            format!(
                "failed to rename {} to {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

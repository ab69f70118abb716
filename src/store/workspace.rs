use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::JsonTable;

pub const WORKSPACES_FILE: &str = "workspaces.json";
pub const CHANNELS_FILE: &str = "channels.json";

/// Where a thread (or channel) runs claude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMapping {
    /// Absolute, already-validated working directory.
    pub directory: PathBuf,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub autopilot: bool,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl WorkspaceMapping {
    pub fn new(directory: PathBuf, project_name: impl Into<String>) -> Self {
        Self {
            directory,
            project_name: project_name.into(),
            channel_id: None,
            autopilot: false,
            created_at: None,
        }
    }

    /// Whether this mapping is older than `ttl` at `now`. Undated mappings never expire.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        self.created_at.is_some_and(|at| now - at > ttl)
    }
}

/// Thread → workspace table (`workspaces.json`).
pub struct WorkspaceStore {
    table: JsonTable<WorkspaceMapping>,
}

impl WorkspaceStore {
    pub fn open(data_dir: &Path) -> Self {
        Self {
            table: JsonTable::load(data_dir.join(WORKSPACES_FILE)),
        }
    }

    pub fn get(&self, thread_ts: &str) -> Option<&WorkspaceMapping> {
        self.table.get(thread_ts)
    }

    pub fn set(&mut self, thread_ts: &str, mapping: WorkspaceMapping) {
        self.table.set(thread_ts, mapping);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &WorkspaceMapping)> {
        self.table.iter()
    }

    /// Write the table now, reporting failure.
    pub fn save(&self) -> Result<()> {
        self.table.save()
    }

    /// Drop mappings older than `ttl`; returns the evicted thread ids.
    pub fn evict_expired(&mut self, now: DateTime<Utc>, ttl: TimeDelta) -> Vec<String> {
        let evicted = self.table.retain(|_, m| !m.is_expired(now, ttl));
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted expired thread workspace mappings");
        }
        evicted
    }
}

/// Channel → workspace table (`channels.json`). Entries never expire.
pub struct ChannelStore {
    table: JsonTable<WorkspaceMapping>,
}

impl ChannelStore {
    pub fn open(data_dir: &Path) -> Self {
        Self {
            table: JsonTable::load(data_dir.join(CHANNELS_FILE)),
        }
    }

    pub fn get(&self, channel_id: &str) -> Option<&WorkspaceMapping> {
        self.table.get(channel_id)
    }

    pub fn set(&mut self, channel_id: &str, mapping: WorkspaceMapping) {
        self.table.set(channel_id, mapping);
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &WorkspaceMapping)> {
        self.table.iter()
    }

    /// Write the table now, reporting failure.
    pub fn save(&self) -> Result<()> {
        self.table.save()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mapping(created_at: Option<DateTime<Utc>>) -> WorkspaceMapping {
        WorkspaceMapping {
            directory: PathBuf::from("/srv/app"),
            project_name: "app".into(),
            channel_id: Some("C1".into()),
            autopilot: true,
            created_at,
        }
    }

    #[test]
    fn mapping_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let mut store = WorkspaceStore::open(dir.path());
        store.set("1700000000.000100", mapping(Some(now)));

        let reloaded = WorkspaceStore::open(dir.path());
        let got = reloaded.get("1700000000.000100").unwrap();
        assert_eq!(got.directory, PathBuf::from("/srv/app"));
        assert_eq!(got.project_name, "app");
        assert_eq!(got.channel_id.as_deref(), Some("C1"));
        assert!(got.autopilot);
        assert_eq!(
            got.created_at.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[test]
    fn serialized_with_camel_case_and_epoch_millis() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let json = serde_json::to_value(mapping(Some(at))).unwrap();
        assert_eq!(json["projectName"], "app");
        assert_eq!(json["channelId"], "C1");
        assert_eq!(json["createdAt"], 1_700_000_000_123_i64);
    }

    #[test]
    fn legacy_entry_without_optional_fields() {
        let m: WorkspaceMapping =
            serde_json::from_str(r#"{"directory":"/x","projectName":"x"}"#).unwrap();
        assert!(!m.autopilot);
        assert!(m.created_at.is_none());
        assert!(m.channel_id.is_none());
    }

    #[test]
    fn eviction_by_age() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let mut store = WorkspaceStore::open(dir.path());
        store.set("old", mapping(Some(now - TimeDelta::hours(25))));
        store.set("fresh", mapping(Some(now - TimeDelta::hours(23))));
        store.set("undated", mapping(None));

        let evicted = store.evict_expired(now, TimeDelta::hours(24));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(store.get("fresh").is_some());
        assert!(store.get("undated").is_some());

        let reloaded = WorkspaceStore::open(dir.path());
        assert!(reloaded.get("old").is_none());
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn channel_store_is_separate_file() {
        let dir = TempDir::new().unwrap();
        let mut channels = ChannelStore::open(dir.path());
        channels.set("C1", mapping(None));
        assert!(dir.path().join(CHANNELS_FILE).exists());
        assert!(!dir.path().join(WORKSPACES_FILE).exists());
        assert!(WorkspaceStore::open(dir.path()).get("C1").is_none());
    }
}

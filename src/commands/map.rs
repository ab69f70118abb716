use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::marker;
use crate::store::{ChannelStore, WorkspaceMapping, WorkspaceStore};

/// What to map and where.
#[derive(Debug, Clone)]
pub struct MapRequest {
    pub key: String,
    pub directory: PathBuf,
    pub project: Option<String>,
    pub channel: Option<String>,
    pub autopilot: bool,
}

/// Resolve `dir` to a canonical, existing, absolute directory.
pub fn validate_directory(dir: &Path) -> Result<PathBuf> {
    if !dir.is_absolute() {
        bail!("{} is not an absolute path", dir.display());
    }
    let canonical = dir
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", dir.display()))?;
    if !canonical.is_dir() {
        bail!("{} is not a directory", canonical.display());
    }
    Ok(canonical)
}

fn build_mapping(request: &MapRequest, created_at: Option<DateTime<Utc>>) -> Result<WorkspaceMapping> {
    let directory = validate_directory(&request.directory)?;
    let project_name = match &request.project {
        Some(name) => name.clone(),
        None => directory
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace")
            .to_string(),
    };
    Ok(WorkspaceMapping {
        channel_id: request.channel.clone(),
        autopilot: request.autopilot,
        created_at,
        ..WorkspaceMapping::new(directory, project_name)
    })
}

/// The server keeps the tables in memory and would overwrite edits.
fn ensure_not_serving(config: &Config) -> Result<()> {
    if let Some(pid) = marker::running_pid(&config.data_dir) {
        bail!("threadpilot is serving from this data directory (pid {pid}); stop it before editing mappings");
    }
    Ok(())
}

pub fn map_thread(
    config: &Config,
    request: &MapRequest,
    now: DateTime<Utc>,
    out: &mut impl Write,
) -> Result<()> {
    ensure_not_serving(config)?;
    let mapping = build_mapping(request, Some(now))?;
    let mut store = WorkspaceStore::open(&config.data_dir);
    writeln!(
        out,
        "thread {} → {} ({})",
        request.key,
        mapping.directory.display(),
        mapping.project_name
    )?;
    store.set(&request.key, mapping);
    store.save()
}

pub fn map_channel(config: &Config, request: &MapRequest, out: &mut impl Write) -> Result<()> {
    ensure_not_serving(config)?;
    let mut request = request.clone();
    request.channel = Some(request.key.clone());
    let mapping = build_mapping(&request, None)?;
    let mut store = ChannelStore::open(&config.data_dir);
    writeln!(
        out,
        "channel {} → {} ({}){}",
        request.key,
        mapping.directory.display(),
        mapping.project_name,
        if mapping.autopilot { ", autopilot" } else { "" }
    )?;
    store.set(&request.key, mapping);
    store.save()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(data_dir: &Path) -> Config {
        Config {
            data_dir: data_dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn request(key: &str, directory: &Path) -> MapRequest {
        MapRequest {
            key: key.to_string(),
            directory: directory.to_path_buf(),
            project: None,
            channel: None,
            autopilot: false,
        }
    }

    #[test]
    fn rejects_relative_and_missing_directories() {
        assert!(validate_directory(Path::new("relative/dir")).is_err());
        assert!(validate_directory(Path::new("/definitely/not/here")).is_err());

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(validate_directory(&file).is_err());
    }

    #[test]
    fn map_channel_defaults_project_to_directory_name() {
        let data = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let project_dir = work.path().join("shop-api");
        std::fs::create_dir(&project_dir).unwrap();

        let mut out = Vec::new();
        let mut req = request("C1", &project_dir);
        req.autopilot = true;
        map_channel(&config(data.path()), &req, &mut out).unwrap();

        let stored = ChannelStore::open(data.path());
        let mapping = stored.get("C1").unwrap();
        assert_eq!(mapping.project_name, "shop-api");
        assert_eq!(mapping.channel_id.as_deref(), Some("C1"));
        assert!(mapping.autopilot);
        assert!(mapping.created_at.is_none());
        assert!(String::from_utf8(out).unwrap().contains(", autopilot"));
    }

    #[test]
    fn map_thread_records_creation_time() {
        let data = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let now = Utc::now();
        let mut req = request("1700000000.000100", work.path());
        req.project = Some("demo".into());
        map_thread(&config(data.path()), &req, now, &mut Vec::new()).unwrap();

        let stored = WorkspaceStore::open(data.path());
        let mapping = stored.get("1700000000.000100").unwrap();
        assert_eq!(mapping.project_name, "demo");
        assert_eq!(mapping.directory, work.path().canonicalize().unwrap());
        assert_eq!(
            mapping.created_at.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }
}

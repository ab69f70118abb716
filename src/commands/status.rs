use std::io::Write;

use anyhow::Result;

use crate::config::Config;
use crate::marker;
use crate::store::{ChannelStore, PayloadStore, WorkspaceStore};

/// Print whether the server is running and what the stores hold.
pub fn status(config: &Config, out: &mut impl Write) -> Result<()> {
    match marker::running_pid(&config.data_dir) {
        Some(pid) => writeln!(out, "Serving (PID {pid}).")?,
        None => writeln!(out, "Not running.")?,
    }

    let channels = ChannelStore::open(&config.data_dir);
    let threads = WorkspaceStore::open(&config.data_dir);
    let payloads = PayloadStore::open(&config.data_dir);

    if channels.is_empty() {
        writeln!(out, "No channel mappings.")?;
    } else {
        writeln!(out, "{} channel mapping(s):", channels.len())?;
        for (channel, mapping) in channels.iter() {
            let autopilot = if mapping.autopilot { " [autopilot]" } else { "" };
            writeln!(
                out,
                "  {channel}  {} ({}){autopilot}",
                mapping.directory.display(),
                mapping.project_name
            )?;
        }
    }
    writeln!(out, "{} thread mapping(s).", threads.len())?;
    writeln!(out, "{} pending action payload(s).", payloads.len())?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::store::WorkspaceMapping;
    use tempfile::TempDir;

    #[test]
    fn status_lists_channels() {
        let data = TempDir::new().unwrap();
        let config = Config {
            data_dir: data.path().to_path_buf(),
            ..Config::default()
        };
        let mut channels = ChannelStore::open(data.path());
        let mut mapping = WorkspaceMapping::new(PathBuf::from("/srv/app"), "app");
        mapping.autopilot = true;
        channels.set("C1", mapping);

        let mut out = Vec::new();
        status(&config, &mut out).unwrap();
        insta::assert_snapshot!(String::from_utf8(out).unwrap(), @r"
        Not running.
        1 channel mapping(s):
          C1  /srv/app (app) [autopilot]
        0 thread mapping(s).
        0 pending action payload(s).
        ");
    }
}

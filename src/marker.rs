//! The "this process is running" marker.
//!
//! `<data_dir>/threadpilot.pid` holds the pid of the serving process and is
//! kept under an exclusive file lock for the process lifetime, so a second
//! instance on the same data directory refuses to start.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::{info, warn};

pub const MARKER_FILE: &str = "threadpilot.pid";

/// A held marker. Dropping it releases the lock but leaves the file; call
/// [`RunningMarker::release`] after cleanup to remove it.
pub struct RunningMarker {
    path: PathBuf,
    file: File,
}

impl RunningMarker {
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let path = data_dir.join(MARKER_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let holder = read_pid(data_dir)
                    .map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {pid}"));
                bail!(
                    "another threadpilot instance ({holder}) is using {}",
                    data_dir.display()
                );
            }
            Err(e) => {
                return Err(anyhow::anyhow!(e).context(format!("failed to lock {}", path.display())));
            }
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        info!(path = %path.display(), "acquired running marker");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker file and drop the lock.
    pub fn release(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove running marker");
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// Pid recorded in the marker, if the file exists and is readable.
pub fn read_pid(data_dir: &Path) -> Option<u32> {
    fs::read_to_string(data_dir.join(MARKER_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Pid of a live process holding the marker.
pub fn running_pid(data_dir: &Path) -> Option<u32> {
    read_pid(data_dir).filter(|&pid| is_pid_alive(pid))
}

fn is_pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 performs error checking without sending a signal.
    unsafe { libc::kill(pid.cast_signed(), 0) == 0 }
}

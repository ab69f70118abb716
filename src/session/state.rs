use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::runner::Runner;

/// One conversation thread's view of its claude work.
pub struct Session {
    pub thread_ts: String,
    pub channel: String,
    pub working_dir: PathBuf,
    pub project_name: String,
    pub autopilot: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Session id claude reported most recently; later runners resume it.
    pub claude_session_id: Option<String>,
    pub(super) runner: Option<Runner>,
    pub(super) generation: u64,
    /// User turns written to the current runner that have no `result` yet.
    pub(super) open_turns: u32,
    pub(super) status: SessionStatus,
    /// Last stderr lines of the current runner.
    pub(super) stderr_tail: VecDeque<String>,
}

const STDERR_TAIL_LINES: usize = 5;

/// Where a session is in its runner lifecycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No runner has been started yet.
    #[default]
    NotStarted,
    /// A runner is live.
    Running,
    /// The last runner ended; a new one can be started.
    Stopped,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Whether the thread's runner is mid-turn and takes further input.
    ///
    /// A runner whose stdin was closed after its last `result` is winding
    /// down and does not count.
    pub fn is_busy(&self) -> bool {
        self.runner.as_ref().is_some_and(Runner::accepts_input)
    }

    /// Generation of the current runner, if one is attached.
    pub fn runner_generation(&self) -> Option<u64> {
        self.runner.as_ref().map(|_| self.generation)
    }

    pub fn runner_mut(&mut self) -> Option<&mut Runner> {
        self.runner.as_mut()
    }

    pub fn open_turns(&self) -> u32 {
        self.open_turns
    }

    /// Count a user turn written to the live runner.
    pub fn begin_turn(&mut self) {
        self.open_turns += 1;
    }

    /// Count a `result`. Returns true when no turn is left open.
    pub fn finish_turn(&mut self) -> bool {
        self.open_turns = self.open_turns.saturating_sub(1);
        self.open_turns == 0
    }

    pub fn push_stderr(&mut self, line: String) {
        if self.stderr_tail.len() == STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line);
    }

    pub fn stderr_tail(&self) -> impl Iterator<Item = &str> {
        self.stderr_tail.iter().map(String::as_str)
    }
}

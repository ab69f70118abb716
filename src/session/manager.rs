use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::Entry;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::runner::{Runner, RunnerConfig, RunnerEvent};
use super::state::{Session, SessionStatus};
use crate::config::ClaudeConfig;
use crate::error::SessionError;
use crate::store::{ChannelStore, WorkspaceMapping, WorkspaceStore};

/// Spawn attempts per start request before giving up.
const SPAWN_ATTEMPTS: u32 = 2;

/// A session removed by the inactivity sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSession {
    pub thread_ts: String,
    pub channel: String,
    /// Whether a live subprocess was stopped.
    pub had_runner: bool,
}

/// Thread → session table. At most one session, and one live runner, per thread.
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    inactivity_timeout: TimeDelta,
    next_generation: u64,
}

impl SessionManager {
    pub fn new(inactivity_timeout: TimeDelta) -> Self {
        Self {
            sessions: HashMap::new(),
            inactivity_timeout,
            next_generation: 0,
        }
    }

    pub fn get(&self, thread_ts: &str) -> Option<&Session> {
        self.sessions.get(thread_ts)
    }

    pub fn get_mut(&mut self, thread_ts: &str) -> Option<&mut Session> {
        self.sessions.get_mut(thread_ts)
    }

    /// Return the thread's session, creating it from its workspace mapping.
    ///
    /// A thread without its own mapping inherits its channel's, which is then
    /// recorded as the thread mapping.
    pub fn get_or_create(
        &mut self,
        thread_ts: &str,
        channel: &str,
        workspaces: &mut WorkspaceStore,
        channels: &ChannelStore,
        now: DateTime<Utc>,
    ) -> Result<&mut Session, SessionError> {
        match self.sessions.entry(thread_ts.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mapping = resolve_mapping(thread_ts, channel, workspaces, channels, now)?;
                info!(thread = thread_ts, project = %mapping.project_name, "created session");
                Ok(entry.insert(Session {
                    thread_ts: thread_ts.to_string(),
                    channel: mapping.channel_id.unwrap_or_else(|| channel.to_string()),
                    working_dir: mapping.directory,
                    project_name: mapping.project_name,
                    autopilot: mapping.autopilot,
                    created_at: now,
                    last_activity: now,
                    claude_session_id: None,
                    runner: None,
                    generation: 0,
                    open_turns: 0,
                    status: SessionStatus::NotStarted,
                    stderr_tail: VecDeque::new(),
                }))
            }
        }
    }

    /// Record activity on a thread. Returns false for unknown threads.
    pub fn touch(&mut self, thread_ts: &str, now: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(thread_ts) {
            Some(session) => {
                session.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Start a runner for an existing session with `prompt` as its first turn.
    ///
    /// Rejects with `Busy` while a runner takes input; nothing is spawned then.
    /// A runner that is only winding down is killed and replaced.
    /// Returns the new runner's generation.
    pub async fn start_runner(
        &mut self,
        thread_ts: &str,
        prompt: String,
        claude: &ClaudeConfig,
        events: &mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<u64, SessionError> {
        let session = self
            .sessions
            .get_mut(thread_ts)
            .ok_or_else(|| SessionError::NotFound {
                thread: thread_ts.to_string(),
            })?;
        if session.is_busy() {
            return Err(SessionError::Busy {
                thread: thread_ts.to_string(),
            });
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let config = RunnerConfig::claude(
            claude,
            session.working_dir.clone(),
            Some(prompt),
            session.claude_session_id.as_deref(),
        );

        let mut attempt = 1;
        let runner = loop {
            match Runner::spawn(config.clone(), thread_ts, generation, events.clone()).await {
                Ok(runner) => break runner,
                Err(e) if attempt < SPAWN_ATTEMPTS => {
                    warn!(thread = thread_ts, attempt, error = %format!("{e:#}"), "spawn failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    return Err(SessionError::Spawn {
                        thread: thread_ts.to_string(),
                        message: format!("{e:#}"),
                    });
                }
            }
        };

        // A predecessor that finished its last turn may still be exiting.
        if let Some(previous) = session.runner.as_mut() {
            previous.kill(true);
        }
        session.runner = Some(runner);
        session.generation = generation;
        session.open_turns = 1;
        session.status = SessionStatus::Running;
        session.stderr_tail.clear();
        Ok(generation)
    }

    /// Whether `generation` is the thread's current runner.
    pub fn is_current(&self, thread_ts: &str, generation: u64) -> bool {
        self.sessions
            .get(thread_ts)
            .is_some_and(|s| s.runner_generation() == Some(generation))
    }

    /// Detach a runner after its exit event. Stale generations are ignored.
    pub fn on_runner_exit(&mut self, thread_ts: &str, generation: u64) -> bool {
        let Some(session) = self.sessions.get_mut(thread_ts) else {
            return false;
        };
        if session.runner.is_none() || session.generation != generation {
            return false;
        }
        session.runner = None;
        session.open_turns = 0;
        session.status = SessionStatus::Stopped;
        true
    }

    /// Stop the thread's runner (if any) and forget the session.
    ///
    /// The persisted workspace mapping is kept.
    pub fn terminate(&mut self, thread_ts: &str, reason: &str) -> bool {
        let Some(mut session) = self.sessions.remove(thread_ts) else {
            return false;
        };
        if let Some(runner) = session.runner.as_mut() {
            runner.kill(true);
        }
        info!(thread = thread_ts, reason, "terminated session");
        true
    }

    /// Number of threads whose runner is mid-turn.
    pub fn list_active(&self) -> usize {
        self.sessions.values().filter(|s| s.is_busy()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Terminate every session idle for longer than the inactivity timeout.
    pub fn sweep_inactive(&mut self, now: DateTime<Utc>) -> Vec<ExpiredSession> {
        let expired: Vec<ExpiredSession> = self
            .sessions
            .values()
            .filter(|s| now - s.last_activity > self.inactivity_timeout)
            .map(|s| ExpiredSession {
                thread_ts: s.thread_ts.clone(),
                channel: s.channel.clone(),
                had_runner: s.is_busy(),
            })
            .collect();
        for session in &expired {
            self.terminate(&session.thread_ts, "inactivity timeout");
        }
        expired
    }

    /// Kill every runner and wait for them to exit, bounded by `timeout` each.
    pub async fn shutdown(&mut self, timeout: Duration) {
        let mut sessions: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        for runner in sessions.iter_mut().filter_map(|s| s.runner.as_mut()) {
            runner.kill(true);
        }
        for session in &mut sessions {
            if let Some(runner) = session.runner.as_mut()
                && tokio::time::timeout(timeout, runner.wait()).await.is_err()
            {
                warn!(thread = %session.thread_ts, "runner did not exit before shutdown timeout");
            }
        }
        info!(count = sessions.len(), "all sessions shut down");
    }
}

fn resolve_mapping(
    thread_ts: &str,
    channel: &str,
    workspaces: &mut WorkspaceStore,
    channels: &ChannelStore,
    now: DateTime<Utc>,
) -> Result<WorkspaceMapping, SessionError> {
    if let Some(mapping) = workspaces.get(thread_ts) {
        return Ok(mapping.clone());
    }
    let Some(channel_mapping) = channels.get(channel) else {
        return Err(SessionError::NotFound {
            thread: thread_ts.to_string(),
        });
    };
    let mapping = WorkspaceMapping {
        channel_id: Some(channel.to_string()),
        created_at: Some(now),
        ..channel_mapping.clone()
    };
    workspaces.set(thread_ts, mapping.clone());
    Ok(mapping)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        workspaces: WorkspaceStore,
        channels: ChannelStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let workspaces = WorkspaceStore::open(dir.path());
        let mut channels = ChannelStore::open(dir.path());
        channels.set(
            "C1",
            WorkspaceMapping::new(std::env::temp_dir(), "scratch"),
        );
        Fixture {
            _dir: dir,
            workspaces,
            channels,
        }
    }

    fn sleeper() -> ClaudeConfig {
        ClaudeConfig {
            program: "sh".into(),
            base_args: vec!["-c".into(), "sleep 5".into()],
            extra_args: Vec::new(),
            kill_grace_secs: 1,
        }
    }

    #[test]
    fn unmapped_thread_is_not_found() {
        let mut f = fixture();
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        let err = manager
            .get_or_create("1.1", "C-unknown", &mut f.workspaces, &f.channels, Utc::now())
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::NotFound { .. }));
        assert!(manager.is_empty());
    }

    #[test]
    fn thread_inherits_channel_mapping() {
        let mut f = fixture();
        let now = Utc::now();
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        let session = manager
            .get_or_create("1.1", "C1", &mut f.workspaces, &f.channels, now)
            .unwrap();
        assert_eq!(session.project_name, "scratch");
        assert_eq!(session.status(), SessionStatus::NotStarted);

        let stored = f.workspaces.get("1.1").unwrap();
        assert_eq!(stored.channel_id.as_deref(), Some("C1"));
        assert_eq!(stored.created_at, Some(now));
    }

    #[test]
    fn thread_mapping_wins_over_channel() {
        let mut f = fixture();
        f.workspaces
            .set("1.1", WorkspaceMapping::new(PathBuf::from("/srv/other"), "other"));
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        let session = manager
            .get_or_create("1.1", "C1", &mut f.workspaces, &f.channels, Utc::now())
            .unwrap();
        assert_eq!(session.project_name, "other");
        assert_eq!(session.working_dir, PathBuf::from("/srv/other"));
    }

    #[tokio::test]
    async fn second_start_while_live_is_busy() {
        let mut f = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        manager
            .get_or_create("1.1", "C1", &mut f.workspaces, &f.channels, Utc::now())
            .unwrap();

        let generation = manager
            .start_runner("1.1", "hi".into(), &sleeper(), &tx)
            .await
            .unwrap();
        let err = manager
            .start_runner("1.1", "again".into(), &sleeper(), &tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Busy { .. }));
        assert_eq!(manager.list_active(), 1);
        assert!(manager.is_current("1.1", generation));

        manager.shutdown(Duration::from_secs(5)).await;
        assert_eq!(manager.list_active(), 0);
    }

    #[tokio::test]
    async fn runner_with_closed_input_is_replaced() {
        let mut f = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        manager
            .get_or_create("1.1", "C1", &mut f.workspaces, &f.channels, Utc::now())
            .unwrap();
        let first = manager
            .start_runner("1.1", "hi".into(), &sleeper(), &tx)
            .await
            .unwrap();

        let session = manager.get_mut("1.1").unwrap();
        assert!(session.finish_turn());
        session.runner_mut().unwrap().close_input();
        assert!(!session.is_busy());
        assert_eq!(manager.list_active(), 0);

        let second = manager
            .start_runner("1.1", "follow-up".into(), &sleeper(), &tx)
            .await
            .unwrap();
        assert!(second > first);
        assert!(manager.is_current("1.1", second));
        assert!(!manager.is_current("1.1", first));
        assert_eq!(manager.list_active(), 1);

        manager.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn spawn_failure_reports_spawn_error() {
        let mut f = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        manager
            .get_or_create("1.1", "C1", &mut f.workspaces, &f.channels, Utc::now())
            .unwrap();
        let claude = ClaudeConfig {
            program: "/nonexistent/claude".into(),
            ..ClaudeConfig::default()
        };
        let err = manager
            .start_runner("1.1", "hi".into(), &claude, &tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Spawn { .. }));
        assert_eq!(manager.get("1.1").unwrap().status(), SessionStatus::NotStarted);
    }

    #[tokio::test]
    async fn stale_exit_is_ignored() {
        let mut f = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        manager
            .get_or_create("1.1", "C1", &mut f.workspaces, &f.channels, Utc::now())
            .unwrap();
        let generation = manager
            .start_runner("1.1", "hi".into(), &sleeper(), &tx)
            .await
            .unwrap();

        assert!(!manager.on_runner_exit("1.1", generation + 10));
        assert!(manager.is_current("1.1", generation));
        assert!(manager.on_runner_exit("1.1", generation));
        assert_eq!(manager.get("1.1").unwrap().status(), SessionStatus::Stopped);
        assert!(!manager.on_runner_exit("1.1", generation));
    }

    #[tokio::test]
    async fn sweep_terminates_only_idle_sessions() {
        let mut f = fixture();
        f.channels
            .set("C2", WorkspaceMapping::new(std::env::temp_dir(), "other"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let now = Utc::now();
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        manager
            .get_or_create("old", "C1", &mut f.workspaces, &f.channels, now - TimeDelta::minutes(45))
            .unwrap();
        manager
            .get_or_create("new", "C2", &mut f.workspaces, &f.channels, now - TimeDelta::minutes(5))
            .unwrap();
        manager
            .start_runner("old", "hi".into(), &sleeper(), &tx)
            .await
            .unwrap();

        let expired = manager.sweep_inactive(now);
        assert_eq!(
            expired,
            vec![ExpiredSession {
                thread_ts: "old".into(),
                channel: "C1".into(),
                had_runner: true,
            }]
        );
        assert!(manager.get("old").is_none());
        assert!(manager.get("new").is_some());
        // The mapping outlives the session.
        assert!(f.workspaces.get("old").is_some());
    }

    #[test]
    fn touch_updates_last_activity() {
        let mut f = fixture();
        let start = Utc::now();
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        manager
            .get_or_create("1.1", "C1", &mut f.workspaces, &f.channels, start)
            .unwrap();
        let later = start + TimeDelta::minutes(40);
        assert!(manager.touch("1.1", later));
        assert!(!manager.touch("nope", later));
        assert!(manager.sweep_inactive(later + TimeDelta::minutes(1)).is_empty());
    }

    #[test]
    fn terminate_unknown_thread_is_false() {
        let mut manager = SessionManager::new(TimeDelta::minutes(30));
        assert!(!manager.terminate("nope", "test"));
    }
}

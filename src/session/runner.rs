use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClaudeConfig;
use crate::protocol::emit::{format_interrupt, format_tool_result, format_user_message};
use crate::protocol::parse::{LineFramer, parse_line};
use crate::protocol::types::{SessionResult, StreamEvent, SystemEvent};

/// Everything needed to launch one assistant subprocess.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Initial prompt, written as the first stdin line.
    pub prompt: Option<String>,
    pub kill_grace: Duration,
}

impl RunnerConfig {
    /// Launch settings for `claude`, resuming `resume` when continuing a thread.
    pub fn claude(
        claude: &ClaudeConfig,
        working_dir: PathBuf,
        prompt: Option<String>,
        resume: Option<&str>,
    ) -> Self {
        Self {
            program: claude.program.clone(),
            args: build_args(claude, resume),
            working_dir,
            prompt,
            kill_grace: claude.kill_grace(),
        }
    }
}

/// Build the CLI arguments: base streaming flags, optional `--resume`, extra args.
pub fn build_args(claude: &ClaudeConfig, resume: Option<&str>) -> Vec<String> {
    let mut args = claude.base_args.clone();
    if let Some(session_id) = resume {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }
    args.extend(claude.extra_args.iter().cloned());
    args
}

/// One item on a runner's event feed, tagged with its owner.
#[derive(Debug, Clone)]
pub struct RunnerEvent {
    pub thread: String,
    /// Distinguishes successive runners of the same thread.
    pub generation: u64,
    pub kind: RunnerEventKind,
}

#[derive(Debug, Clone)]
pub enum RunnerEventKind {
    Stream(Box<StreamEvent>),
    /// A stdout line that is not valid JSON.
    ParseWarning(String),
    Stderr(String),
    /// The process has exited. Always the last event of a runner, sent exactly once.
    Exit(ExitInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Whether the exit followed a `kill` call.
    pub requested: bool,
}

/// Sends events for one runner.
#[derive(Clone)]
struct EventSink {
    thread: String,
    generation: u64,
    tx: mpsc::UnboundedSender<RunnerEvent>,
}

impl EventSink {
    fn send(&self, kind: RunnerEventKind) {
        // Receiver gone means the bot is shutting down.
        let _ = self.tx.send(RunnerEvent {
            thread: self.thread.clone(),
            generation: self.generation,
            kind,
        });
    }

    /// Parse and forward one stdout line. Returns true for a `result` event.
    fn dispatch_line(&self, line: &str) -> bool {
        match parse_line(line) {
            Ok(Some(event)) => {
                let is_result = matches!(event, StreamEvent::Result(_));
                if matches!(event, StreamEvent::Unrecognized) {
                    debug!(thread = %self.thread, "skipping unrecognized stream event");
                }
                self.send(RunnerEventKind::Stream(Box::new(event)));
                is_result
            }
            Ok(None) => false,
            Err(e) => {
                warn!(thread = %self.thread, error = %e, "failed to parse claude output");
                self.send(RunnerEventKind::ParseWarning(format!(
                    "Failed to parse claude output: {e}\n  Line: {line}"
                )));
                false
            }
        }
    }
}

/// Manages a claude -p subprocess with bidirectional stream-json.
pub struct Runner {
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<bool>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    session_id: Option<String>,
    next_request_id: u64,
}

impl Runner {
    /// Spawn the subprocess and start reading its output.
    ///
    /// Parsed events are sent to `event_tx` in line order. The initial prompt
    /// (if any) is sent as the first stdin message; stdin then stays open.
    pub async fn spawn(
        config: RunnerConfig,
        thread: &str,
        generation: u64,
        event_tx: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(&config.program);
        cmd.args(&config.args)
            .current_dir(&config.working_dir)
            .env_remove("CLAUDECODE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", config.program))?;

        let stdout = child.stdout.take().context("stdout should be piped")?;
        let stderr = child.stderr.take().context("stderr should be piped")?;
        let stdin = child.stdin.take().context("stdin should be piped")?;
        let pid = child.id();

        let sink = EventSink {
            thread: thread.to_string(),
            generation,
            tx: event_tx,
        };
        let stdout_task = spawn_stdout_reader(stdout, sink.clone());
        spawn_stderr_reader(stderr, sink.clone());

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(
            child,
            stdout_task,
            kill_rx,
            config.kill_grace,
            exit_tx,
            sink,
        ));

        info!(thread, generation, pid, dir = %config.working_dir.display(), "spawned claude");

        let mut runner = Self {
            stdin: Some(stdin),
            kill_tx: Some(kill_tx),
            exit_rx,
            session_id: None,
            next_request_id: 0,
        };

        if let Some(prompt) = config.prompt {
            if let Err(e) = runner.send_message(&prompt).await {
                runner.kill(false);
                return Err(e.context("failed to write initial prompt to claude stdin"));
            }
        }

        Ok(runner)
    }

    /// Send a user message to claude's stdin.
    pub async fn send_message(&mut self, text: &str) -> Result<()> {
        let msg = format_user_message(text)?;
        self.write_line(&msg).await
    }

    /// Reply to a pending tool invocation. Does not wait for claude's response.
    pub async fn send_answer(&mut self, tool_use_id: &str, content: &str) -> Result<()> {
        let msg = format_tool_result(tool_use_id, content, false)?;
        self.write_line(&msg).await
    }

    /// Ask claude to abandon the turn in progress.
    pub async fn interrupt(&mut self) -> Result<()> {
        self.next_request_id += 1;
        let msg = format_interrupt(&format!("interrupt-{}", self.next_request_id))?;
        self.write_line(&msg).await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().context("stdin already closed")?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin, signaling claude to finish.
    pub fn close_input(&mut self) {
        self.stdin.take();
    }

    /// Stop the process: SIGTERM and a grace period when `graceful`, then SIGKILL.
    ///
    /// Returns immediately; the wait happens in the background. Calling this
    /// again, or after the process exited, does nothing.
    pub fn kill(&mut self, graceful: bool) {
        self.stdin.take();
        if let Some(tx) = self.kill_tx.take() {
            // Supervisor already gone means the process already exited.
            let _ = tx.send(graceful);
        }
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Whether more turns can be written: the process is live and stdin is open.
    ///
    /// False once input was closed after the last `result`, even while the
    /// process is still winding down.
    pub fn accepts_input(&self) -> bool {
        self.stdin.is_some() && self.is_running()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Wait until the process has exited.
    pub async fn wait(&mut self) -> Option<ExitInfo> {
        let status = self.exit_rx.wait_for(Option::is_some).await.ok()?;
        *status
    }

    /// Session id claude reported in its `init` event.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Record bookkeeping from an event that came off this runner's feed.
    pub fn observe(&mut self, event: &StreamEvent) {
        if let StreamEvent::System(SystemEvent::Init(init)) = event
            && !init.session_id.is_empty()
        {
            self.session_id = Some(init.session_id.clone());
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.kill(false);
    }
}

fn spawn_stdout_reader<R>(mut stdout: R, sink: EventSink) -> JoinHandle<bool>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framer = LineFramer::default();
        let mut buf = vec![0u8; 8192];
        let mut saw_result = false;
        loop {
            let n = match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(thread = %sink.thread, error = %e, "claude stdout read failed");
                    break;
                }
            };
            for line in framer.push(&buf[..n]) {
                saw_result |= sink.dispatch_line(&line);
            }
        }
        if let Some(line) = framer.finish() {
            saw_result |= sink.dispatch_line(&line);
        }
        saw_result
    })
}

fn spawn_stderr_reader<R>(stderr: R, sink: EventSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                debug!(thread = %sink.thread, "claude stderr: {line}");
                sink.send(RunnerEventKind::Stderr(line));
            }
        }
    });
}

/// Own the child until it exits, then emit the terminal events.
async fn supervise(
    mut child: Child,
    stdout_task: JoinHandle<bool>,
    mut kill_rx: oneshot::Receiver<bool>,
    grace: Duration,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    sink: EventSink,
) {
    let mut requested = false;
    let status = tokio::select! {
        status = child.wait() => status,
        request = &mut kill_rx => {
            requested = true;
            // A dropped sender means the runner was dropped without kill: force it.
            terminate(&mut child, request.unwrap_or(false), grace).await
        }
    };

    let info = match status {
        Ok(status) => exit_info(status, requested),
        Err(e) => {
            warn!(thread = %sink.thread, error = %e, "failed to wait for claude");
            ExitInfo {
                code: None,
                signal: None,
                requested,
            }
        }
    };

    // Drain stdout so every line is delivered before the terminal events.
    let saw_result = match tokio::time::timeout(grace.max(Duration::from_secs(1)), stdout_task).await
    {
        Ok(Ok(saw_result)) => saw_result,
        _ => false,
    };

    if !saw_result && !requested {
        warn!(thread = %sink.thread, code = ?info.code, signal = ?info.signal, "claude exited without a result");
        sink.send(RunnerEventKind::Stream(Box::new(StreamEvent::Result(
            SessionResult::abnormal_termination(info.code, info.signal),
        ))));
    }
    info!(thread = %sink.thread, generation = sink.generation, code = ?info.code, signal = ?info.signal, "claude exited");
    sink.send(RunnerEventKind::Exit(info));
    let _ = exit_tx.send(Some(info));
}

async fn terminate(
    child: &mut Child,
    graceful: bool,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        let pgid = -pid.cast_signed();
        if graceful {
            // SAFETY: kill(2) on our own process group; no memory is touched.
            unsafe { libc::kill(pgid, libc::SIGTERM) };
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                return status;
            }
            debug!(pid, "grace period elapsed, sending SIGKILL");
        }
        // SAFETY: as above.
        unsafe { libc::kill(pgid, libc::SIGKILL) };
    }
    child.kill().await.ok();
    child.wait().await
}

fn exit_info(status: ExitStatus, requested: bool) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
        requested,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn script(body: &str) -> RunnerConfig {
        RunnerConfig {
            program: "sh".into(),
            args: vec!["-c".into(), body.into()],
            working_dir: std::env::temp_dir(),
            prompt: None,
            kill_grace: Duration::from_secs(2),
        }
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<RunnerEvent>) -> Vec<RunnerEventKind> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("runner events timed out")
                .expect("channel closed before exit");
            let done = matches!(event.kind, RunnerEventKind::Exit(_));
            events.push(event.kind);
            if done {
                return events;
            }
        }
    }

    #[test]
    fn build_args_with_resume_and_extras() {
        let claude = ClaudeConfig {
            extra_args: vec!["--model".into(), "opus".into()],
            ..ClaudeConfig::default()
        };
        let args = build_args(&claude, Some("sess-1"));
        assert_eq!(&args[..2], &["-p".to_string(), "--output-format".to_string()]);
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "sess-1");
        assert_eq!(&args[args.len() - 2..], &["--model".to_string(), "opus".to_string()]);
    }

    #[tokio::test]
    async fn spawn_failure_is_synchronous_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = script("true");
        config.program = "/nonexistent/claude-binary".into();
        assert!(Runner::spawn(config, "t", 1, tx).await.is_err());
    }

    #[tokio::test]
    async fn events_arrive_in_line_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = r#"printf '%s\n' '{"type":"system","subtype":"init","session_id":"s1","model":"m"}'
printf '%s' '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
sleep 0.1
printf '\n%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"done"}'"#;
        let mut runner = Runner::spawn(script(body), "t", 7, tx).await.unwrap();
        let events = collect(&mut rx).await;

        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            RunnerEventKind::Stream(e) if matches!(**e, StreamEvent::System(SystemEvent::Init(_)))
        ));
        assert!(matches!(
            &events[1],
            RunnerEventKind::Stream(e) if matches!(**e, StreamEvent::Assistant(_))
        ));
        assert!(matches!(
            &events[2],
            RunnerEventKind::Stream(e) if matches!(**e, StreamEvent::Result(ref r) if !r.is_error)
        ));
        assert!(matches!(
            events[3],
            RunnerEventKind::Exit(ExitInfo { code: Some(0), requested: false, .. })
        ));
        assert!(runner.wait().await.is_some());
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn unexpected_exit_synthesizes_result() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _runner = Runner::spawn(script("echo not-json; exit 3"), "t", 1, tx)
            .await
            .unwrap();
        let events = collect(&mut rx).await;

        assert!(matches!(events[0], RunnerEventKind::ParseWarning(_)));
        let RunnerEventKind::Stream(event) = &events[1] else {
            panic!("expected synthetic result, got {:?}", events[1]);
        };
        let StreamEvent::Result(result) = event.as_ref() else {
            panic!("expected result event");
        };
        assert!(result.is_error);
        assert!(result.is_abnormal_termination());
        assert!(matches!(
            events[2],
            RunnerEventKind::Exit(ExitInfo { code: Some(3), .. })
        ));
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = Runner::spawn(script("sleep 30"), "t", 1, tx).await.unwrap();
        assert!(runner.is_running());

        runner.kill(true);
        runner.kill(true);
        let info = runner.wait().await.unwrap();
        assert!(info.requested);
        runner.kill(false);

        let events = collect(&mut rx).await;
        let exits = events
            .iter()
            .filter(|e| matches!(e, RunnerEventKind::Exit(_)))
            .count();
        assert_eq!(exits, 1);
        // Requested kills don't produce a synthetic result.
        assert!(!events.iter().any(|e| matches!(e, RunnerEventKind::Stream(_))));

        drop(runner);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_input_stops_accepting_turns_before_exit() {
        let (tx, _rx) = mpsc::unbounded_channel();
        // Ignores EOF on stdin, so the process outlives close_input.
        let mut runner = Runner::spawn(script("sleep 30"), "t", 1, tx).await.unwrap();
        assert!(runner.accepts_input());

        runner.close_input();
        assert!(runner.is_running());
        assert!(!runner.accepts_input());
        assert!(runner.send_message("late").await.is_err());
        runner.kill(false);
    }

    #[tokio::test]
    async fn kill_after_natural_exit_is_noop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut runner = Runner::spawn(script("exit 0"), "t", 1, tx).await.unwrap();
        runner.wait().await.unwrap();
        runner.kill(true);
        let events = collect(&mut rx).await;
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, RunnerEventKind::Exit(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn prompt_and_answer_are_written_as_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Echo each stdin line back as the result text.
        let body = r#"read -r prompt
read -r answer
case "$prompt" in *'"content":"go"'*) p=ok;; *) p=bad;; esac
case "$answer" in *'"tool_use_id":"toolu_1"'*) a=ok;; *) a=bad;; esac
printf '{"type":"result","subtype":"success","is_error":false,"result":"%s-%s"}\n' "$p" "$a""#;
        let mut config = script(body);
        config.prompt = Some("go".into());
        let mut runner = Runner::spawn(config, "t", 1, tx).await.unwrap();
        runner.send_answer("toolu_1", "B").await.unwrap();

        let events = collect(&mut rx).await;
        let RunnerEventKind::Stream(event) = &events[0] else {
            panic!("expected stream event, got {:?}", events[0]);
        };
        let StreamEvent::Result(result) = event.as_ref() else {
            panic!("expected result event");
        };
        assert_eq!(result.result, "ok-ok");
    }

    #[tokio::test]
    async fn observe_records_session_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut runner = Runner::spawn(script("sleep 5"), "t", 1, tx).await.unwrap();
        let init = parse_line(r#"{"type":"system","subtype":"init","session_id":"abc"}"#)
            .unwrap()
            .unwrap();
        runner.observe(&init);
        assert_eq!(runner.session_id(), Some("abc"));
        runner.kill(false);
    }
}

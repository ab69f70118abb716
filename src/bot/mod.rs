//! The orchestrator: one owned object holding every table, driven by a single
//! dispatch loop.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{SessionError, user_message};
use crate::platform::{Block, ChatPlatform, Message, PlatformEvent};
use crate::protocol::types::{AssistantContentBlock, StreamEvent, SystemEvent};
use crate::question::interrupt::render_interrupt_prompt;
use crate::question::value::ModalMetadata;
use crate::question::{QuestionBoard, is_ask_user_tool};
use crate::session::manager::SessionManager;
use crate::session::runner::{RunnerEvent, RunnerEventKind};
use crate::store::{ChannelStore, InterruptPayload, PayloadStore, WorkspaceStore};

pub mod progress;
mod questions;

use progress::{MAX_MESSAGE_CHARS, chunk_text, result_line, tool_line};

/// What one sweep removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub mappings: usize,
    pub payloads: usize,
    pub question_sets: usize,
}

pub struct Bot {
    config: Config,
    platform: Arc<dyn ChatPlatform>,
    sessions: SessionManager,
    workspaces: WorkspaceStore,
    channels: ChannelStore,
    payloads: PayloadStore,
    questions: QuestionBoard,
    runner_tx: mpsc::UnboundedSender<RunnerEvent>,
}

impl Bot {
    /// Load the stores under `config.data_dir`. The returned receiver carries
    /// every runner's events and feeds [`Bot::run`].
    pub fn new(
        config: Config,
        platform: Arc<dyn ChatPlatform>,
    ) -> (Self, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let data_dir = config.data_dir.clone();
        let bot = Self {
            sessions: SessionManager::new(config.sessions.inactivity_timeout()),
            workspaces: WorkspaceStore::open(&data_dir),
            channels: ChannelStore::open(&data_dir),
            payloads: PayloadStore::open(&data_dir),
            questions: QuestionBoard::default(),
            config,
            platform,
            runner_tx,
        };
        info!(
            data_dir = %data_dir.display(),
            threads = bot.workspaces.len(),
            channels = bot.channels.len(),
            payloads = bot.payloads.len(),
            "loaded stores"
        );
        (bot, runner_rx)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn payloads(&self) -> &PayloadStore {
        &self.payloads
    }

    pub fn questions(&self) -> &QuestionBoard {
        &self.questions
    }

    /// Process events until `shutdown` resolves or the platform closes, then stop every runner.
    pub async fn run<S>(
        &mut self,
        mut platform_rx: mpsc::UnboundedReceiver<PlatformEvent>,
        mut runner_rx: mpsc::UnboundedReceiver<RunnerEvent>,
        shutdown: S,
    ) where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sweep = tokio::time::interval(self.config.sessions.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                event = platform_rx.recv() => match event {
                    Some(event) => self.dispatch_platform_event(event).await,
                    None => {
                        info!("platform input closed");
                        break;
                    }
                },
                Some(event) = runner_rx.recv() => self.dispatch_runner_event(event).await,
                _ = sweep.tick() => {
                    self.run_sweep(Utc::now()).await;
                }
            }
        }

        self.shutdown().await;
    }

    /// Handle a platform event inside the error boundary.
    pub async fn dispatch_platform_event(&mut self, event: PlatformEvent) {
        let context = event_context(&event);
        let target = reply_target(&event);
        if let Err(e) = guarded(self.handle_platform_event(event)).await {
            self.report(&context, target, &e).await;
        }
    }

    /// Handle a runner event inside the error boundary.
    pub async fn dispatch_runner_event(&mut self, event: RunnerEvent) {
        let target = self
            .sessions
            .get(&event.thread)
            .map(|s| (s.channel.clone(), s.thread_ts.clone()));
        let context = format!("runner event for thread {}", event.thread);
        if let Err(e) = guarded(self.handle_runner_event(event)).await {
            self.report(&context, target, &e).await;
        }
    }

    async fn report(&self, context: &str, target: Option<(String, String)>, err: &anyhow::Error) {
        let Some(text) = user_message(err) else {
            error!(context, error = %format!("{err:#}"), "handler failed");
            return;
        };
        info!(context, "rejected: {text}");
        if let Some((channel, thread)) = target
            && let Err(e) = self
                .platform
                .post_message(&channel, Some(&thread), &Message::text(format!("⚠️ {text}")))
                .await
        {
            warn!(context, error = %format!("{e:#}"), "failed to report error to thread");
        }
    }

    pub async fn handle_platform_event(&mut self, event: PlatformEvent) -> Result<()> {
        match event {
            PlatformEvent::Message {
                channel,
                ts,
                thread_ts,
                user,
                text,
            } => {
                self.handle_message(&channel, &ts, thread_ts.as_deref(), &user, &text)
                    .await
            }
            PlatformEvent::BlockAction {
                channel,
                message_ts,
                thread_ts: _,
                user,
                action_id,
                value,
                trigger_id,
            } => {
                self.handle_block_action(
                    &channel,
                    &message_ts,
                    &user,
                    &action_id,
                    &value,
                    trigger_id.as_deref(),
                )
                .await
            }
            PlatformEvent::ViewSubmission {
                user: _,
                callback_id,
                private_metadata,
                values,
            } => {
                self.handle_view_submission(&callback_id, &private_metadata, &values)
                    .await
            }
        }
    }

    async fn handle_message(
        &mut self,
        channel: &str,
        ts: &str,
        thread_ts: Option<&str>,
        user: &str,
        text: &str,
    ) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let thread = thread_ts.unwrap_or(ts);
        let now = Utc::now();
        let session = self.sessions.get_or_create(
            thread,
            channel,
            &mut self.workspaces,
            &self.channels,
            now,
        )?;
        session.last_activity = now;

        if session.is_busy() {
            if !session.autopilot {
                return Err(SessionError::Busy {
                    thread: thread.to_string(),
                }
                .into());
            }
            let channel = session.channel.clone();
            let key = self.payloads.put_interrupt(
                ts,
                InterruptPayload {
                    thread_ts: thread.to_string(),
                    channel: channel.clone(),
                    user: user.to_string(),
                    text: text.to_string(),
                    created_at: now,
                },
            );
            self.platform
                .post_message(&channel, Some(thread), &render_interrupt_prompt(&key, text))
                .await?;
            return Ok(());
        }

        self.start_turn(thread, text.to_string()).await
    }

    /// Hand `text` to the thread's claude: the runner if it is mid-turn,
    /// otherwise a new runner resuming the thread's conversation. A runner
    /// still exiting after its last `result` is replaced.
    async fn start_turn(&mut self, thread: &str, text: String) -> Result<()> {
        let session = self
            .sessions
            .get_mut(thread)
            .ok_or_else(|| SessionError::NotFound {
                thread: thread.to_string(),
            })?;
        if session.is_busy()
            && let Some(runner) = session.runner_mut()
        {
            runner.send_message(&text).await?;
            session.begin_turn();
            return Ok(());
        }
        self.sessions
            .start_runner(thread, text, &self.config.claude, &self.runner_tx)
            .await?;
        Ok(())
    }

    pub async fn handle_runner_event(&mut self, event: RunnerEvent) -> Result<()> {
        let RunnerEvent {
            thread,
            generation,
            kind,
        } = event;
        if !self.sessions.is_current(&thread, generation) {
            debug!(thread, generation, "ignoring event from stale runner");
            return Ok(());
        }
        match kind {
            RunnerEventKind::Stream(event) => {
                self.handle_stream_event(&thread, generation, *event).await
            }
            RunnerEventKind::ParseWarning(_) => Ok(()),
            RunnerEventKind::Stderr(line) => {
                if let Some(session) = self.sessions.get_mut(&thread) {
                    session.push_stderr(line);
                }
                Ok(())
            }
            RunnerEventKind::Exit(exit) => {
                self.sessions.on_runner_exit(&thread, generation);
                debug!(thread, code = ?exit.code, signal = ?exit.signal, requested = exit.requested, "runner detached");
                Ok(())
            }
        }
    }

    async fn handle_stream_event(
        &mut self,
        thread: &str,
        generation: u64,
        event: StreamEvent,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(thread) else {
            return Ok(());
        };
        session.last_activity = Utc::now();
        if let Some(runner) = session.runner_mut() {
            runner.observe(&event);
        }
        let channel = session.channel.clone();

        match event {
            StreamEvent::System(SystemEvent::Init(init)) => {
                debug!(thread, session_id = %init.session_id, model = %init.model, "claude session started");
                if !init.session_id.is_empty() {
                    session.claude_session_id = Some(init.session_id);
                }
            }
            StreamEvent::Assistant(message) => {
                // Subagent traffic stays out of the thread.
                if message.parent_tool_use_id.is_some() {
                    return Ok(());
                }
                for block in message.message.content {
                    match block {
                        AssistantContentBlock::Text { text } => {
                            for chunk in chunk_text(&text, MAX_MESSAGE_CHARS) {
                                self.platform
                                    .post_message(&channel, Some(thread), &Message::text(chunk))
                                    .await?;
                            }
                        }
                        AssistantContentBlock::ToolUse { id, name, input }
                            if is_ask_user_tool(&name) =>
                        {
                            self.present_questions(thread, generation, &id, &input)
                                .await?;
                        }
                        AssistantContentBlock::ToolUse { name, input, .. } => {
                            let line = tool_line(&name, &input);
                            let message = Message {
                                text: line.clone(),
                                blocks: vec![Block::Context { text: line }],
                            };
                            self.platform
                                .post_message(&channel, Some(thread), &message)
                                .await?;
                        }
                        AssistantContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::Result(result) => {
                let mut line = result_line(&result);
                if result.is_abnormal_termination() {
                    let tail: Vec<&str> = session.stderr_tail().collect();
                    if !tail.is_empty() {
                        line.push_str(&format!("\n```\n{}\n```", tail.join("\n")));
                    }
                }
                if !result.session_id.is_empty() {
                    session.claude_session_id = Some(result.session_id);
                }
                if session.finish_turn()
                    && let Some(runner) = session.runner_mut()
                {
                    runner.close_input();
                }
                self.platform
                    .post_message(&channel, Some(thread), &Message::text(line))
                    .await?;
            }
            StreamEvent::ToolResult(_) | StreamEvent::System(SystemEvent::Other) => {}
            StreamEvent::Unrecognized => {}
        }
        Ok(())
    }

    /// Stop idle runners and evict expired mappings, payloads and question sets.
    pub async fn run_sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let expired = self.sessions.sweep_inactive(now);
        let idle_minutes = self.config.sessions.inactivity_timeout_secs / 60;
        for session in expired.iter().filter(|s| s.had_runner) {
            let notice = Message::text(format!(
                "Stopped Claude after {idle_minutes} minutes of inactivity. Send a message to start again."
            ));
            if let Err(e) = self
                .platform
                .post_message(&session.channel, Some(&session.thread_ts), &notice)
                .await
            {
                warn!(thread = %session.thread_ts, error = %format!("{e:#}"), "failed to post inactivity notice");
            }
        }

        let ttl = self.config.sessions.mapping_ttl();
        let report = SweepReport {
            sessions: expired.len(),
            mappings: self.workspaces.evict_expired(now, ttl).len(),
            payloads: self.payloads.evict_expired(now, ttl),
            question_sets: self.questions.prune(now, ttl),
        };
        if report != SweepReport::default() {
            info!(?report, "sweep finished");
        }
        report
    }

    /// Stop every runner and wait for it to exit.
    pub async fn shutdown(&mut self) {
        info!(active = self.sessions.list_active(), "stopping all sessions");
        let timeout = self.config.claude.kill_grace() + Duration::from_secs(2);
        self.sessions.shutdown(timeout).await;
    }
}

/// Run a handler, turning a panic into an error.
pub async fn guarded<F>(handler: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn event_context(event: &PlatformEvent) -> String {
    match event {
        PlatformEvent::Message { channel, ts, .. } => format!("message {ts} in {channel}"),
        PlatformEvent::BlockAction {
            action_id,
            message_ts,
            ..
        } => format!("{action_id} on {message_ts}"),
        PlatformEvent::ViewSubmission { callback_id, .. } => format!("{callback_id} submission"),
    }
}

/// Where to report a rejected event: `(channel, thread_ts)`.
fn reply_target(event: &PlatformEvent) -> Option<(String, String)> {
    match event {
        PlatformEvent::Message {
            channel,
            ts,
            thread_ts,
            ..
        } => Some((channel.clone(), thread_ts.clone().unwrap_or_else(|| ts.clone()))),
        PlatformEvent::BlockAction {
            channel,
            message_ts,
            thread_ts,
            ..
        } => Some((
            channel.clone(),
            thread_ts.clone().unwrap_or_else(|| message_ts.clone()),
        )),
        PlatformEvent::ViewSubmission {
            private_metadata, ..
        } => ModalMetadata::decode(private_metadata)
            .ok()
            .map(|meta| (meta.channel, meta.thread_ts)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guarded_contains_panics() {
        let err = guarded(async {
            if true {
                panic!("boom");
            }
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "handler panicked: boom");

        let err = guarded(async { Err(anyhow!("plain failure")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "plain failure");
        assert!(guarded(async { Ok(()) }).await.is_ok());
    }

    #[test]
    fn reply_target_prefers_thread() {
        let event = PlatformEvent::Message {
            channel: "C1".into(),
            ts: "2.2".into(),
            thread_ts: Some("1.1".into()),
            user: "U1".into(),
            text: "hi".into(),
        };
        assert_eq!(reply_target(&event), Some(("C1".into(), "1.1".into())));

        let event = PlatformEvent::ViewSubmission {
            user: "U1".into(),
            callback_id: "x".into(),
            private_metadata: "garbage".into(),
            values: Default::default(),
        };
        assert_eq!(reply_target(&event), None);
    }
}

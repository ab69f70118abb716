//! Question and interrupt interactions.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::Bot;
use crate::error::{ProtocolError, SessionError};
use crate::platform::{Message, Modal};
use crate::question::interrupt::render_interrupt_sent;
use crate::question::render::{
    render_expired, render_placeholder, render_question_set, render_resolved,
};
use crate::question::value::{
    ActionValue, FREE_TEXT_ACTION, FREE_TEXT_INPUT_ID, FREE_TEXT_MODAL_CALLBACK, INTERRUPT_ACTION,
    ModalMetadata, SELECT_ACTION, SUBMIT_ACTION, TOGGLE_ACTION, truncate_chars,
};
use crate::question::{QuestionSet, Transition, parse_questions};

const MODAL_LABEL_CHARS: usize = 2000;

impl Bot {
    /// Post the questions of an ask-user tool call as an interactive message.
    pub(super) async fn present_questions(
        &mut self,
        thread: &str,
        generation: u64,
        tool_use_id: &str,
        input: &Value,
    ) -> Result<()> {
        let session = self
            .sessions
            .get(thread)
            .ok_or_else(|| SessionError::NotFound {
                thread: thread.to_string(),
            })?;
        let channel = session.channel.clone();
        let project = session.project_name.clone();
        let claude_session_id = session.claude_session_id.clone();

        let questions = match parse_questions(input) {
            Ok(questions) => questions,
            Err(e) => {
                warn!(thread, error = %format!("{e:#}"), "unreadable ask-user call");
                self.platform
                    .post_message(
                        &channel,
                        Some(thread),
                        &Message::text("Claude asked a question that could not be displayed."),
                    )
                    .await?;
                return Ok(());
            }
        };

        let ts = self
            .platform
            .post_message(&channel, Some(thread), &render_placeholder())
            .await?;
        let set = QuestionSet::new(
            &ts,
            &channel,
            thread,
            &project,
            Some(tool_use_id.to_string()),
            claude_session_id,
            Some(generation),
            questions,
            Utc::now(),
        );
        for payload in set.payloads() {
            self.payloads.put_question(&ts, payload);
        }
        let message = render_question_set(&set)?;
        info!(thread, message_ts = %ts, count = set.questions.len(), "presented questions");
        self.questions.insert(set);
        self.platform.update_message(&channel, &ts, &message).await
    }

    pub(super) async fn handle_block_action(
        &mut self,
        channel: &str,
        message_ts: &str,
        user: &str,
        action_id: &str,
        value: &str,
        trigger_id: Option<&str>,
    ) -> Result<()> {
        match action_id {
            SELECT_ACTION | TOGGLE_ACTION | SUBMIT_ACTION => {
                let action = decode_for_message(value, message_ts)?;
                let set = self.lookup_set(channel, message_ts).await?;
                let transition = match action_id {
                    SELECT_ACTION => set.select(action.q, require_option(&action)?),
                    TOGGLE_ACTION => set.toggle(action.q, require_option(&action)?),
                    _ => set.submit(action.q),
                }?;
                let thread = set.thread_ts.clone();
                self.sessions.touch(&thread, Utc::now());
                self.after_transition(message_ts, transition).await
            }
            FREE_TEXT_ACTION => {
                let action = decode_for_message(value, message_ts)?;
                let trigger_id = trigger_id.ok_or_else(|| {
                    ProtocolError::InvalidAction("free-text button pressed without a trigger".into())
                })?;
                let set = self.lookup_set(channel, message_ts).await?;
                set.ensure_open(action.q)?;
                let metadata = ModalMetadata::new(
                    &set.project,
                    action.q,
                    &set.channel,
                    &set.message_ts,
                    &set.thread_ts,
                );
                let modal = Modal {
                    callback_id: FREE_TEXT_MODAL_CALLBACK.to_string(),
                    title: "Answer Claude".to_string(),
                    private_metadata: metadata.encode()?,
                    label: truncate_chars(&set.questions[action.q].question, MODAL_LABEL_CHARS),
                    input_id: FREE_TEXT_INPUT_ID.to_string(),
                    submit: "Send".to_string(),
                };
                self.platform.open_modal(trigger_id, &modal).await
            }
            INTERRUPT_ACTION => self.handle_interrupt(channel, message_ts, user, value).await,
            other => {
                debug!(action_id = other, "ignoring unknown action");
                Ok(())
            }
        }
    }

    pub(super) async fn handle_view_submission(
        &mut self,
        callback_id: &str,
        private_metadata: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<()> {
        if callback_id != FREE_TEXT_MODAL_CALLBACK {
            debug!(callback_id, "ignoring unknown view submission");
            return Ok(());
        }
        let metadata = ModalMetadata::decode(private_metadata)?;
        let text = values
            .get(FREE_TEXT_INPUT_ID)
            .map(String::as_str)
            .unwrap_or_default();
        let set = self
            .lookup_set(&metadata.channel, &metadata.message_ts)
            .await?;
        let transition = set.answer_text(metadata.question_index, text)?;
        self.sessions.touch(&metadata.thread_ts, Utc::now());
        self.after_transition(&metadata.message_ts, transition).await
    }

    /// Find the set presented by `message_ts`; on a miss, mark the message expired.
    async fn lookup_set(&mut self, channel: &str, message_ts: &str) -> Result<&mut QuestionSet> {
        if self.questions.lookup(message_ts, &self.payloads).is_err() {
            if let Err(e) = self
                .platform
                .update_message(channel, message_ts, &render_expired())
                .await
            {
                warn!(message_ts, error = %format!("{e:#}"), "failed to mark question expired");
            }
            return Err(ProtocolError::Expired.into());
        }
        Ok(self.questions.lookup(message_ts, &self.payloads)?)
    }

    async fn after_transition(&mut self, message_ts: &str, transition: Transition) -> Result<()> {
        match transition {
            Transition::Updated => {
                let set = self
                    .questions
                    .get(message_ts)
                    .ok_or(ProtocolError::Expired)?;
                let message = render_question_set(set)?;
                self.platform
                    .update_message(&set.channel, message_ts, &message)
                    .await
            }
            Transition::Complete => self.deliver_answers(message_ts).await,
        }
    }

    /// Send the composed reply to claude and close the set.
    async fn deliver_answers(&mut self, message_ts: &str) -> Result<()> {
        let set = self
            .questions
            .get(message_ts)
            .ok_or(ProtocolError::Expired)?;
        let reply = set.compose_reply();
        let thread = set.thread_ts.clone();
        let channel = set.channel.clone();
        let generation = set.generation;
        let tool_use_id = set.tool_use_id.clone();
        let stored_session_id = set.claude_session_id.clone();

        let delivered = self
            .send_reply(
                &thread,
                &channel,
                generation,
                tool_use_id.as_deref(),
                stored_session_id,
                reply,
            )
            .await;

        let set = self
            .questions
            .get_mut(message_ts)
            .ok_or(ProtocolError::Expired)?;
        let message = if delivered.is_ok() {
            set.resolve();
            render_resolved(set)
        } else {
            set.expire();
            render_expired()
        };
        self.payloads.remove_question_set(message_ts);
        if let Err(e) = self
            .platform
            .update_message(&channel, message_ts, &message)
            .await
        {
            warn!(message_ts, error = %format!("{e:#}"), "failed to update answered question");
        }
        delivered
    }

    async fn send_reply(
        &mut self,
        thread: &str,
        channel: &str,
        generation: Option<u64>,
        tool_use_id: Option<&str>,
        stored_session_id: Option<String>,
        reply: String,
    ) -> Result<()> {
        if let (Some(generation), Some(tool_use_id)) = (generation, tool_use_id)
            && self.sessions.is_current(thread, generation)
            && let Some(runner) = self
                .sessions
                .get_mut(thread)
                .and_then(|session| session.runner_mut())
            && runner.accepts_input()
        {
            info!(thread, tool_use_id, "sending answers to claude");
            return runner.send_answer(tool_use_id, &reply).await;
        }

        // The asking process is gone: continue its conversation in a new one.
        let session = self.sessions.get_or_create(
            thread,
            channel,
            &mut self.workspaces,
            &self.channels,
            Utc::now(),
        )?;
        if session.claude_session_id.is_none() {
            session.claude_session_id = stored_session_id;
        }
        info!(thread, resume = ?session.claude_session_id, "delivering answers as a new turn");
        self.start_turn(thread, reply).await
    }

    async fn handle_interrupt(
        &mut self,
        channel: &str,
        message_ts: &str,
        user: &str,
        key: &str,
    ) -> Result<()> {
        // The payload is consumed only once the held message is with claude.
        let Some(payload) = self.payloads.interrupt(key).cloned() else {
            return Err(ProtocolError::Expired.into());
        };
        let thread = payload.thread_ts.clone();
        let now = Utc::now();
        let session = self.sessions.get_or_create(
            &thread,
            &payload.channel,
            &mut self.workspaces,
            &self.channels,
            now,
        )?;
        session.last_activity = now;
        if let Some(runner) = session.runner_mut()
            && runner.accepts_input()
        {
            runner.interrupt().await?;
            info!(thread, "interrupted claude");
        }
        self.start_turn(&thread, payload.text).await?;
        self.payloads.take_interrupt(key);
        self.platform
            .update_message(channel, message_ts, &render_interrupt_sent(user))
            .await
    }
}

fn decode_for_message(value: &str, message_ts: &str) -> Result<ActionValue, ProtocolError> {
    let action = ActionValue::decode(value)?;
    if action.id != message_ts {
        return Err(ProtocolError::InvalidAction(format!(
            "control belongs to message {}, not {message_ts}",
            action.id
        )));
    }
    Ok(action)
}

fn require_option(action: &ActionValue) -> Result<usize, ProtocolError> {
    action
        .o
        .ok_or_else(|| ProtocolError::InvalidAction("control value has no option".into()))
}

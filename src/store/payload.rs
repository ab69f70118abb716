//! Side storage for data too large for an interactive control's value.

use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::JsonTable;

pub const PAYLOADS_FILE: &str = "payloads.json";

/// One question of a rendered set, keyed by `q:<messageTs>:<index>`.
///
/// Besides the display text it carries enough to rebuild the whole set after
/// a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionPayload {
    pub question_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default)]
    pub option_labels: Vec<String>,
    #[serde(default)]
    pub multi_select: bool,
    pub index: usize,
    /// Number of questions in the set.
    pub count: usize,
    pub thread_ts: String,
    pub channel: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// A user message held back while claude was busy, keyed by
/// `interrupt:<threadTs>:<userMessageTs>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptPayload {
    pub thread_ts: String,
    pub channel: String,
    pub user: String,
    pub text: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    Question(QuestionPayload),
    Interrupt(InterruptPayload),
}

impl ActionPayload {
    fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Question(q) => q.created_at,
            Self::Interrupt(i) => i.created_at,
        }
    }
}

pub fn question_key(message_ts: &str, index: usize) -> String {
    format!("q:{message_ts}:{index}")
}

pub fn interrupt_key(thread_ts: &str, user_message_ts: &str) -> String {
    format!("interrupt:{thread_ts}:{user_message_ts}")
}

/// Action payload table (`payloads.json`).
pub struct PayloadStore {
    table: JsonTable<ActionPayload>,
}

impl PayloadStore {
    pub fn open(data_dir: &Path) -> Self {
        Self {
            table: JsonTable::load(data_dir.join(PAYLOADS_FILE)),
        }
    }

    pub fn put_question(&mut self, message_ts: &str, payload: QuestionPayload) {
        let key = question_key(message_ts, payload.index);
        self.table.set(key, ActionPayload::Question(payload));
    }

    pub fn question(&self, message_ts: &str, index: usize) -> Option<&QuestionPayload> {
        match self.table.get(&question_key(message_ts, index)) {
            Some(ActionPayload::Question(q)) => Some(q),
            _ => None,
        }
    }

    /// All payloads of a set, in order, or `None` if any is missing.
    pub fn question_set(&self, message_ts: &str) -> Option<Vec<QuestionPayload>> {
        let first = self.question(message_ts, 0)?;
        (0..first.count)
            .map(|i| self.question(message_ts, i).cloned())
            .collect()
    }

    pub fn remove_question_set(&mut self, message_ts: &str) {
        let prefix = format!("q:{message_ts}:");
        self.table.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Store an interrupt payload and return its key.
    pub fn put_interrupt(&mut self, user_message_ts: &str, payload: InterruptPayload) -> String {
        let key = interrupt_key(&payload.thread_ts, user_message_ts);
        self.table.set(key.clone(), ActionPayload::Interrupt(payload));
        key
    }

    pub fn interrupt(&self, key: &str) -> Option<&InterruptPayload> {
        if !key.starts_with("interrupt:") {
            return None;
        }
        match self.table.get(key) {
            Some(ActionPayload::Interrupt(payload)) => Some(payload),
            _ => None,
        }
    }

    pub fn take_interrupt(&mut self, key: &str) -> Option<InterruptPayload> {
        self.interrupt(key)?;
        match self.table.remove(key) {
            Some(ActionPayload::Interrupt(payload)) => Some(payload),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Drop payloads older than `ttl`; returns how many were removed.
    pub fn evict_expired(&mut self, now: DateTime<Utc>, ttl: TimeDelta) -> usize {
        let evicted = self.table.retain(|_, p| now - p.created_at() <= ttl).len();
        if evicted > 0 {
            info!(count = evicted, "evicted expired action payloads");
        }
        evicted
    }
}

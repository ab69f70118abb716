//! Compact values carried by interactive controls and modals.
//!
//! Control values are capped at [`MAX_VALUE_BYTES`]; they hold indices and a
//! message id, never the question text, which lives in the payload store.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Byte ceiling for an interactive control's value.
pub const MAX_VALUE_BYTES: usize = 2000;

pub const SELECT_ACTION: &str = "question_select";
pub const TOGGLE_ACTION: &str = "question_toggle";
pub const SUBMIT_ACTION: &str = "question_submit";
pub const FREE_TEXT_ACTION: &str = "question_free_text";
pub const INTERRUPT_ACTION: &str = "interrupt_task";

pub const FREE_TEXT_MODAL_CALLBACK: &str = "question_free_text_modal";
/// Input id of the free-text answer field inside the modal.
pub const FREE_TEXT_INPUT_ID: &str = "answer";

/// Value of a question button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionValue {
    /// Question index within the set.
    pub q: usize,
    /// Option index, absent for submit and free-text buttons.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o: Option<usize>,
    /// Option label, shortened to fit. Display only.
    #[serde(default)]
    pub l: String,
    /// Multi-select flag.
    #[serde(default)]
    pub m: bool,
    /// Project name.
    #[serde(default)]
    pub p: String,
    /// Timestamp of the message presenting the question set.
    pub id: String,
}

impl ActionValue {
    /// Serialize within [`MAX_VALUE_BYTES`], shortening the label and then the project name.
    pub fn encode(&self) -> Result<String> {
        let mut value = self.clone();
        loop {
            let json = serde_json::to_string(&value)?;
            if json.len() <= MAX_VALUE_BYTES {
                return Ok(json);
            }
            let excess = json.len() - MAX_VALUE_BYTES;
            if !value.l.is_empty() {
                value.l = shorten(&value.l, excess);
            } else if !value.p.is_empty() {
                value.p = shorten(&value.p, excess);
            } else {
                bail!(
                    "control value for message {} exceeds {MAX_VALUE_BYTES} bytes",
                    value.id
                );
            }
        }
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw)
            .map_err(|e| ProtocolError::InvalidAction(format!("malformed control value: {e}")))
    }
}

/// Drop at least `excess` bytes from the end of `s`, on a char boundary.
fn shorten(s: &str, excess: usize) -> String {
    truncate_to_bytes(s, s.len().saturating_sub(excess)).to_string()
}

/// Longest prefix of `s` that is at most `max` bytes.
pub fn truncate_to_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate to `max` chars, marking the cut with an ellipsis.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Private metadata of the free-text modal; enough to find the set again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModalMetadata {
    /// `<project>:<messageTs>`.
    pub request_id: String,
    pub question_index: usize,
    pub channel: String,
    pub message_ts: String,
    pub thread_ts: String,
}

impl ModalMetadata {
    pub fn new(
        project: &str,
        question_index: usize,
        channel: &str,
        message_ts: &str,
        thread_ts: &str,
    ) -> Self {
        Self {
            request_id: format!("{project}:{message_ts}"),
            question_index,
            channel: channel.to_string(),
            message_ts: message_ts.to_string(),
            thread_ts: thread_ts.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let meta: Self = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::InvalidAction(format!("malformed modal metadata: {e}")))?;
        if !meta.request_id.ends_with(&format!(":{}", meta.message_ts)) {
            return Err(ProtocolError::InvalidAction(format!(
                "request id {} does not match message {}",
                meta.request_id, meta.message_ts
            )));
        }
        Ok(meta)
    }
}

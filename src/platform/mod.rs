//! The chat platform as seen by the bot: inbound events, outbound calls, and
//! a small platform-neutral UI model.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod stdio;

/// Outbound calls the bot makes.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Post a message, in `thread_ts` when given. Returns the new message's ts.
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        message: &Message,
    ) -> Result<String>;

    /// Replace the content of an existing message.
    async fn update_message(&self, channel: &str, ts: &str, message: &Message) -> Result<()>;

    async fn open_modal(&self, trigger_id: &str, modal: &Modal) -> Result<()>;
}

/// Inbound event delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEvent {
    Message {
        channel: String,
        ts: String,
        #[serde(default)]
        thread_ts: Option<String>,
        #[serde(default)]
        user: String,
        text: String,
    },
    BlockAction {
        channel: String,
        message_ts: String,
        #[serde(default)]
        thread_ts: Option<String>,
        #[serde(default)]
        user: String,
        action_id: String,
        #[serde(default)]
        value: String,
        #[serde(default)]
        trigger_id: Option<String>,
    },
    ViewSubmission {
        #[serde(default)]
        user: String,
        callback_id: String,
        #[serde(default)]
        private_metadata: String,
        /// Input id → submitted text.
        #[serde(default)]
        values: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Plain-text fallback.
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            blocks: Vec::new(),
        }
    }

    /// Every button in the message, in order.
    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.blocks.iter().flat_map(|block| match block {
            Block::Actions { elements } => elements.as_slice(),
            _ => &[][..],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Section { text: String },
    Context { text: String },
    Actions { elements: Vec<Button> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub action_id: String,
    pub text: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<ButtonStyle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonStyle {
    Primary,
    Danger,
}

/// A single-input modal dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modal {
    pub callback_id: String,
    pub title: String,
    pub private_metadata: String,
    pub label: String,
    pub input_id: String,
    pub submit: String,
}

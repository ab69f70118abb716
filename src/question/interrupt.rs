//! "Interrupt & send" prompt shown when a message reaches a busy autopilot thread.

use super::value::{INTERRUPT_ACTION, MAX_VALUE_BYTES, truncate_chars};
use crate::platform::{Block, Button, ButtonStyle, Message};

const PREVIEW_CHARS: usize = 200;

/// Prompt offering to interrupt claude with the held-back message.
///
/// `key` is the payload key; it is the button's entire value.
pub fn render_interrupt_prompt(key: &str, text: &str) -> Message {
    debug_assert!(key.len() <= MAX_VALUE_BYTES);
    Message {
        text: "Claude is still working.".to_string(),
        blocks: vec![
            Block::Section {
                text: format!(
                    "Claude is still working. Interrupt it and send this instead?\n> {}",
                    truncate_chars(text, PREVIEW_CHARS)
                ),
            },
            Block::Actions {
                elements: vec![Button {
                    action_id: INTERRUPT_ACTION.to_string(),
                    text: "Interrupt & send".to_string(),
                    value: key.to_string(),
                    style: Some(ButtonStyle::Danger),
                }],
            },
        ],
    }
}

pub fn render_interrupt_sent(user: &str) -> Message {
    let by = if user.is_empty() {
        String::new()
    } else {
        format!(" by <@{user}>")
    };
    Message {
        text: "Interrupted.".to_string(),
        blocks: vec![Block::Context {
            text: format!("Interrupted{by}; message sent to Claude."),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_carries_only_the_key() {
        let message = render_interrupt_prompt("interrupt:100.1:300.3", &"x".repeat(5000));
        let buttons: Vec<_> = message.buttons().collect();
        assert_eq!(buttons.len(), 1);
        assert_eq!(buttons[0].action_id, INTERRUPT_ACTION);
        assert_eq!(buttons[0].value, "interrupt:100.1:300.3");
        assert_eq!(buttons[0].style, Some(ButtonStyle::Danger));
    }

    #[test]
    fn sent_notice_names_the_user() {
        let Block::Context { text } = &render_interrupt_sent("U1").blocks[0] else {
            unreachable!("notice is a context block");
        };
        insta::assert_snapshot!(text, @"Interrupted by <@U1>; message sent to Claude.");
    }
}

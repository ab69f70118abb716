use anyhow::Result;

use super::state::{ItemState, QuestionSet};
use super::value::{
    ActionValue, FREE_TEXT_ACTION, SELECT_ACTION, SUBMIT_ACTION, TOGGLE_ACTION, truncate_chars,
};
use crate::platform::{Block, Button, ButtonStyle, Message};

/// Longest button caption, in chars.
pub const MAX_BUTTON_TEXT_CHARS: usize = 75;
/// Longest section text, in chars.
pub const MAX_SECTION_CHARS: usize = 3000;
const MAX_BUTTONS_PER_BLOCK: usize = 25;

/// Placeholder posted to obtain the message ts before controls are attached.
pub fn render_placeholder() -> Message {
    Message::text("Claude has a question…")
}

/// The interactive form for an open set.
pub fn render_question_set(set: &QuestionSet) -> Result<Message> {
    let mut blocks = Vec::new();
    for (index, question) in set.questions.iter().enumerate() {
        blocks.push(question_section(set, index));
        match set.item(index) {
            Some(ItemState::Answered(answer)) => blocks.push(Block::Context {
                text: format!("✅ {}", truncate_chars(&answer.display(), MAX_SECTION_CHARS)),
            }),
            _ => {
                let mut buttons = Vec::new();
                let selected = set.selected(index);
                for (option, choice) in question.options.iter().enumerate() {
                    let value = ActionValue {
                        q: index,
                        o: Some(option),
                        l: choice.label.clone(),
                        m: question.multi_select,
                        p: set.project.clone(),
                        id: set.message_ts.clone(),
                    };
                    let button = if question.multi_select {
                        let on = selected.contains(&option);
                        let mark = if on { "☑" } else { "☐" };
                        Button {
                            action_id: TOGGLE_ACTION.to_string(),
                            text: truncate_chars(
                                &format!("{mark} {}", choice.label),
                                MAX_BUTTON_TEXT_CHARS,
                            ),
                            value: value.encode()?,
                            style: on.then_some(ButtonStyle::Primary),
                        }
                    } else {
                        Button {
                            action_id: SELECT_ACTION.to_string(),
                            text: truncate_chars(&choice.label, MAX_BUTTON_TEXT_CHARS),
                            value: value.encode()?,
                            style: None,
                        }
                    };
                    buttons.push(button);
                }
                let bare = ActionValue {
                    q: index,
                    o: None,
                    l: String::new(),
                    m: question.multi_select,
                    p: set.project.clone(),
                    id: set.message_ts.clone(),
                };
                if question.multi_select && !question.options.is_empty() {
                    buttons.push(Button {
                        action_id: SUBMIT_ACTION.to_string(),
                        text: "Submit".to_string(),
                        value: bare.encode()?,
                        style: Some(ButtonStyle::Primary),
                    });
                }
                buttons.push(Button {
                    action_id: FREE_TEXT_ACTION.to_string(),
                    text: "Other…".to_string(),
                    value: bare.encode()?,
                    style: None,
                });
                for chunk in buttons.chunks(MAX_BUTTONS_PER_BLOCK) {
                    blocks.push(Block::Actions {
                        elements: chunk.to_vec(),
                    });
                }
            }
        }
    }
    Ok(Message {
        text: fallback_text(set),
        blocks,
    })
}

/// The form after the answers were delivered: no controls left.
pub fn render_resolved(set: &QuestionSet) -> Message {
    let mut blocks = Vec::new();
    for (index, _) in set.questions.iter().enumerate() {
        blocks.push(question_section(set, index));
        if let Some(ItemState::Answered(answer)) = set.item(index) {
            blocks.push(Block::Context {
                text: format!("✅ {}", truncate_chars(&answer.display(), MAX_SECTION_CHARS)),
            });
        }
    }
    blocks.push(Block::Context {
        text: "Answer sent to Claude.".to_string(),
    });
    Message {
        text: fallback_text(set),
        blocks,
    }
}

pub fn render_expired() -> Message {
    Message {
        text: "This question has expired.".to_string(),
        blocks: vec![Block::Context {
            text: "This question has expired. Ask Claude again to get a new one.".to_string(),
        }],
    }
}

fn question_section(set: &QuestionSet, index: usize) -> Block {
    let question = &set.questions[index];
    let mut text = match &question.header {
        Some(header) => format!("*{header}*\n{}", question.question),
        None => question.question.clone(),
    };
    let described: Vec<String> = question
        .options
        .iter()
        .filter_map(|o| {
            o.description
                .as_ref()
                .map(|d| format!("• *{}*: {d}", o.label))
        })
        .collect();
    if !described.is_empty() {
        text.push('\n');
        text.push_str(&described.join("\n"));
    }
    Block::Section {
        text: truncate_chars(&text, MAX_SECTION_CHARS),
    }
}

fn fallback_text(set: &QuestionSet) -> String {
    match set.questions.as_slice() {
        [only] => truncate_chars(&only.question, MAX_SECTION_CHARS),
        many => format!("Claude has {} questions", many.len()),
    }
}

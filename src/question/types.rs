use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a tool name is the assistant's "ask the user" tool.
///
/// The tool has shipped under several spellings.
pub fn is_ask_user_tool(name: &str) -> bool {
    matches!(
        name,
        "AskUserQuestion" | "ask_user_question" | "askUserQuestion" | "ask-user-question"
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One question from an ask-user tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

impl Question {
    pub fn option_labels(&self) -> Vec<String> {
        self.options.iter().map(|o| o.label.clone()).collect()
    }
}

#[derive(Deserialize)]
struct AskInput {
    #[serde(default)]
    questions: Vec<Question>,
}

/// Extract the questions from an ask-user tool input.
pub fn parse_questions(input: &Value) -> Result<Vec<Question>> {
    let parsed: AskInput = serde_json::from_value(input.clone())
        .context("ask-user tool input has an unexpected shape")?;
    let questions: Vec<Question> = parsed
        .questions
        .into_iter()
        .filter(|q| !q.question.trim().is_empty())
        .collect();
    if questions.is_empty() {
        bail!("ask-user tool call carries no questions");
    }
    Ok(questions)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recognizes_tool_spellings() {
        assert!(is_ask_user_tool("AskUserQuestion"));
        assert!(is_ask_user_tool("ask_user_question"));
        assert!(!is_ask_user_tool("Bash"));
        assert!(!is_ask_user_tool("ExitPlanMode"));
    }

    #[test]
    fn parses_questions_with_options() {
        let input = json!({
            "questions": [
                {
                    "question": "Which database?",
                    "header": "Storage",
                    "options": [
                        {"label": "SQLite", "description": "embedded"},
                        {"label": "Postgres"}
                    ],
                    "multiSelect": false
                },
                {
                    "question": "Which features?",
                    "options": [{"label": "A"}, {"label": "B"}, {"label": "C"}],
                    "multiSelect": true
                }
            ]
        });
        let questions = parse_questions(&input).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].header.as_deref(), Some("Storage"));
        assert_eq!(questions[0].option_labels(), vec!["SQLite", "Postgres"]);
        assert_eq!(questions[0].options[0].description.as_deref(), Some("embedded"));
        assert!(questions[1].multi_select);
    }

    #[test]
    fn rejects_empty_question_list() {
        assert!(parse_questions(&json!({"questions": []})).is_err());
        assert!(parse_questions(&json!({"questions": [{"question": "  "}]})).is_err());
        assert!(parse_questions(&json!({"questions": "nope"})).is_err());
    }
}

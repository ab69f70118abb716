//! Ask-user questions rendered as chat controls and their answers.

pub mod interrupt;
pub mod render;
pub mod state;
pub mod types;
pub mod value;

pub use state::{Answer, ItemState, QuestionBoard, QuestionSet, QuestionSetState, Transition};
pub use types::{Question, QuestionOption, is_ask_user_tool, parse_questions};

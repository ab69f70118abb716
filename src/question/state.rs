use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::info;

use super::types::{Question, QuestionOption};
use crate::error::ProtocolError;
use crate::store::{PayloadStore, QuestionPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Options(Vec<String>),
    Text(String),
}

impl Answer {
    pub fn display(&self) -> String {
        match self {
            Self::Options(labels) => labels.join(", "),
            Self::Text(text) => text.clone(),
        }
    }
}

/// Progress of one question in a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    /// Multi-select with toggles not yet submitted.
    PartiallyAnswered(BTreeSet<usize>),
    Answered(Answer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Resolved,
    Expired,
}

/// Observable state of a question set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionSetState {
    Pending,
    PartiallyAnswered,
    Answered,
    Resolved,
    Expired,
}

/// Outcome of an accepted interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The set changed and needs re-rendering.
    Updated,
    /// Every question now has an answer; the reply can be sent.
    Complete,
}

/// The questions of one ask-user tool call, keyed by the message presenting them.
#[derive(Debug, Clone)]
pub struct QuestionSet {
    pub message_ts: String,
    pub channel: String,
    pub thread_ts: String,
    pub project: String,
    pub tool_use_id: Option<String>,
    pub claude_session_id: Option<String>,
    /// Runner generation that asked; `None` when rebuilt from stored payloads.
    pub generation: Option<u64>,
    pub questions: Vec<Question>,
    pub created_at: DateTime<Utc>,
    items: Vec<ItemState>,
    phase: Phase,
}

impl QuestionSet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_ts: &str,
        channel: &str,
        thread_ts: &str,
        project: &str,
        tool_use_id: Option<String>,
        claude_session_id: Option<String>,
        generation: Option<u64>,
        questions: Vec<Question>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let items = vec![ItemState::Pending; questions.len()];
        Self {
            message_ts: message_ts.to_string(),
            channel: channel.to_string(),
            thread_ts: thread_ts.to_string(),
            project: project.to_string(),
            tool_use_id,
            claude_session_id,
            generation,
            questions,
            created_at,
            items,
            phase: Phase::Open,
        }
    }

    /// Rebuild a set from its stored payloads, e.g. after a restart.
    pub fn from_payloads(message_ts: &str, mut payloads: Vec<QuestionPayload>) -> Option<Self> {
        payloads.sort_by_key(|p| p.index);
        let first = payloads.first()?.clone();
        let questions = payloads
            .into_iter()
            .map(|p| Question {
                question: p.question_text,
                header: p.header,
                options: p
                    .option_labels
                    .into_iter()
                    .map(|label| QuestionOption {
                        label,
                        description: None,
                    })
                    .collect(),
                multi_select: p.multi_select,
            })
            .collect();
        Some(Self::new(
            message_ts,
            &first.channel,
            &first.thread_ts,
            &first.project,
            first.tool_use_id,
            first.claude_session_id,
            None,
            questions,
            first.created_at,
        ))
    }

    /// One payload per question, for the payload store.
    pub fn payloads(&self) -> Vec<QuestionPayload> {
        self.questions
            .iter()
            .enumerate()
            .map(|(index, q)| QuestionPayload {
                question_text: q.question.clone(),
                header: q.header.clone(),
                option_labels: q.option_labels(),
                multi_select: q.multi_select,
                index,
                count: self.questions.len(),
                thread_ts: self.thread_ts.clone(),
                channel: self.channel.clone(),
                project: self.project.clone(),
                tool_use_id: self.tool_use_id.clone(),
                claude_session_id: self.claude_session_id.clone(),
                created_at: self.created_at,
            })
            .collect()
    }

    pub fn state(&self) -> QuestionSetState {
        match self.phase {
            Phase::Resolved => QuestionSetState::Resolved,
            Phase::Expired => QuestionSetState::Expired,
            Phase::Open if self.is_complete() => QuestionSetState::Answered,
            Phase::Open
                if self.items.iter().any(|item| match item {
                    ItemState::Pending => false,
                    ItemState::PartiallyAnswered(selected) => !selected.is_empty(),
                    ItemState::Answered(_) => true,
                }) =>
            {
                QuestionSetState::PartiallyAnswered
            }
            Phase::Open => QuestionSetState::Pending,
        }
    }

    pub fn item(&self, index: usize) -> Option<&ItemState> {
        self.items.get(index)
    }

    fn is_complete(&self) -> bool {
        self.items
            .iter()
            .all(|item| matches!(item, ItemState::Answered(_)))
    }

    /// Check that question `index` can still take input.
    pub fn ensure_open(&self, index: usize) -> Result<(), ProtocolError> {
        match self.phase {
            Phase::Resolved => return Err(ProtocolError::AlreadyAnswered),
            Phase::Expired => return Err(ProtocolError::Expired),
            Phase::Open => {}
        }
        match self.items.get(index) {
            None => Err(ProtocolError::InvalidAction(format!(
                "question {index} does not exist"
            ))),
            Some(ItemState::Answered(_)) => Err(ProtocolError::AlreadyAnswered),
            Some(_) => Ok(()),
        }
    }

    fn option_label(&self, index: usize, option: usize) -> Result<String, ProtocolError> {
        self.questions[index]
            .options
            .get(option)
            .map(|o| o.label.clone())
            .ok_or_else(|| ProtocolError::InvalidAction(format!("option {option} does not exist")))
    }

    fn answer(&mut self, index: usize, answer: Answer) -> Transition {
        self.items[index] = ItemState::Answered(answer);
        if self.is_complete() {
            Transition::Complete
        } else {
            Transition::Updated
        }
    }

    /// Pick an option of a single-select question.
    pub fn select(&mut self, index: usize, option: usize) -> Result<Transition, ProtocolError> {
        self.ensure_open(index)?;
        if self.questions[index].multi_select {
            return Err(ProtocolError::InvalidAction(
                "select on a multi-select question".into(),
            ));
        }
        let label = self.option_label(index, option)?;
        Ok(self.answer(index, Answer::Options(vec![label])))
    }

    /// Flip an option of a multi-select question.
    pub fn toggle(&mut self, index: usize, option: usize) -> Result<Transition, ProtocolError> {
        self.ensure_open(index)?;
        if !self.questions[index].multi_select {
            return Err(ProtocolError::InvalidAction(
                "toggle on a single-select question".into(),
            ));
        }
        self.option_label(index, option)?;
        let mut selected = match &self.items[index] {
            ItemState::PartiallyAnswered(selected) => selected.clone(),
            _ => BTreeSet::new(),
        };
        if !selected.remove(&option) {
            selected.insert(option);
        }
        self.items[index] = ItemState::PartiallyAnswered(selected);
        Ok(Transition::Updated)
    }

    /// Submit the toggled options of a multi-select question.
    pub fn submit(&mut self, index: usize) -> Result<Transition, ProtocolError> {
        self.ensure_open(index)?;
        let selected = match &self.items[index] {
            ItemState::PartiallyAnswered(selected) if !selected.is_empty() => selected.clone(),
            _ => return Err(ProtocolError::EmptySelection),
        };
        let labels = selected
            .into_iter()
            .map(|option| self.option_label(index, option))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.answer(index, Answer::Options(labels)))
    }

    /// Answer with free text.
    pub fn answer_text(&mut self, index: usize, text: &str) -> Result<Transition, ProtocolError> {
        self.ensure_open(index)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ProtocolError::EmptySelection);
        }
        Ok(self.answer(index, Answer::Text(text.to_string())))
    }

    /// Options currently toggled on for question `index`.
    pub fn selected(&self, index: usize) -> BTreeSet<usize> {
        match self.items.get(index) {
            Some(ItemState::PartiallyAnswered(selected)) => selected.clone(),
            _ => BTreeSet::new(),
        }
    }

    pub fn resolve(&mut self) {
        self.phase = Phase::Resolved;
    }

    pub fn expire(&mut self) {
        self.phase = Phase::Expired;
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    /// The reply to the assistant once every question is answered.
    pub fn compose_reply(&self) -> String {
        let pairs: Vec<String> = self
            .questions
            .iter()
            .zip(&self.items)
            .map(|(q, item)| {
                let answer = match item {
                    ItemState::Answered(answer) => answer.display(),
                    _ => String::new(),
                };
                format!("\"{}\"=\"{answer}\"", q.question)
            })
            .collect();
        format!(
            "User has answered your questions: {}. You can now continue with the user's answers in mind.",
            pairs.join(", ")
        )
    }
}

/// Question sets the bot has rendered, by presenting message ts.
#[derive(Default)]
pub struct QuestionBoard {
    sets: HashMap<String, QuestionSet>,
}

impl QuestionBoard {
    pub fn insert(&mut self, set: QuestionSet) {
        self.sets.insert(set.message_ts.clone(), set);
    }

    pub fn get(&self, message_ts: &str) -> Option<&QuestionSet> {
        self.sets.get(message_ts)
    }

    pub fn get_mut(&mut self, message_ts: &str) -> Option<&mut QuestionSet> {
        self.sets.get_mut(message_ts)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// The set presented by `message_ts`, rebuilt from stored payloads when it
    /// is not in memory.
    pub fn lookup(
        &mut self,
        message_ts: &str,
        payloads: &PayloadStore,
    ) -> Result<&mut QuestionSet, ProtocolError> {
        if !self.sets.contains_key(message_ts) {
            let set = payloads
                .question_set(message_ts)
                .and_then(|stored| QuestionSet::from_payloads(message_ts, stored))
                .ok_or(ProtocolError::Expired)?;
            info!(message_ts, "restored question set from payloads");
            self.insert(set);
        }
        self.sets.get_mut(message_ts).ok_or(ProtocolError::Expired)
    }

    /// Drop sets older than `ttl`. Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>, ttl: TimeDelta) -> usize {
        let before = self.sets.len();
        self.sets.retain(|_, set| now - set.created_at <= ttl);
        before - self.sets.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn question(text: &str, labels: &[&str], multi_select: bool) -> Question {
        Question {
            question: text.to_string(),
            header: None,
            options: labels
                .iter()
                .map(|l| QuestionOption {
                    label: (*l).to_string(),
                    description: None,
                })
                .collect(),
            multi_select,
        }
    }

    fn set(questions: Vec<Question>) -> QuestionSet {
        QuestionSet::new(
            "200.2",
            "C1",
            "100.1",
            "app",
            Some("toolu_1".into()),
            Some("sess".into()),
            Some(1),
            questions,
            Utc::now(),
        )
    }

    #[test]
    fn single_select_answers_immediately() {
        let mut s = set(vec![question("Which database?", &["SQLite", "Postgres"], false)]);
        assert_eq!(s.state(), QuestionSetState::Pending);
        assert_eq!(s.select(0, 1).unwrap(), Transition::Complete);
        assert_eq!(s.state(), QuestionSetState::Answered);
        assert_eq!(
            s.item(0),
            Some(&ItemState::Answered(Answer::Options(vec!["Postgres".into()])))
        );
        assert_eq!(s.select(0, 0), Err(ProtocolError::AlreadyAnswered));
    }

    #[test]
    fn multi_select_collects_toggles() {
        let mut s = set(vec![question("Which features?", &["A", "B", "C"], true)]);
        assert_eq!(s.submit(0), Err(ProtocolError::EmptySelection));

        s.toggle(0, 0).unwrap();
        assert_eq!(s.state(), QuestionSetState::PartiallyAnswered);
        s.toggle(0, 1).unwrap();
        assert_eq!(s.submit(0).unwrap(), Transition::Complete);
        assert_eq!(
            s.item(0),
            Some(&ItemState::Answered(Answer::Options(vec![
                "A".into(),
                "B".into()
            ])))
        );
    }

    #[test]
    fn toggling_twice_deselects() {
        let mut s = set(vec![question("Which features?", &["A", "B", "C"], true)]);
        s.toggle(0, 2).unwrap();
        s.toggle(0, 2).unwrap();
        assert!(s.selected(0).is_empty());
        assert_eq!(s.state(), QuestionSetState::Pending);
        assert_eq!(s.submit(0), Err(ProtocolError::EmptySelection));
    }

    #[test]
    fn set_completes_only_when_every_question_answered() {
        let mut s = set(vec![
            question("Which database?", &["SQLite", "Postgres"], false),
            question("Anything else?", &[], false),
        ]);
        assert_eq!(s.select(0, 0).unwrap(), Transition::Updated);
        assert_eq!(s.state(), QuestionSetState::PartiallyAnswered);
        assert_eq!(s.answer_text(1, "   "), Err(ProtocolError::EmptySelection));
        assert_eq!(s.answer_text(1, " keep it small ").unwrap(), Transition::Complete);
        insta::assert_snapshot!(s.compose_reply(), @r#"User has answered your questions: "Which database?"="SQLite", "Anything else?"="keep it small". You can now continue with the user's answers in mind."#);
    }

    #[test]
    fn resolved_set_rejects_everything() {
        let mut s = set(vec![question("Q", &["A", "B"], false)]);
        s.select(0, 0).unwrap();
        s.resolve();
        assert_eq!(s.state(), QuestionSetState::Resolved);
        assert_eq!(s.select(0, 1), Err(ProtocolError::AlreadyAnswered));
        assert_eq!(s.answer_text(0, "x"), Err(ProtocolError::AlreadyAnswered));
    }

    #[test]
    fn expired_set_reports_expired() {
        let mut s = set(vec![question("Q", &["A", "B"], false)]);
        s.expire();
        assert_eq!(s.select(0, 0), Err(ProtocolError::Expired));
    }

    #[test]
    fn bad_indices_are_invalid() {
        let mut s = set(vec![question("Q", &["A", "B"], false)]);
        assert!(matches!(s.select(3, 0), Err(ProtocolError::InvalidAction(_))));
        assert!(matches!(s.select(0, 9), Err(ProtocolError::InvalidAction(_))));
        assert!(matches!(s.toggle(0, 0), Err(ProtocolError::InvalidAction(_))));
        assert_eq!(s.state(), QuestionSetState::Pending);
    }

    #[test]
    fn board_restores_from_payloads() {
        let dir = TempDir::new().unwrap();
        let mut payloads = PayloadStore::open(dir.path());
        let original = set(vec![
            question("Which database?", &["SQLite", "Postgres"], false),
            question("Which features?", &["A", "B"], true),
        ]);
        for payload in original.payloads() {
            payloads.put_question("200.2", payload);
        }

        let mut board = QuestionBoard::default();
        let restored = board.lookup("200.2", &payloads).unwrap();
        assert_eq!(restored.generation, None);
        assert_eq!(restored.tool_use_id.as_deref(), Some("toolu_1"));
        assert_eq!(restored.questions, original.questions);
        assert_eq!(restored.thread_ts, "100.1");
        assert_eq!(board.len(), 1);

        assert_eq!(
            board.lookup("999.9", &payloads).err(),
            Some(ProtocolError::Expired)
        );
    }

    #[test]
    fn prune_drops_old_sets() {
        let mut board = QuestionBoard::default();
        let now = Utc::now();
        let mut old = set(vec![question("Q", &["A"], false)]);
        old.message_ts = "old".into();
        old.created_at = now - TimeDelta::hours(25);
        board.insert(old);
        board.insert(set(vec![question("Q", &["A"], false)]));

        assert_eq!(board.prune(now, TimeDelta::hours(24)), 1);
        assert!(board.get("old").is_none());
        assert!(board.get("200.2").is_some());
    }
}

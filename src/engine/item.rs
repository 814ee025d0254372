use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::FailureKind;
use crate::matching::MatchDecision;
use crate::records::GameRecord;
use crate::ymgal::HttpFailure;

/// Unique key of an input record (the source row id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle of a work item: Pending → InFlight → terminal, with
/// InFlight → Pending on a requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Abandoned,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemState::Succeeded | ItemState::Failed | ItemState::Abandoned
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Pending => write!(f, "PENDING"),
            ItemState::InFlight => write!(f, "IN_FLIGHT"),
            ItemState::Succeeded => write!(f, "SUCCEEDED"),
            ItemState::Failed => write!(f, "FAILED"),
            ItemState::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

/// Which record fields feed the search keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Japanese name, then Chinese name.
    #[default]
    Names,
    /// Every alias column, in column order.
    Aliases,
}

/// One search term plus the label that names where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyword {
    pub label: String,
    pub text: String,
}

/// The search payload for one work item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub keywords: Vec<Keyword>,
}

impl Query {
    pub fn for_record(record: &GameRecord, mode: QueryMode) -> Self {
        let mut keywords = Vec::new();
        let mut push = |label: String, text: &str| {
            let text = text.trim();
            if !text.is_empty() && !keywords.iter().any(|k: &Keyword| k.text == text) {
                keywords.push(Keyword {
                    label,
                    text: text.to_string(),
                });
            }
        };

        match mode {
            QueryMode::Names => {
                if let Some(jp) = &record.jp_name {
                    push("jp_name".to_string(), jp);
                }
                if let Some(cn) = &record.cn_name {
                    push("cn_name".to_string(), cn);
                }
            }
            QueryMode::Aliases => {
                for (i, alias) in record.aliases.iter().enumerate() {
                    push(format!("alias{}", i + 1), alias);
                }
            }
        }

        Self { keywords }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}

/// A unit of input owned by the scheduler.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: ItemId,
    pub record: Arc<GameRecord>,
    pub query: Query,
    pub state: ItemState,
    /// Dispatches so far, for the output row.
    pub attempts: u32,
    /// When the current (or last) attempt was sent.
    pub dispatched_at: Option<Instant>,
}

impl WorkItem {
    pub fn new(record: GameRecord, mode: QueryMode) -> Self {
        let query = Query::for_record(&record, mode);
        Self {
            id: record.id.clone(),
            record: Arc::new(record),
            query,
            state: ItemState::Pending,
            attempts: 0,
            dispatched_at: None,
        }
    }

    pub fn mark_in_flight(&mut self, now: Instant) {
        debug_assert_eq!(self.state, ItemState::Pending, "dispatch of non-pending item {}", self.id);
        self.state = ItemState::InFlight;
        self.attempts += 1;
        self.dispatched_at = Some(now);
    }

    pub fn requeue(&mut self) {
        debug_assert_eq!(self.state, ItemState::InFlight, "requeue of idle item {}", self.id);
        self.state = ItemState::Pending;
    }

    pub fn finish(&mut self, state: ItemState) {
        debug_assert!(state.is_terminal(), "finish with non-terminal state {state}");
        debug_assert!(!self.state.is_terminal(), "item {} finished twice", self.id);
        self.state = state;
    }
}

/// Classified result of one fetch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(MatchDecision),
    RateLimited { retry_after: Option<Duration> },
    TransientError(String),
    FatalError(String),
}

impl Outcome {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::RateLimited { .. } => Some(FailureKind::RateLimited),
            Outcome::TransientError(_) => Some(FailureKind::Transient),
            Outcome::FatalError(_) => Some(FailureKind::Fatal),
        }
    }
}

impl From<HttpFailure> for Outcome {
    fn from(failure: HttpFailure) -> Self {
        match failure.kind() {
            FailureKind::RateLimited => Outcome::RateLimited {
                retry_after: failure.retry_after(),
            },
            FailureKind::Transient => Outcome::TransientError(failure.to_string()),
            FailureKind::Fatal => Outcome::FatalError(failure.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> GameRecord {
        GameRecord {
            id: ItemId::from("42"),
            title: "Sample".into(),
            jp_name: Some(" サンプル ".into()),
            cn_name: Some("样本".into()),
            aliases: vec!["Sample".into(), "".into(), "Sample Two".into()],
            baseline_score: None,
        }
    }

    #[test]
    fn names_query_uses_jp_then_cn() {
        let q = Query::for_record(&record(), QueryMode::Names);
        let texts: Vec<_> = q.keywords.iter().map(|k| k.text.as_str()).collect();
        assert_eq!(texts, vec!["サンプル", "样本"]);
        assert_eq!(q.keywords[0].label, "jp_name");
    }

    #[test]
    fn alias_query_skips_blanks_and_keeps_column_labels() {
        let q = Query::for_record(&record(), QueryMode::Aliases);
        let labels: Vec<_> = q.keywords.iter().map(|k| k.label.as_str()).collect();
        assert_eq!(labels, vec!["alias1", "alias3"]);
    }

    #[test]
    fn duplicate_keywords_are_searched_once() {
        let mut r = record();
        r.cn_name = Some("サンプル".into());
        let q = Query::for_record(&r, QueryMode::Names);
        assert_eq!(q.keywords.len(), 1);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut item = WorkItem::new(record(), QueryMode::Names);
        assert_eq!(item.state, ItemState::Pending);
        let sent = Instant::now();
        item.mark_in_flight(sent);
        assert_eq!(item.state, ItemState::InFlight);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.dispatched_at, Some(sent));
        item.requeue();
        item.mark_in_flight(Instant::now());
        assert_eq!(item.attempts, 2);
        item.finish(ItemState::Succeeded);
        assert!(item.state.is_terminal());
    }

    #[test]
    fn http_failures_map_to_outcomes() {
        let rl: Outcome = HttpFailure::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        }
        .into();
        assert_eq!(
            rl,
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );

        let transient: Outcome = HttpFailure::Timeout.into();
        assert_eq!(transient.failure_kind(), Some(FailureKind::Transient));

        let fatal: Outcome = HttpFailure::Status {
            status: 404,
            message: "gone".into(),
        }
        .into();
        assert_eq!(fatal.failure_kind(), Some(FailureKind::Fatal));
    }
}

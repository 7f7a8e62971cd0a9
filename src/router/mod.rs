//! Task Router
//!
//! Maps a free-text task onto the registered handlers:
//! - Broad coordination requests go to the dispatcher (when registered)
//! - Otherwise every specialist whose keywords match is selected
//! - Selected handlers run gathering → synthesis → reporting, then by priority
//! - Each handler receives the clauses of the task that mention it
//!
//! Routing is a pure function of the task text and the session.

use crate::error::RoutingError;
use crate::handlers::HandlerRegistry;
use crate::models::{Assignment, ExecutionMode, HandlerId, RoutingDecision, Stage};
use crate::session::Session;
use tracing::debug;

/// Clause boundaries used to split a task into per-handler sub-tasks
const CLAUSE_SEPARATORS: &[&str] = &[", then ", " then ", ", and ", " and ", "; ", ". "];

/// Openers that mark a task as a continuation of the previous answer
const FOLLOW_UP_CUES: &[&str] = &["and", "also", "now", "then", "what about", "how about", "same"];

pub struct Router {
    specialists: Vec<(HandlerId, Vec<String>)>,
    dispatcher: Option<Vec<String>>,
}

impl Router {
    pub fn new(handlers: &HandlerRegistry) -> Self {
        let mut specialists = Vec::new();
        let mut dispatcher = None;

        for (id, keywords) in handlers.capability_sets() {
            if id == HandlerId::Dispatcher {
                dispatcher = Some(keywords);
            } else {
                specialists.push((id, keywords));
            }
        }

        Self {
            specialists,
            dispatcher,
        }
    }

    pub fn route(&self, task: &str, session: &Session) -> Result<RoutingDecision, RoutingError> {
        let task = task.trim();
        let normalized = normalize(task);

        if let Some(keywords) = &self.dispatcher {
            if matches_any(&normalized, keywords) {
                debug!("Routing to dispatcher");
                return Ok(RoutingDecision::single(HandlerId::Dispatcher, task));
            }
        }

        let mut selected: Vec<&(HandlerId, Vec<String>)> = self
            .specialists
            .iter()
            .filter(|(_, keywords)| matches_any(&normalized, keywords))
            .collect();

        if selected.is_empty() {
            return self
                .follow_up(task, &normalized, session)
                .ok_or_else(|| RoutingError::NoRoute(task.to_string()));
        }

        selected.sort_by_key(|(id, _)| (id.stage(), id.priority()));

        let clauses = split_clauses(task);
        let assignments: Vec<Assignment> = selected
            .iter()
            .map(|(id, keywords)| Assignment {
                handler: *id,
                sub_task: sub_task_for(task, &clauses, keywords),
            })
            .collect();

        let mode = if assignments.len() > 1
            && assignments
                .iter()
                .all(|a| a.handler.stage() == Stage::Gathering)
        {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        };

        debug!(
            handlers = ?assignments.iter().map(|a| a.handler).collect::<Vec<_>>(),
            ?mode,
            "Routed task"
        );

        Ok(RoutingDecision { assignments, mode })
    }

    /// Route a keyword-less continuation to whoever answered last
    fn follow_up(
        &self,
        task: &str,
        normalized: &str,
        session: &Session,
    ) -> Option<RoutingDecision> {
        let is_follow_up = FOLLOW_UP_CUES
            .iter()
            .any(|cue| normalized.starts_with(&format!(" {} ", cue)));

        if !is_follow_up {
            return None;
        }

        let last = session.last_assistant_handler()?;
        self.specialists
            .iter()
            .any(|(id, _)| *id == last)
            .then(|| RoutingDecision::single(last, task))
    }
}

/// Lowercase, keep alphanumerics and hyphens, pad with spaces for word matching
pub(crate) fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .flat_map(|c| {
            let c = if c.is_alphanumeric() || c == '-' { c } else { ' ' };
            c.to_lowercase()
        })
        .collect();

    format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Whole-word match; a trailing `*` turns the keyword into a word prefix
pub(crate) fn keyword_matches(normalized: &str, keyword: &str) -> bool {
    match keyword.strip_suffix('*') {
        Some(stem) => normalized.contains(&format!(" {}", stem)),
        None => normalized.contains(&format!(" {} ", keyword)),
    }
}

fn matches_any(normalized: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|kw| keyword_matches(normalized, kw))
}

fn split_clauses(task: &str) -> Vec<&str> {
    // ASCII lowercasing keeps byte offsets aligned with `task`
    let lower = task.to_ascii_lowercase();
    let mut clauses = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < lower.len() {
        if let Some(sep) = CLAUSE_SEPARATORS.iter().find(|s| lower[i..].starts_with(**s)) {
            clauses.push(&task[start..i]);
            i += sep.len();
            start = i;
        } else {
            i += lower[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        }
    }
    clauses.push(&task[start..]);

    clauses
        .into_iter()
        .map(|c| c.trim().trim_end_matches(['.', ',', ';']))
        .filter(|c| !c.is_empty())
        .collect()
}

fn sub_task_for(task: &str, clauses: &[&str], keywords: &[String]) -> String {
    let own: Vec<&str> = clauses
        .iter()
        .copied()
        .filter(|clause| matches_any(&normalize(clause), keywords))
        .collect();

    if own.is_empty() {
        task.to_string()
    } else {
        own.join(" and ")
    }
}

//! Per-conversation session state
//!
//! The turn log is append-only and chronological: it is both the audit
//! trail and the context window handed to handlers and the evaluator.

use crate::models::{
    Contribution, HandlerId, RoutingDecision, SideEffect, ToolCall, ToolResult,
};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
    System,
}

impl TurnRole {
    pub fn label(&self) -> &'static str {
        match self {
            TurnRole::User => "User",
            TurnRole::Assistant => "Assistant",
            TurnRole::Tool => "Tool",
            TurnRole::System => "System",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    Accepted,
    NeedsInput,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Accepted => "accepted",
            SessionStatus::NeedsInput => "needs_input",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "accepted" => SessionStatus::Accepted,
            "needs_input" => SessionStatus::NeedsInput,
            "failed" => SessionStatus::Failed,
            _ => SessionStatus::Running,
        }
    }
}

/// Tool invocation details carried by a `Tool` turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRecord {
    pub call_id: Uuid,
    pub tool_name: String,
    pub arguments: Value,
    pub side_effect: SideEffect,
    pub result: ToolResult,
    pub duration_ms: u64,
}

/// A single entry in the session log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub turn_id: Uuid,
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRecord>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn new(role: TurnRole, content: String, handler: Option<HandlerId>) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            role,
            content,
            handler,
            tool: None,
            // microsecond precision survives a TIMESTAMPTZ round trip
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content.into(), None)
    }

    pub fn assistant(handler: HandlerId, content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content.into(), Some(handler))
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(TurnRole::System, content.into(), None)
    }

    pub fn tool_result(
        handler: HandlerId,
        call: &ToolCall,
        side_effect: SideEffect,
        result: ToolResult,
        duration_ms: u64,
    ) -> Self {
        let content = match &result {
            ToolResult::Success(value) => format!("{} -> {}", call.tool_name, value),
            ToolResult::Failure(failure) => format!(
                "{} failed ({}): {}",
                call.tool_name, failure.kind, failure.message
            ),
        };

        let mut turn = Self::new(TurnRole::Tool, content, Some(handler));
        turn.tool = Some(ToolRecord {
            call_id: call.call_id,
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            side_effect,
            result,
            duration_ms,
        });
        turn
    }

    /// True for tool turns whose result is a failure descriptor
    pub fn is_error(&self) -> bool {
        self.tool
            .as_ref()
            .map(|t| !t.result.is_success())
            .unwrap_or(false)
    }
}

/// Plan progress kept while the session waits for caller input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingPlan {
    pub task: String,
    /// `None` when routing itself asked for clarification
    pub decision: Option<RoutingDecision>,
    pub position: usize,
    #[serde(default)]
    pub accepted: Vec<Contribution>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    conversation_id: String,
    turns: Vec<Turn>,
    success_criterion: Option<String>,
    feedback: String,
    status: SessionStatus,
    shared_context: BTreeMap<String, Value>,
    pending: Option<PendingPlan>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            turns: Vec::new(),
            success_criterion: None,
            feedback: String::new(),
            status: SessionStatus::Running,
            shared_context: BTreeMap::new(),
            pending: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a session from persisted parts (checkpoint stores)
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        conversation_id: String,
        turns: Vec<Turn>,
        success_criterion: Option<String>,
        feedback: String,
        status: SessionStatus,
        shared_context: BTreeMap<String, Value>,
        pending: Option<PendingPlan>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id,
            turns,
            success_criterion,
            feedback,
            status,
            shared_context,
            pending,
            created_at,
            updated_at,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    // =============================
    // Turn log
    // =============================

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.updated_at = Utc::now();
    }

    pub fn extend(&mut self, turns: impl IntoIterator<Item = Turn>) {
        self.turns.extend(turns);
        self.updated_at = Utc::now();
    }

    /// Turns appended after the first `len` entries
    pub fn turns_after(&self, len: usize) -> &[Turn] {
        self.turns.get(len..).unwrap_or(&[])
    }

    /// Index just past the most recent user turn (start of the current task)
    pub fn current_task_start(&self) -> usize {
        self.turns
            .iter()
            .rposition(|t| t.role == TurnRole::User)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Tool turns recorded for `handler` since the latest user input
    pub fn tool_records_for(&self, handler: HandlerId) -> impl Iterator<Item = &ToolRecord> {
        self.turns[self.current_task_start()..]
            .iter()
            .filter(move |t| t.handler == Some(handler))
            .filter_map(|t| t.tool.as_ref())
    }

    pub fn last_assistant_handler(&self) -> Option<HandlerId> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::Assistant)
            .and_then(|t| t.handler)
    }

    /// Render the log as plain text for prompts
    pub fn format_conversation(&self) -> String {
        self.turns
            .iter()
            .map(|t| match t.handler {
                Some(h) if t.role == TurnRole::Assistant => {
                    format!("Assistant ({}): {}", h.display_name(), t.content)
                }
                _ => format!("{}: {}", t.role.label(), t.content),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // =============================
    // Criterion & feedback
    // =============================

    pub fn success_criterion(&self) -> Option<&str> {
        self.success_criterion.as_deref()
    }

    pub(crate) fn set_success_criterion(&mut self, criterion: Option<String>) {
        self.success_criterion = criterion.filter(|c| !c.trim().is_empty());
    }

    pub fn feedback(&self) -> &str {
        &self.feedback
    }

    pub(crate) fn set_feedback(&mut self, feedback: impl Into<String>) {
        self.feedback = feedback.into();
        self.updated_at = Utc::now();
    }

    pub(crate) fn clear_feedback(&mut self) {
        self.feedback.clear();
    }

    // =============================
    // Status
    // =============================

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn pending(&self) -> Option<&PendingPlan> {
        self.pending.as_ref()
    }

    pub(crate) fn set_pending(&mut self, pending: Option<PendingPlan>) {
        self.pending = pending;
    }

    pub(crate) fn take_pending(&mut self) -> Option<PendingPlan> {
        self.pending.take()
    }

    // =============================
    // Shared context (insert/overwrite only)
    // =============================

    pub fn shared_context(&self) -> &BTreeMap<String, Value> {
        &self.shared_context
    }

    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.shared_context.get(key)
    }

    pub(crate) fn merge_context(&mut self, updates: BTreeMap<String, Value>) {
        if updates.is_empty() {
            return;
        }
        self.shared_context.extend(updates);
        self.updated_at = Utc::now();
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

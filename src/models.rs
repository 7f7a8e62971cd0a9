//! Core data models for the advisor orchestrator

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//
// ================= Handlers =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HandlerId {
    PortfolioArchitect,
    InvestmentResearch,
    RiskAnalytics,
    TaxOptimization,
    TransitionPlanning,
    ReportingCommunication,
    AccountOperations,
    Dispatcher,
}

/// Pipeline position used to order handlers selected together.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Gathering,
    Synthesis,
    Reporting,
}

/// Fixed tie-break order within a stage
const PRIORITY: &[HandlerId] = &[
    HandlerId::InvestmentResearch,
    HandlerId::AccountOperations,
    HandlerId::PortfolioArchitect,
    HandlerId::RiskAnalytics,
    HandlerId::TaxOptimization,
    HandlerId::TransitionPlanning,
    HandlerId::ReportingCommunication,
    HandlerId::Dispatcher,
];

impl HandlerId {
    pub const SPECIALISTS: [HandlerId; 7] = [
        HandlerId::PortfolioArchitect,
        HandlerId::InvestmentResearch,
        HandlerId::RiskAnalytics,
        HandlerId::TaxOptimization,
        HandlerId::TransitionPlanning,
        HandlerId::ReportingCommunication,
        HandlerId::AccountOperations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerId::PortfolioArchitect => "portfolio_architect",
            HandlerId::InvestmentResearch => "investment_research",
            HandlerId::RiskAnalytics => "risk_analytics",
            HandlerId::TaxOptimization => "tax_optimization",
            HandlerId::TransitionPlanning => "transition_planning",
            HandlerId::ReportingCommunication => "reporting_communication",
            HandlerId::AccountOperations => "account_operations",
            HandlerId::Dispatcher => "dispatcher",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            HandlerId::PortfolioArchitect => "Portfolio Architect",
            HandlerId::InvestmentResearch => "Investment Research",
            HandlerId::RiskAnalytics => "Risk Analytics",
            HandlerId::TaxOptimization => "Tax Optimization",
            HandlerId::TransitionPlanning => "Transition Planning",
            HandlerId::ReportingCommunication => "Reporting & Communication",
            HandlerId::AccountOperations => "Account Operations",
            HandlerId::Dispatcher => "Dispatcher",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            HandlerId::InvestmentResearch | HandlerId::AccountOperations => Stage::Gathering,
            HandlerId::ReportingCommunication => Stage::Reporting,
            _ => Stage::Synthesis,
        }
    }

    /// Position in the fixed priority list (lower runs first)
    pub fn priority(&self) -> usize {
        PRIORITY
            .iter()
            .position(|id| id == self)
            .unwrap_or(PRIORITY.len())
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HandlerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-', '&'], "_");
        let normalized = normalized.trim_end_matches("_agent");

        let id = match normalized {
            "portfolio_architect" => HandlerId::PortfolioArchitect,
            "investment_research" => HandlerId::InvestmentResearch,
            "risk_analytics" => HandlerId::RiskAnalytics,
            "tax_optimization" => HandlerId::TaxOptimization,
            "transition_planning" => HandlerId::TransitionPlanning,
            "reporting_communication" | "reporting___communication" | "reporting" => {
                HandlerId::ReportingCommunication
            }
            "account_operations" => HandlerId::AccountOperations,
            "dispatcher" | "orchestrator" => HandlerId::Dispatcher,
            other => return Err(format!("unknown handler '{}'", other)),
        };

        Ok(id)
    }
}

//
// ================= Tools =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    ReadOnly,
    Mutating,
}

/// A tool invocation requested by a handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub call_id: Uuid,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownTool,
    SchemaViolation,
    Execution,
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::UnknownTool => "UnknownTool",
            FailureKind::SchemaViolation => "SchemaViolation",
            FailureKind::Execution => "Execution",
            FailureKind::Timeout => "Timeout",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ToolResult {
    Success(Value),
    Failure(ToolFailure),
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success(_))
    }

    pub fn failure(&self) -> Option<&ToolFailure> {
        match self {
            ToolResult::Failure(failure) => Some(failure),
            ToolResult::Success(_) => None,
        }
    }
}

//
// ================= Routing =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub handler: HandlerId,
    pub sub_task: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingDecision {
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl RoutingDecision {
    pub fn sequential(assignments: Vec<Assignment>) -> Self {
        Self {
            assignments,
            mode: ExecutionMode::Sequential,
        }
    }

    pub fn single(handler: HandlerId, sub_task: impl Into<String>) -> Self {
        Self::sequential(vec![Assignment {
            handler,
            sub_task: sub_task.into(),
        }])
    }

    pub fn handlers(&self) -> Vec<HandlerId> {
        self.assignments.iter().map(|a| a.handler).collect()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

//
// ================= Drafts & Outcomes =================
//

/// Candidate answer for the current task
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Draft {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Applied to the session's shared context once the draft is formed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_updates: BTreeMap<String, Value>,
    /// Set only by the dispatcher: a plan instead of an answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<RoutingDecision>,
}

impl Draft {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn from_plan(plan: RoutingDecision) -> Self {
        let summary = plan
            .assignments
            .iter()
            .map(|a| format!("{}: {}", a.handler, a.sub_task))
            .collect::<Vec<_>>()
            .join("; ");

        Self {
            content: format!("Plan: {}", summary),
            plan: Some(plan),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    DraftReady(Draft),
    NeedsMoreWork(Vec<ToolCall>),
    NeedsHumanInput(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(String),
    /// The judge cannot decide without more input from the caller
    NeedsInput(String),
}

//
// ================= Caller-facing result =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contribution {
    pub handler: HandlerId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalResult {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub contributions: Vec<Contribution>,
}

impl FinalResult {
    pub fn from_contributions(contributions: Vec<Contribution>) -> Self {
        match contributions.as_slice() {
            [only] => Self {
                content: only.content.clone(),
                payload: only.payload.clone(),
                contributions,
            },
            _ => {
                let content = contributions
                    .iter()
                    .map(|c| format!("## {}\n\n{}", c.handler.display_name(), c.content))
                    .collect::<Vec<_>>()
                    .join("\n\n");

                let payloads: serde_json::Map<String, Value> = contributions
                    .iter()
                    .filter_map(|c| {
                        c.payload
                            .as_ref()
                            .map(|p| (c.handler.as_str().to_string(), p.clone()))
                    })
                    .collect();

                Self {
                    content,
                    payload: (!payloads.is_empty()).then(|| Value::Object(payloads)),
                    contributions,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    MaxIterationsExceeded,
    HandlerFailure,
    /// The evaluator could not produce a verdict
    EvaluationError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitResponse {
    Accepted {
        result: FinalResult,
    },
    NeedsInput {
        question: String,
    },
    Failed {
        cause: FailureCause,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_feedback: Option<String>,
    },
}

impl SubmitResponse {
    pub fn status(&self) -> &'static str {
        match self {
            SubmitResponse::Accepted { .. } => "accepted",
            SubmitResponse::NeedsInput { .. } => "needs_input",
            SubmitResponse::Failed { .. } => "failed",
        }
    }
}

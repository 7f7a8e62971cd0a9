//! Dispatcher handler
//!
//! Handles requests too broad for keyword routing by asking the oracle for
//! a plan over the specialists. Its draft carries the plan, which the
//! orchestrator substitutes for the current routing decision.

use super::{Handler, PROFILES};
use crate::models::{
    Assignment, Draft, ExecutionMode, HandlerId, HandlerOutcome, RoutingDecision,
};
use crate::oracle::{Proposal, ReasoningOracle};
use crate::session::Session;
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DISPATCHER_KEYWORDS: &[&str] = &[
    "comprehensive",
    "end-to-end",
    "end to end",
    "full review",
    "holistic",
    "coordinat*",
    "onboard*",
];

const PLAN_FORMAT: &str = r#"Break the request into sub-tasks, one per specialist, in the order they should run.
Answer with payload {"plan": [{"handler": "<specialist id>", "sub_task": "<sub-task>"}], "mode": "sequential" | "parallel"}.
Use "parallel" only when no sub-task depends on another."#;

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    plan: Vec<RawAssignment>,
    #[serde(default)]
    mode: ExecutionMode,
}

#[derive(Debug, Deserialize)]
struct RawAssignment {
    handler: String,
    sub_task: String,
}

pub struct DispatcherHandler {
    oracle: Arc<dyn ReasoningOracle>,
}

impl DispatcherHandler {
    pub fn new(oracle: Arc<dyn ReasoningOracle>) -> Self {
        Self { oracle }
    }

    fn build_prompt(&self, sub_task: &str, session: &Session) -> String {
        let mut prompt = String::from(
            "You are the Dispatcher of a team of financial specialists. You do not answer requests yourself; you plan which specialists handle them.\n\nSpecialists:\n",
        );

        for profile in PROFILES {
            prompt.push_str(&format!(
                "- {} ({}): {}\n",
                profile.id.as_str(),
                profile.name,
                profile.description
            ));
        }

        if session.turn_count() > 0 {
            prompt.push_str(&format!(
                "\nConversation so far:\n{}\n",
                session.format_conversation()
            ));
        }

        if !session.feedback().is_empty() {
            prompt.push_str(&format!(
                "\nYour previous plan was rejected:\n{}\n",
                session.feedback()
            ));
        }

        prompt.push_str(&format!("\nRequest:\n{}\n\n{}", sub_task, PLAN_FORMAT));
        prompt
    }
}

/// Read a plan from a payload, falling back to JSON embedded in the content
fn extract_plan(content: &str, payload: Option<Value>) -> Option<RoutingDecision> {
    let raw: RawPlan = match payload {
        Some(value) => serde_json::from_value(value).ok()?,
        None => serde_json::from_str(content.trim()).ok()?,
    };

    let assignments: Vec<Assignment> = raw
        .plan
        .into_iter()
        .filter_map(|a| match a.handler.parse::<HandlerId>() {
            Ok(HandlerId::Dispatcher) => None,
            Ok(handler) => Some(Assignment {
                handler,
                sub_task: a.sub_task,
            }),
            Err(e) => {
                warn!("Dropping plan entry: {}", e);
                None
            }
        })
        .collect();

    Some(RoutingDecision {
        assignments,
        mode: raw.mode,
    })
}

#[async_trait]
impl Handler for DispatcherHandler {
    fn id(&self) -> HandlerId {
        HandlerId::Dispatcher
    }

    fn capabilities(&self) -> Vec<String> {
        DISPATCHER_KEYWORDS.iter().map(|k| k.to_string()).collect()
    }

    async fn handle(&self, sub_task: &str, session: &Session) -> Result<HandlerOutcome> {
        let prompt = self.build_prompt(sub_task, session);

        let outcome = match self.oracle.propose(&prompt, &[]).await? {
            Proposal::Answer { content, payload } => match extract_plan(&content, payload) {
                Some(plan) if !plan.is_empty() => {
                    debug!(handlers = ?plan.handlers(), "Dispatcher produced plan");
                    HandlerOutcome::DraftReady(Draft::from_plan(plan))
                }
                _ => HandlerOutcome::NeedsHumanInput(format!(
                    "Which parts of this request should be covered: {}?",
                    sub_task
                )),
            },
            Proposal::ToolCalls(_) => {
                HandlerOutcome::Failed("dispatcher does not call tools".to_string())
            }
            Proposal::Clarify(question) => HandlerOutcome::NeedsHumanInput(question),
            Proposal::Decline(reason) => HandlerOutcome::Failed(reason),
        };

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;
    use serde_json::json;

    #[tokio::test]
    async fn test_plan_payload_becomes_plan_draft() {
        let oracle = Arc::new(ScriptedOracle::new().script(
            "Dispatcher",
            vec![Proposal::answer_with(
                "plan",
                json!({
                    "plan": [
                        {"handler": "account_operations", "sub_task": "open the account"},
                        {"handler": "Portfolio Architect Agent", "sub_task": "propose allocation"},
                        {"handler": "dispatcher", "sub_task": "loop"},
                        {"handler": "astrology", "sub_task": "stars"}
                    ],
                    "mode": "sequential"
                }),
            )],
        ));
        let handler = DispatcherHandler::new(oracle);

        let outcome = handler
            .handle("onboard client 42 end to end", &Session::new("c"))
            .await
            .unwrap();

        let HandlerOutcome::DraftReady(draft) = outcome else {
            panic!("expected plan draft");
        };
        let plan = draft.plan.expect("plan attached");
        assert_eq!(
            plan.handlers(),
            vec![HandlerId::AccountOperations, HandlerId::PortfolioArchitect]
        );
    }

    #[tokio::test]
    async fn test_empty_plan_asks_for_input() {
        let oracle = Arc::new(ScriptedOracle::new().script(
            "Dispatcher",
            vec![Proposal::answer_with("plan", json!({"plan": []}))],
        ));
        let handler = DispatcherHandler::new(oracle);

        let outcome = handler.handle("holistic review", &Session::new("c")).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::NeedsHumanInput(_)));
    }

    #[test]
    fn test_plan_can_be_read_from_content() {
        let plan = extract_plan(
            r#"{"plan": [{"handler": "risk_analytics", "sub_task": "stress test"}], "mode": "parallel"}"#,
            None,
        )
        .unwrap();
        assert_eq!(plan.mode, ExecutionMode::Parallel);
        assert_eq!(plan.handlers(), vec![HandlerId::RiskAnalytics]);
    }
}

//! End-to-end orchestration scenarios against the public API

use advisor_orchestrator::checkpoint::InMemoryCheckpointStore;
use advisor_orchestrator::error::{OrchestrationError, ToolError};
use advisor_orchestrator::evaluator::{create_default_evaluator, Evaluator, OracleEvaluator};
use advisor_orchestrator::handlers::create_default_handlers;
use advisor_orchestrator::oracle::{Judgment, Proposal, ScriptedOracle};
use advisor_orchestrator::tools::{create_registry, FieldType, ToolRegistry, ToolSchema};
use advisor_orchestrator::{
    Draft, FailureCause, FailureKind, HandlerId, Orchestrator, OrchestratorConfig, Result, Session,
    SessionStatus, SideEffect, SubmitResponse, TurnRole, Verdict,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ARCHITECT: &str = "You are the Portfolio Architect Agent";
const RISK: &str = "You are the Risk Analytics Agent";
const REPORTING: &str = "You are the Reporting & Communication Agent";
const RESEARCH: &str = "You are the Investment Research Agent";
const ACCOUNTS: &str = "You are the Account Operations Agent";
const DISPATCHER: &str = "You are the Dispatcher";

fn build(
    oracle: Arc<ScriptedOracle>,
    tools: ToolRegistry,
    evaluator: Box<dyn Evaluator>,
) -> Orchestrator {
    let handlers = create_default_handlers(oracle, &tools);
    Orchestrator::new(
        handlers,
        Arc::new(tools),
        evaluator,
        Box::new(InMemoryCheckpointStore::new()),
    )
}

fn orchestrator(oracle: Arc<ScriptedOracle>) -> Orchestrator {
    build(
        oracle,
        create_registry(None, Duration::from_secs(1)),
        Box::new(create_default_evaluator()),
    )
}

/// Rejects every draft and counts how often it was asked
struct AlwaysReject {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Evaluator for AlwaysReject {
    async fn judge(&self, _criterion: &str, _draft: &Draft, _session: &Session) -> Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Verdict::Rejected("not detailed enough".to_string()))
    }
}

/// Fails every judgment the way a malformed model reply would
struct BrokenJudge;

#[async_trait]
impl Evaluator for BrokenJudge {
    async fn judge(&self, _criterion: &str, _draft: &Draft, _session: &Session) -> Result<Verdict> {
        Err(OrchestrationError::OracleError(
            "Failed to parse Gemini judgment".to_string(),
        ))
    }
}

fn roles(session: &Session) -> Vec<TurnRole> {
    session.turns().iter().map(|t| t.role).collect()
}

#[tokio::test]
async fn test_single_handler_accepted_first_pass() {
    let oracle = Arc::new(ScriptedOracle::new().script(
        ARCHITECT,
        vec![
            Proposal::call("get_client_profile", json!({"client_id": "42"})),
            Proposal::answer_with(
                "Moderate 60/40 allocation",
                json!({"equity": 0.6, "bonds": 0.4}),
            ),
        ],
    ));
    let orchestrator = orchestrator(oracle.clone());

    let response = tokio_test::assert_ok!(
        orchestrator
            .submit("conv-a", "Construct a portfolio for client 42", None)
            .await
    );

    let SubmitResponse::Accepted { result } = response else {
        panic!("expected acceptance, got {:?}", response);
    };
    assert_eq!(result.content, "Moderate 60/40 allocation");
    assert_eq!(result.payload, Some(json!({"equity": 0.6, "bonds": 0.4})));

    let session = orchestrator.session("conv-a").await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::Accepted);
    assert_eq!(
        roles(&session),
        vec![TurnRole::User, TurnRole::Tool, TurnRole::Assistant]
    );
    assert_eq!(session.context_value("client_id"), Some(&json!("42")));
    assert_eq!(
        session.context_value("portfolio_architect"),
        Some(&json!({"equity": 0.6, "bonds": 0.4}))
    );
    assert!(session.pending().is_none());
}

#[tokio::test]
async fn test_rejected_draft_is_retried_with_feedback() {
    let oracle = Arc::new(ScriptedOracle::new().script(
        ARCHITECT,
        vec![
            Proposal::answer("Recommended allocation: 60% equities, 40% bonds."),
            Proposal::answer(
                "Recommended allocation: 60% equities, 40% bonds. 1-day 95% VaR: 1.8%.",
            ),
        ],
    ));
    let orchestrator = orchestrator(oracle.clone());

    let response = orchestrator
        .submit(
            "conv-b",
            "Construct a portfolio for client 42",
            Some("must include a VaR figure"),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), "accepted");

    let prompts = oracle.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("rejected because the success criteria was not met"));
    assert!(prompts[1].contains("rejected because the success criteria was not met"));
    assert!(prompts[1].to_lowercase().contains("missing var"));

    let session = orchestrator.session("conv-b").await.unwrap().unwrap();
    assert!(session
        .turns()
        .iter()
        .any(|t| t.role == TurnRole::System && t.content.starts_with("Evaluator feedback:")));
    assert_eq!(session.feedback(), "");
}

#[tokio::test]
async fn test_unroutable_task_asks_for_clarification() {
    let oracle = Arc::new(ScriptedOracle::new());
    let orchestrator = orchestrator(oracle.clone());

    let response = orchestrator
        .submit("conv-c", "do something vague", None)
        .await
        .unwrap();

    let SubmitResponse::NeedsInput { question } = response else {
        panic!("expected a question, got {:?}", response);
    };
    assert!(question.starts_with("Please clarify"));
    assert!(oracle.prompts().is_empty());

    let session = orchestrator.session("conv-c").await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::NeedsInput);
    assert_eq!(roles(&session), vec![TurnRole::User, TurnRole::System]);
}

#[tokio::test]
async fn test_tool_timeouts_end_in_handler_failure() {
    let oracle = Arc::new(ScriptedOracle::new().script(
        ARCHITECT,
        vec![
            Proposal::call("get_portfolio_data", json!({"portfolio_id": "P-1"})),
            Proposal::call("get_portfolio_data", json!({"portfolio_id": "P-1"})),
            Proposal::Decline("data unavailable".to_string()),
        ],
    ));

    let mut tools = create_registry(None, Duration::from_millis(50));
    tools.register_fn(
        "get_portfolio_data",
        "Portfolio positions",
        ToolSchema::new().required("portfolio_id", FieldType::String, "Portfolio identifier"),
        SideEffect::ReadOnly,
        |_args| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ToolError>(json!({}))
        },
    );

    let orchestrator = build(oracle, tools, Box::new(create_default_evaluator()));
    let response = orchestrator
        .submit("conv-d", "Construct a portfolio for client 42", None)
        .await
        .unwrap();

    match response {
        SubmitResponse::Failed { cause, reason, .. } => {
            assert_eq!(cause, FailureCause::HandlerFailure);
            assert_eq!(reason, "data unavailable");
        }
        other => panic!("expected failure, got {:?}", other),
    }

    let session = orchestrator.session("conv-d").await.unwrap().unwrap();
    let timeouts = session
        .turns()
        .iter()
        .filter_map(|t| t.tool.as_ref())
        .filter(|record| record.result.failure().map(|f| f.kind) == Some(FailureKind::Timeout))
        .count();
    assert_eq!(timeouts, 2);
    assert_eq!(session.status(), SessionStatus::Failed);
}

#[tokio::test]
async fn test_iteration_cap_bounds_evaluation_cycles() {
    let answers = (0..10)
        .map(|i| Proposal::answer(format!("draft {}", i)))
        .collect();
    let oracle = Arc::new(ScriptedOracle::new().script(ARCHITECT, answers));
    let calls = Arc::new(AtomicUsize::new(0));

    let orchestrator = build(
        oracle,
        create_registry(None, Duration::from_secs(1)),
        Box::new(AlwaysReject {
            calls: calls.clone(),
        }),
    )
    .with_config(OrchestratorConfig {
        max_iterations: 3,
        advance_on_handler_failure: true,
    });

    let response = orchestrator
        .submit("conv-cap", "Construct a portfolio", Some("must be thorough"))
        .await
        .unwrap();

    match response {
        SubmitResponse::Failed {
            cause,
            last_feedback,
            ..
        } => {
            assert_eq!(cause, FailureCause::MaxIterationsExceeded);
            assert_eq!(last_feedback.as_deref(), Some("not detailed enough"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shared_context_flows_to_later_handlers() {
    let oracle = Arc::new(
        ScriptedOracle::new()
            .script(
                ARCHITECT,
                vec![
                    Proposal::call("get_client_profile", json!({"client_id": "42"})),
                    Proposal::answer("Shift 5% from equities to bonds"),
                ],
            )
            .script(RISK, vec![Proposal::answer("VaR drops to 1.5%")])
            .script(REPORTING, vec![Proposal::answer("Client summary drafted")]),
    );
    let orchestrator = orchestrator(oracle.clone());

    let response = orchestrator
        .submit(
            "conv-ctx",
            "Write a report for the client, then assess risk and rebalance",
            None,
        )
        .await
        .unwrap();

    let SubmitResponse::Accepted { result } = response else {
        panic!("expected acceptance, got {:?}", response);
    };
    assert_eq!(
        result
            .contributions
            .iter()
            .map(|c| c.handler)
            .collect::<Vec<_>>(),
        vec![
            HandlerId::PortfolioArchitect,
            HandlerId::RiskAnalytics,
            HandlerId::ReportingCommunication
        ]
    );
    assert!(result.content.contains("## Risk Analytics"));

    let prompts = oracle.prompts();
    let risk_prompt = prompts.iter().find(|p| p.starts_with(RISK)).unwrap();
    assert!(risk_prompt.contains("\"client_id\": \"42\""));
    assert!(risk_prompt
        .contains("Assistant (Portfolio Architect): Shift 5% from equities to bonds"));
    assert!(risk_prompt.contains("Your task:\nassess risk"));
}

#[tokio::test]
async fn test_schema_violation_is_recoverable() {
    let oracle = Arc::new(ScriptedOracle::new().script(
        ARCHITECT,
        vec![
            Proposal::call("get_client_profile", json!({"id": 42})),
            Proposal::call("get_client_profile", json!({"client_id": "42"})),
            Proposal::answer("Balanced allocation"),
        ],
    ));
    let orchestrator = orchestrator(oracle.clone());

    let response = orchestrator
        .submit("conv-schema", "Construct a portfolio for client 42", None)
        .await
        .unwrap();
    assert_eq!(response.status(), "accepted");

    let session = orchestrator.session("conv-schema").await.unwrap().unwrap();
    let records: Vec<_> = session.turns().iter().filter_map(|t| t.tool.as_ref()).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[0].result.failure().map(|f| f.kind),
        Some(FailureKind::SchemaViolation)
    );
    assert!(records[1].result.is_success());

    // the failure descriptor was visible to the handler on its next turn
    assert!(oracle.prompts()[1].contains("get_client_profile failed (SchemaViolation)"));
}

#[tokio::test]
async fn test_handler_question_suspends_and_resumes() {
    let oracle = Arc::new(ScriptedOracle::new().script(
        ARCHITECT,
        vec![
            Proposal::Clarify("What is the client's risk tolerance?".to_string()),
            Proposal::answer("Moderate 60/40 allocation"),
        ],
    ));
    let orchestrator = orchestrator(oracle.clone());

    let first = orchestrator
        .submit("conv-resume", "Construct a portfolio for client 42", None)
        .await
        .unwrap();
    assert_eq!(
        first,
        SubmitResponse::NeedsInput {
            question: "What is the client's risk tolerance?".to_string()
        }
    );

    let suspended = orchestrator.session("conv-resume").await.unwrap().unwrap();
    assert_eq!(suspended.status(), SessionStatus::NeedsInput);
    assert!(suspended.pending().is_some());

    let second = orchestrator
        .submit("conv-resume", "Moderate", None)
        .await
        .unwrap();
    assert_eq!(second.status(), "accepted");

    // the answer reached the same handler, not the router
    let prompts = oracle.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("User: Moderate"));
    assert!(prompts[1].contains("Your task:\nConstruct a portfolio for client 42"));
}

#[tokio::test]
async fn test_clarified_task_is_routed_on_resume() {
    let oracle = Arc::new(
        ScriptedOracle::new().script(ARCHITECT, vec![Proposal::answer("Rebalanced to target")]),
    );
    let orchestrator = orchestrator(oracle);

    let first = orchestrator
        .submit("conv-clarify", "help with the Smith household", None)
        .await
        .unwrap();
    assert_eq!(first.status(), "needs_input");

    let second = orchestrator
        .submit("conv-clarify", "please rebalance it", None)
        .await
        .unwrap();
    assert_eq!(second.status(), "accepted");
}

#[tokio::test]
async fn test_parallel_branches_are_logged_in_plan_order() {
    let oracle = Arc::new(
        ScriptedOracle::new()
            .script(
                RESEARCH,
                vec![
                    Proposal::call("get_market_data", json!({"symbols": ["VTI", "BND"]})),
                    Proposal::answer("VTI and BND fit the mandate"),
                ],
            )
            .script(
                ACCOUNTS,
                vec![
                    Proposal::call("get_client_profile", json!({"client_id": "7"})),
                    Proposal::answer("Brokerage account opened"),
                ],
            ),
    );
    let orchestrator = orchestrator(oracle);

    let response = orchestrator
        .submit("conv-par", "research ETFs and open an account for client 7", None)
        .await
        .unwrap();

    let SubmitResponse::Accepted { result } = response else {
        panic!("expected acceptance, got {:?}", response);
    };
    assert_eq!(result.contributions.len(), 2);
    assert_eq!(result.contributions[0].handler, HandlerId::InvestmentResearch);
    assert_eq!(result.contributions[1].handler, HandlerId::AccountOperations);

    let session = orchestrator.session("conv-par").await.unwrap().unwrap();
    let tool_handlers: Vec<_> = session
        .turns()
        .iter()
        .filter(|t| t.role == TurnRole::Tool)
        .map(|t| t.handler)
        .collect();
    assert_eq!(
        tool_handlers,
        vec![
            Some(HandlerId::InvestmentResearch),
            Some(HandlerId::AccountOperations)
        ]
    );
    assert_eq!(session.context_value("client_id"), Some(&json!("7")));
}

#[tokio::test]
async fn test_failed_handler_advances_to_next_assignment() {
    let script = || {
        Arc::new(
            ScriptedOracle::new()
                .script(ARCHITECT, vec![Proposal::Decline("no holdings on file".to_string())])
                .script(RISK, vec![Proposal::answer("Risk is within limits")])
                .script(REPORTING, vec![Proposal::answer("Report ready")]),
        )
    };
    let task = "Write a report for the client, then assess risk and rebalance";

    let lenient = orchestrator(script());
    let response = lenient.submit("conv-adv", task, None).await.unwrap();
    let SubmitResponse::Accepted { result } = response else {
        panic!("expected acceptance, got {:?}", response);
    };
    assert_eq!(result.contributions.len(), 2);

    let session = lenient.session("conv-adv").await.unwrap().unwrap();
    assert!(session
        .turns()
        .iter()
        .any(|t| t.content == "Portfolio Architect failed: no holdings on file"));

    let strict = orchestrator(script()).with_config(OrchestratorConfig {
        advance_on_handler_failure: false,
        ..OrchestratorConfig::default()
    });
    match strict.submit("conv-strict", task, None).await.unwrap() {
        SubmitResponse::Failed { cause, reason, .. } => {
            assert_eq!(cause, FailureCause::HandlerFailure);
            assert_eq!(reason, "no holdings on file");
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dispatcher_plan_is_executed() {
    let oracle = Arc::new(
        ScriptedOracle::new()
            .script(
                DISPATCHER,
                vec![Proposal::answer_with(
                    "plan",
                    json!({
                        "plan": [
                            {"handler": "risk_analytics", "sub_task": "assess concentration risk"},
                            {"handler": "reporting_communication", "sub_task": "summarize for the client"}
                        ],
                        "mode": "sequential"
                    }),
                )],
            )
            .script(RISK, vec![Proposal::answer("Tech exposure is 38%")])
            .script(REPORTING, vec![Proposal::answer("One-page summary")]),
    );
    let orchestrator = orchestrator(oracle.clone());

    let response = orchestrator
        .submit("conv-plan", "Comprehensive review for client 9", None)
        .await
        .unwrap();

    let SubmitResponse::Accepted { result } = response else {
        panic!("expected acceptance, got {:?}", response);
    };
    assert_eq!(
        result
            .contributions
            .iter()
            .map(|c| c.handler)
            .collect::<Vec<_>>(),
        vec![HandlerId::RiskAnalytics, HandlerId::ReportingCommunication]
    );

    let prompts = oracle.prompts();
    assert!(prompts.iter().any(|p| p.contains("Your task:\nassess concentration risk")));
}

#[tokio::test]
async fn test_cancel_checkpoints_partial_progress() {
    let oracle = Arc::new(ScriptedOracle::new().script(
        ARCHITECT,
        vec![Proposal::call("get_portfolio_data", json!({"portfolio_id": "P-1"}))],
    ));

    let mut tools = create_registry(None, Duration::from_secs(30));
    tools.register_fn(
        "get_portfolio_data",
        "Portfolio positions",
        ToolSchema::new().required("portfolio_id", FieldType::String, "Portfolio identifier"),
        SideEffect::ReadOnly,
        |_args| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ToolError>(json!({}))
        },
    );
    let orchestrator = build(oracle, tools, Box::new(create_default_evaluator()));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = orchestrator
        .submit_with_cancel("conv-cancel", "Construct a portfolio", None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        advisor_orchestrator::error::OrchestrationError::Cancelled
    ));

    let session = orchestrator.session("conv-cancel").await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::Running);
    assert_eq!(session.turns()[0].content, "Construct a portfolio");
}

#[tokio::test]
async fn test_submits_on_one_conversation_do_not_interleave() {
    let oracle = Arc::new(ScriptedOracle::new().script(
        ARCHITECT,
        vec![
            Proposal::answer("first allocation"),
            Proposal::answer("second allocation"),
        ],
    ));
    let orchestrator = orchestrator(oracle);

    let (a, b) = tokio::join!(
        orchestrator.submit("conv-lock", "Construct a growth portfolio", None),
        orchestrator.submit("conv-lock", "Construct an income portfolio", None),
    );
    assert_eq!(a.unwrap().status(), "accepted");
    assert_eq!(b.unwrap().status(), "accepted");

    let session = orchestrator.session("conv-lock").await.unwrap().unwrap();
    assert_eq!(
        roles(&session),
        vec![
            TurnRole::User,
            TurnRole::Assistant,
            TurnRole::User,
            TurnRole::Assistant
        ]
    );
}

#[tokio::test]
async fn test_sessions_survive_a_new_orchestrator() {
    let store = InMemoryCheckpointStore::new();
    let tools = || create_registry(None, Duration::from_secs(1));

    let oracle = Arc::new(ScriptedOracle::new().script(
        ARCHITECT,
        vec![Proposal::Clarify("Which account should be used?".to_string())],
    ));
    let registry = tools();
    let first = Orchestrator::new(
        create_default_handlers(oracle, &registry),
        Arc::new(registry),
        Box::new(create_default_evaluator()),
        Box::new(store.clone()),
    );
    let response = first
        .submit("conv-restart", "Construct a portfolio", None)
        .await
        .unwrap();
    assert_eq!(response.status(), "needs_input");
    drop(first);

    let oracle = Arc::new(
        ScriptedOracle::new().script(ARCHITECT, vec![Proposal::answer("Use the IRA")]),
    );
    let registry = tools();
    let second = Orchestrator::new(
        create_default_handlers(oracle, &registry),
        Arc::new(registry),
        Box::new(create_default_evaluator()),
        Box::new(store),
    );
    let response = second
        .submit("conv-restart", "The IRA", None)
        .await
        .unwrap();
    assert_eq!(response.status(), "accepted");

    let session = second.session("conv-restart").await.unwrap().unwrap();
    assert_eq!(session.turns().len(), 4);
}

#[tokio::test]
async fn test_evaluator_error_surfaces_as_failure() {
    let oracle = Arc::new(ScriptedOracle::new().script(
        ARCHITECT,
        vec![Proposal::answer("Recommended allocation: 60% equities, 40% bonds.")],
    ));
    let orchestrator = build(
        oracle,
        create_registry(None, Duration::from_secs(1)),
        Box::new(BrokenJudge),
    );

    let response = tokio_test::assert_ok!(
        orchestrator
            .submit(
                "conv-judge",
                "Construct a portfolio for client 42",
                Some("must include a VaR figure"),
            )
            .await
    );

    let SubmitResponse::Failed { cause, reason, .. } = response else {
        panic!("expected failure, got {:?}", response);
    };
    assert_eq!(cause, FailureCause::EvaluationError);
    assert!(reason.contains("Failed to parse Gemini judgment"));

    let session = orchestrator.session("conv-judge").await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::Failed);
    assert!(session.pending().is_none());
}

#[tokio::test]
async fn test_evaluator_question_suspends_and_resumes() {
    let oracle = Arc::new(
        ScriptedOracle::new()
            .script(
                ARCHITECT,
                vec![
                    Proposal::answer("Recommended allocation: 60% equities, 40% bonds."),
                    Proposal::answer(
                        "Recommended allocation: 60% equities, 40% bonds. \
                         1-day 95% VaR against the S&P 500: 1.8%.",
                    ),
                ],
            )
            .judgments(vec![Judgment {
                feedback: "Which benchmark should VaR use?".to_string(),
                success_criteria_met: false,
                user_input_needed: true,
            }]),
    );
    let orchestrator = build(
        oracle.clone(),
        create_registry(None, Duration::from_secs(1)),
        Box::new(OracleEvaluator::new(oracle.clone())),
    );

    let response = orchestrator
        .submit(
            "conv-bench",
            "Construct a portfolio for client 42",
            Some("must include a VaR figure"),
        )
        .await
        .unwrap();

    let SubmitResponse::NeedsInput { question } = response else {
        panic!("expected a question, got {:?}", response);
    };
    assert_eq!(question, "Which benchmark should VaR use?");

    let session = orchestrator.session("conv-bench").await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::NeedsInput);
    let pending = session.pending().expect("suspended plan");
    assert_eq!(pending.position, 0);

    let response = orchestrator
        .submit("conv-bench", "Use the S&P 500", None)
        .await
        .unwrap();
    assert_eq!(response.status(), "accepted");

    let architect_prompts: Vec<String> = oracle
        .prompts()
        .into_iter()
        .filter(|p| p.contains(ARCHITECT))
        .collect();
    assert_eq!(architect_prompts.len(), 2);
    assert!(architect_prompts[1].contains("Use the S&P 500"));

    let session = orchestrator.session("conv-bench").await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::Accepted);
    assert_eq!(session.success_criterion(), Some("must include a VaR figure"));
}

use advisor_orchestrator::{
    agent::Orchestrator,
    checkpoint::InMemoryCheckpointStore,
    evaluator::create_default_evaluator,
    handlers::create_default_handlers,
    oracle::{Proposal, ScriptedOracle},
    tools::create_registry,
    SubmitResponse,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Offline walk-through: one request, one rejected draft, one accepted draft
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    info!("Advisor Orchestrator starting (offline demo)");

    let oracle = ScriptedOracle::new().script(
        "You are the Portfolio Architect Agent",
        vec![
            Proposal::call("get_client_profile", json!({"client_id": "42"})),
            Proposal::answer("Recommended allocation: 60% equities, 35% bonds, 5% cash."),
            Proposal::answer_with(
                "Recommended allocation: 60% equities, 35% bonds, 5% cash. 1-day 95% VaR: 1.8%.",
                json!({"equities": 0.60, "bonds": 0.35, "cash": 0.05, "var_95_1d": 0.018}),
            ),
        ],
    );

    // Create components
    let tools = create_registry(None, Duration::from_secs(5));
    let handlers = create_default_handlers(Arc::new(oracle), &tools);
    let orchestrator = Orchestrator::new(
        handlers,
        Arc::new(tools),
        Box::new(create_default_evaluator()),
        Box::new(InMemoryCheckpointStore::new()),
    );

    let conversation_id = "demo-conversation";
    let task = "Construct a portfolio for client 42";
    let criterion = "must include a VaR figure";

    info!(%task, %criterion, "Running orchestrator");

    let response = orchestrator
        .submit(conversation_id, task, Some(criterion))
        .await?;

    println!("\n=== SUBMIT RESULT ===");
    match &response {
        SubmitResponse::Accepted { result } => {
            println!("Status: accepted");
            println!("{}", result.content);
            if let Some(payload) = &result.payload {
                println!("Payload: {}", payload);
            }
        }
        SubmitResponse::NeedsInput { question } => {
            println!("Status: needs input");
            println!("Question: {}", question);
        }
        SubmitResponse::Failed {
            cause,
            reason,
            last_feedback,
        } => {
            println!("Status: failed ({:?})", cause);
            println!("Reason: {}", reason);
            if let Some(feedback) = last_feedback {
                println!("Last feedback: {}", feedback);
            }
        }
    }

    if let Some(session) = orchestrator.session(conversation_id).await? {
        println!("\nTurn log:");
        for (i, turn) in session.turns().iter().enumerate() {
            println!("  {}: [{}] {}", i + 1, turn.role.label(), turn.content);
        }
    }

    Ok(())
}

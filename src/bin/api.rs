use advisor_orchestrator::{
    agent::Orchestrator,
    api::start_server,
    checkpoint::{CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore},
    config::AppConfig,
    evaluator::{create_default_evaluator, Evaluator, OracleEvaluator},
    handlers::create_default_handlers,
    oracle::{GeminiOracle, ReasoningOracle},
    tools::{create_registry, FinancialApiClient},
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load .env + environment
    let config = AppConfig::from_env();

    let gemini_api_key = config.gemini_api_key.clone().unwrap_or_else(|| {
        warn!("GEMINI_API_KEY not set; oracle calls will fail until it is configured");
        String::new()
    });

    info!("Advisor Orchestrator - API Server");
    info!("Port: {}", config.port);
    info!("Model: {}", config.gemini_model);

    // Create components
    let oracle: Arc<dyn ReasoningOracle> =
        Arc::new(GeminiOracle::new(gemini_api_key, &config.gemini_model)?);

    let api = config.financial_api_url.as_deref().and_then(FinancialApiClient::new);
    if api.is_none() {
        warn!("No financial data service configured; tools answer offline");
    }
    let tools = create_registry(api, config.tool_timeout);
    let handlers = create_default_handlers(oracle.clone(), &tools);

    let evaluator: Box<dyn Evaluator> = if config.gemini_api_key.is_some() {
        Box::new(OracleEvaluator::new(oracle.clone()))
    } else {
        info!("Evaluator: rule-based");
        Box::new(create_default_evaluator())
    };

    let checkpoints: Box<dyn CheckpointStore> = match &config.database_url {
        Some(url) => match PostgresCheckpointStore::connect_lazy(url) {
            Ok(store) => Box::new(store),
            Err(e) => {
                warn!(
                    "Failed to initialize postgres checkpoints, falling back to in-memory: {}",
                    e
                );
                Box::new(InMemoryCheckpointStore::new())
            }
        },
        None => {
            info!("Checkpoint backend: in-memory");
            Box::new(InMemoryCheckpointStore::new())
        }
    };

    // Create orchestrator
    let orchestrator = Arc::new(
        Orchestrator::new(
            handlers,
            Arc::new(tools),
            evaluator,
            checkpoints,
        )
        .with_config(config.orchestrator),
    );

    info!(
        max_iterations = config.orchestrator.max_iterations,
        "Orchestrator initialized"
    );

    // Start API server
    start_server(orchestrator, config.port).await?;

    Ok(())
}

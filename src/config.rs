//! Runtime configuration from `.env` and the process environment

use crate::agent::OrchestratorConfig;
use crate::tools::DEFAULT_TOOL_TIMEOUT;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub database_url: Option<String>,
    pub financial_api_url: Option<String>,
    pub tool_timeout: Duration,
    pub orchestrator: OrchestratorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            database_url: None,
            financial_api_url: None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `.env` (if present) and read the environment
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| lookup(*k))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = Self::default();

        let max_iterations = parse_or(
            "ORCHESTRATOR_MAX_ITERATIONS",
            first(&["ORCHESTRATOR_MAX_ITERATIONS"]),
            defaults.orchestrator.max_iterations,
        );
        let max_iterations = if max_iterations == 0 {
            warn!("ORCHESTRATOR_MAX_ITERATIONS must be positive, using default");
            defaults.orchestrator.max_iterations
        } else {
            max_iterations
        };

        Self {
            port: parse_or("PORT", first(&["PORT", "API_PORT"]), defaults.port),
            gemini_api_key: first(&["GEMINI_API_KEY"]),
            gemini_model: first(&["GEMINI_MODEL"]).unwrap_or(defaults.gemini_model),
            database_url: first(&["POSTGRES_URL", "DATABASE_URL"]),
            financial_api_url: first(&["FINANCIAL_API_BASE_URL", "TOOLS_API_BASE_URL"]),
            tool_timeout: Duration::from_secs(parse_or(
                "TOOL_TIMEOUT_SECS",
                first(&["TOOL_TIMEOUT_SECS"]),
                defaults.tool_timeout.as_secs(),
            )),
            orchestrator: OrchestratorConfig {
                max_iterations,
                advance_on_handler_failure: parse_or(
                    "ORCHESTRATOR_ADVANCE_ON_FAILURE",
                    first(&["ORCHESTRATOR_ADVANCE_ON_FAILURE"]),
                    defaults.orchestrator.advance_on_handler_failure,
                ),
            },
        }
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(
    key: &str,
    raw: Option<String>,
    default: T,
) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid {}='{}', using default {}", key, raw, default);
            default
        }),
    }
}

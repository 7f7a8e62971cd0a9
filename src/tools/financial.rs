//! Advisory tools backed by the financial data service
//!
//! Each tool posts its validated arguments to the data service when
//! `FINANCIAL_API_BASE_URL` is configured. Without a service the tools
//! answer with an offline acknowledgement echoing their input.

use super::{FieldType, Tool, ToolRegistry, ToolSchema};
use crate::error::ToolError;
use crate::models::{FailureKind, SideEffect};
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct FinancialApiClient {
    client: Client,
    base_url: String,
}

impl FinancialApiClient {
    pub fn new(base_url: &str) -> Option<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()
            .ok()?;

        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> std::result::Result<Value, ToolError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Execution
                };
                ToolError::ExecutionError {
                    kind,
                    message: format!("Financial API request failed for {}: {}", path, e),
                }
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| ToolError::execution(format!("Invalid JSON response: {}", e)))?;

        if !status.is_success() {
            return Err(ToolError::execution(format!(
                "Financial API returned {} for {}: {}",
                status, path, body
            )));
        }

        Ok(body)
    }
}

/// A tool whose behaviour is entirely described by its declaration
pub struct AdvisoryTool {
    name: &'static str,
    description: &'static str,
    schema: ToolSchema,
    side_effect: SideEffect,
    api: Option<FinancialApiClient>,
}

#[async_trait::async_trait]
impl Tool for AdvisoryTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn side_effect(&self) -> SideEffect {
        self.side_effect
    }

    async fn execute(&self, args: &Value) -> std::result::Result<Value, ToolError> {
        match &self.api {
            Some(api) => {
                api.post_json(&format!("/api/v1/tools/{}", self.name), args)
                    .await
            }
            None => Ok(json!({
                "tool": self.name,
                "source": "offline",
                "input": args,
                "retrieved_at": Utc::now().to_rfc3339(),
            })),
        }
    }
}

fn declarations() -> Vec<(&'static str, &'static str, ToolSchema, SideEffect)> {
    use FieldType::*;

    vec![
        (
            "get_client_profile",
            "Retrieve comprehensive client profile including demographics, goals, risk profile, and holdings",
            ToolSchema::new().required("client_id", String, "Unique client identifier"),
            SideEffect::ReadOnly,
        ),
        (
            "get_portfolio_data",
            "Retrieve portfolio data including positions, values, and performance metrics",
            ToolSchema::new().required("portfolio_id", String, "Portfolio identifier"),
            SideEffect::ReadOnly,
        ),
        (
            "search_investment_solutions",
            "Search for investment solutions using structured data (performance, risk) and unstructured data (research reports)",
            ToolSchema::new()
                .required("search_criteria", Object, "Search criteria (symbol, sector, type, etc.)")
                .optional("include_unstructured", Boolean, "Include unstructured research data"),
            SideEffect::ReadOnly,
        ),
        (
            "calculate_risk_metrics",
            "Calculate risk metrics (VaR, Sharpe, beta, standard deviation, max drawdown) for a portfolio",
            ToolSchema::new()
                .required("portfolio_id", String, "Portfolio identifier")
                .required(
                    "risk_metrics",
                    Array,
                    "Risk metrics to calculate (VaR, Sharpe, beta, ...)",
                )
                .optional("time_horizon", String, "Time horizon for calculations, default 1Y"),
            SideEffect::ReadOnly,
        ),
        (
            "perform_stress_test",
            "Perform stress testing on portfolio for specific scenarios (2008 crisis, COVID-19, inflation shock, etc.)",
            ToolSchema::new()
                .required("portfolio_id", String, "Portfolio identifier")
                .required("scenario", String, "Scenario name, e.g. 2008_crisis"),
            SideEffect::ReadOnly,
        ),
        (
            "analyze_tax_impact",
            "Analyze tax implications of portfolio changes, tax-loss harvesting opportunities, and asset location optimization",
            ToolSchema::new()
                .required("client_id", String, "Client identifier")
                .optional("portfolio_id", String, "Specific portfolio to analyze")
                .required(
                    "analysis_type",
                    String,
                    "transition, harvesting or location_optimization",
                ),
            SideEffect::ReadOnly,
        ),
        (
            "create_transition_plan",
            "Create step-by-step transition plan from current to target allocation, considering taxes, costs, and timing",
            ToolSchema::new()
                .required("portfolio_id", String, "Source portfolio identifier")
                .required("target_allocation", Object, "Target asset allocation percentages")
                .optional("constraints", Object, "Constraints (tax, timing, etc.)"),
            SideEffect::ReadOnly,
        ),
        (
            "generate_portfolio_report",
            "Generate customized client reports (detailed, executive summary, or one-pager) with performance and recommendations",
            ToolSchema::new()
                .required("client_id", String, "Client identifier")
                .required("report_type", String, "detailed, executive or one_pager")
                .optional("portfolio_ids", Array, "Specific portfolios to include"),
            SideEffect::ReadOnly,
        ),
        (
            "execute_account_operation",
            "Execute account operations: open new accounts, consolidate accounts, transfer assets, execute rollovers",
            ToolSchema::new()
                .required("operation_type", String, "open, consolidate, transfer or rollover")
                .required("client_id", String, "Client identifier")
                .required("account_details", Object, "Account details for the operation"),
            SideEffect::Mutating,
        ),
        (
            "get_market_data",
            "Retrieve market data for securities (prices, performance, risk metrics, fundamentals)",
            ToolSchema::new()
                .required("symbols", Array, "Security symbols")
                .optional("data_type", String, "prices, performance, risk_metrics or fundamentals"),
            SideEffect::ReadOnly,
        ),
        (
            "calculate_portfolio_allocation",
            "Calculate current asset allocation breakdown for a portfolio",
            ToolSchema::new().required("portfolio_id", String, "Portfolio identifier"),
            SideEffect::ReadOnly,
        ),
        (
            "validate_compliance",
            "Validate portfolio compliance with investment policy statements, regulations, and firm policies",
            ToolSchema::new()
                .required("client_id", String, "Client identifier")
                .required("portfolio_id", String, "Portfolio identifier"),
            SideEffect::ReadOnly,
        ),
    ]
}

/// Build the advisory tool set against an optional data service
pub fn create_registry(api: Option<FinancialApiClient>, timeout: Duration) -> ToolRegistry {
    let mut registry = ToolRegistry::new().with_timeout(timeout);

    for (name, description, schema, side_effect) in declarations() {
        registry.register(Arc::new(AdvisoryTool {
            name,
            description,
            schema,
            side_effect,
            api: api.clone(),
        }));
    }

    registry
}

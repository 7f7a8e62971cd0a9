//! Domain specialists
//!
//! One generic handler parameterised by a static profile. The oracle
//! decides between answering, calling tools, asking the advisor or giving
//! up; the handler only shapes the prompt and translates the proposal.

use super::Handler;
use crate::evaluator::DEFAULT_CRITERION;
use crate::models::{Draft, HandlerId, HandlerOutcome, ToolCall, ToolResult};
use crate::oracle::{Proposal, ReasoningOracle};
use crate::session::Session;
use crate::tools::{ToolDescriptor, ToolRegistry};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Identifier fields promoted into the shared context once resolved
const IDENTIFIER_KEYS: &[&str] = &["client_id", "portfolio_id", "account_id"];

pub struct SpecialistProfile {
    pub id: HandlerId,
    pub name: &'static str,
    pub role: &'static str,
    pub description: &'static str,
    pub focus: &'static [&'static str],
    /// Word matches; a trailing `*` matches any word starting with the stem
    pub keywords: &'static [&'static str],
    pub tools: &'static [&'static str],
}

pub const PROFILES: &[SpecialistProfile] = &[
    SpecialistProfile {
        id: HandlerId::PortfolioArchitect,
        name: "Portfolio Architect Agent",
        role: "Intelligent portfolio construction and optimization",
        description: "analyzing client risk profiles, recommending optimal asset allocation, performing rebalancing calculations, and validating compliance",
        focus: &[
            "Analyze client risk profiles and investment objectives",
            "Recommend asset allocation strategies based on Modern Portfolio Theory",
            "Perform portfolio rebalancing calculations",
            "Validate compliance with investment mandates",
            "Generate multiple portfolio scenarios for comparison",
        ],
        keywords: &[
            "construct*",
            "allocat*",
            "rebalanc*",
            "diversif*",
            "asset mix",
            "model portfolio",
            "build a portfolio",
            "optimi*",
        ],
        tools: &[
            "get_client_profile",
            "get_portfolio_data",
            "calculate_portfolio_allocation",
            "get_market_data",
            "validate_compliance",
        ],
    },
    SpecialistProfile {
        id: HandlerId::InvestmentResearch,
        name: "Investment Research Agent",
        role: "Investment solution discovery and analysis",
        description: "searching structured and unstructured data to find and analyze investment solutions",
        focus: &[
            "Search performance metrics, risk factors and expense ratios",
            "Analyze research reports and fund manager commentary",
            "Compare investment vehicles side by side",
            "Track emerging investment opportunities",
        ],
        keywords: &[
            "research*",
            "fund",
            "funds",
            "etf*",
            "securit*",
            "investment option*",
            "compare",
            "screen*",
            "due diligence",
            "opportunit*",
        ],
        tools: &["search_investment_solutions", "get_market_data"],
    },
    SpecialistProfile {
        id: HandlerId::RiskAnalytics,
        name: "Risk Analytics Agent",
        role: "Portfolio risk assessment and stress testing",
        description: "performing scenario analysis, calculating risk metrics, and identifying concentration risks",
        focus: &[
            "Perform scenario analysis and stress testing",
            "Calculate VaR, Sharpe ratio, beta, standard deviation and max drawdown",
            "Identify concentration risks and correlation exposures",
            "Flag portfolio drift early",
        ],
        keywords: &[
            "risk*",
            "var",
            "value at risk",
            "stress*",
            "drawdown*",
            "volatil*",
            "sharpe",
            "beta",
            "concentration",
            "scenario*",
        ],
        tools: &[
            "get_portfolio_data",
            "calculate_risk_metrics",
            "perform_stress_test",
            "get_market_data",
        ],
    },
    SpecialistProfile {
        id: HandlerId::TaxOptimization,
        name: "Tax Optimization Agent",
        role: "Tax-efficient investment strategies",
        description: "analyzing tax impact, identifying tax-loss harvesting opportunities, and optimizing asset location",
        focus: &[
            "Analyze the tax impact of portfolio transitions",
            "Identify tax-loss harvesting opportunities",
            "Optimize asset location across taxable and tax-deferred accounts",
            "Respect wash-sale rules",
        ],
        keywords: &["tax*", "harvest*", "capital gain*", "wash sale", "asset location"],
        tools: &["analyze_tax_impact", "get_portfolio_data", "get_client_profile"],
    },
    SpecialistProfile {
        id: HandlerId::TransitionPlanning,
        name: "Transition Planning Agent",
        role: "Portfolio transition execution strategy",
        description: "creating step-by-step transition roadmaps and sequencing trades to minimize impact",
        focus: &[
            "Create step-by-step transition roadmaps",
            "Sequence trades to minimize market impact and tax consequences",
            "Estimate transition costs",
            "Coordinate timing across multiple accounts",
        ],
        keywords: &["transition*", "sequenc*", "migrat*", "roadmap*", "trade plan"],
        tools: &["create_transition_plan", "get_portfolio_data", "analyze_tax_impact"],
    },
    SpecialistProfile {
        id: HandlerId::ReportingCommunication,
        name: "Reporting & Communication Agent",
        role: "Client-facing documentation and reports",
        description: "generating customized reports and adapting communication to client sophistication level",
        focus: &[
            "Generate detailed, executive summary and one-pager reports",
            "Produce regulatory and compliance documentation",
            "Adapt language to the client's sophistication",
            "Prepare meeting materials",
        ],
        keywords: &[
            "report*",
            "summar*",
            "present*",
            "document*",
            "meeting*",
            "one-pager",
            "one pager",
            "letter",
        ],
        tools: &["generate_portfolio_report", "get_client_profile", "get_portfolio_data"],
    },
    SpecialistProfile {
        id: HandlerId::AccountOperations,
        name: "Account Operations Agent",
        role: "Account inception and administrative workflows",
        description: "automating account opening, consolidation, and administrative processes",
        focus: &[
            "Open accounts",
            "Consolidate accounts",
            "Manage beneficiary designations and titling",
            "Process transfers and rollovers",
        ],
        keywords: &[
            "account*",
            "rollover*",
            "roll over",
            "consolidat*",
            "beneficiar*",
            "transfer*",
            "titling",
        ],
        tools: &["execute_account_operation", "get_client_profile"],
    },
];

pub struct SpecialistHandler {
    profile: &'static SpecialistProfile,
    oracle: Arc<dyn ReasoningOracle>,
    tools: Vec<ToolDescriptor>,
}

impl SpecialistHandler {
    pub fn new(
        profile: &'static SpecialistProfile,
        oracle: Arc<dyn ReasoningOracle>,
        registry: &ToolRegistry,
    ) -> Self {
        Self {
            profile,
            oracle,
            tools: registry.descriptors(profile.tools),
        }
    }

    fn build_prompt(&self, sub_task: &str, session: &Session) -> String {
        let profile = self.profile;

        let mut prompt = format!(
            "You are the {}, specialized in {}.\n\nYour role: {}\n\nYour specific capabilities:\n",
            profile.name, profile.description, profile.role
        );

        for item in profile.focus {
            prompt.push_str(&format!("- {}\n", item));
        }

        prompt.push_str(&format!(
            "\nAlways provide accurate, compliant, and actionable recommendations.\nCurrent date and time: {}\n\nSuccess criteria:\n{}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            session.success_criterion().unwrap_or(DEFAULT_CRITERION),
        ));

        if !session.feedback().is_empty() {
            prompt.push_str(&format!(
                "\nPreviously you thought you completed the assignment, but your reply was rejected because the success criteria was not met.\nHere is the feedback on why this was rejected:\n{}\nWith this feedback, please continue the assignment, ensuring that you meet the success criteria or have a question for the user.\n",
                session.feedback()
            ));
        }

        if !session.shared_context().is_empty() {
            let context = serde_json::to_string_pretty(session.shared_context())
                .unwrap_or_else(|_| "{}".to_string());
            prompt.push_str(&format!("\nShared context from earlier work:\n{}\n", context));
        }

        if session.turn_count() > 0 {
            prompt.push_str(&format!(
                "\nConversation so far:\n{}\n",
                session.format_conversation()
            ));
        }

        prompt.push_str(&format!("\nYour task:\n{}\n", sub_task));
        prompt
    }

    /// Identifiers this handler resolved through successful tool calls
    fn resolved_identifiers(&self, session: &Session) -> BTreeMap<String, Value> {
        let mut resolved = BTreeMap::new();

        for record in session.tool_records_for(self.profile.id) {
            let ToolResult::Success(output) = &record.result else {
                continue;
            };

            for key in IDENTIFIER_KEYS {
                let value = record
                    .arguments
                    .get(*key)
                    .or_else(|| output.get(*key))
                    .filter(|v| v.is_string() || v.is_number());

                if let Some(value) = value {
                    resolved.insert(key.to_string(), value.clone());
                }
            }
        }

        resolved
    }
}

#[async_trait]
impl Handler for SpecialistHandler {
    fn id(&self) -> HandlerId {
        self.profile.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.profile.keywords.iter().map(|k| k.to_string()).collect()
    }

    async fn handle(&self, sub_task: &str, session: &Session) -> Result<HandlerOutcome> {
        let prompt = self.build_prompt(sub_task, session);
        let proposal = self.oracle.propose(&prompt, &self.tools).await?;

        debug!(handler = %self.profile.id, ?proposal, "Oracle proposal");

        let outcome = match proposal {
            Proposal::Answer { content, payload } => {
                let mut draft = Draft::new(content);
                draft.context_updates = self.resolved_identifiers(session);

                if let Some(payload) = payload {
                    draft = draft
                        .with_context(self.profile.id.as_str(), payload.clone())
                        .with_payload(payload);
                }

                HandlerOutcome::DraftReady(draft)
            }
            Proposal::ToolCalls(requests) => HandlerOutcome::NeedsMoreWork(
                requests
                    .into_iter()
                    .map(|r| ToolCall::new(r.tool_name, r.arguments))
                    .collect(),
            ),
            Proposal::Clarify(question) => HandlerOutcome::NeedsHumanInput(question),
            Proposal::Decline(reason) => HandlerOutcome::Failed(reason),
        };

        Ok(outcome)
    }
}

//! Gemini-backed reasoning oracle
//!
//! Uses a long-lived reqwest::Client for connection pooling and asks the
//! model for JSON-only replies which are parsed into proposals/judgments.

use super::{Judgment, Proposal, ReasoningOracle, ToolCallRequest};
use crate::error::OrchestrationError;
use crate::tools::ToolDescriptor;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const SYSTEM_PROMPT: &str = r#"You are part of a financial consultant platform used by financial advisors.

Guidelines:
- Provide accurate, compliant and actionable information
- Be structured and concise
- Use professional financial language
- Reply with a single JSON object and nothing else"#;

const PROPOSAL_FORMAT: &str = r#"Reply with exactly one JSON object in one of these shapes:
{"action": "answer", "content": "<final answer text>", "payload": <optional structured data>}
{"action": "tool_calls", "calls": [{"tool_name": "<tool>", "arguments": {...}}]}
{"action": "clarify", "question": "<question for the advisor>"}
{"action": "decline", "reason": "<why the task cannot be completed>"}"#;

const JUDGMENT_FORMAT: &str = r#"Reply with exactly one JSON object:
{"feedback": "<feedback on the response>", "success_criteria_met": <bool>, "user_input_needed": <bool>}"#;

/// Reusable Gemini client (connection-pooled)
pub struct GeminiOracle {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl GeminiOracle {
    pub fn new(api_key: String, model: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/{}:generateContent", GEMINI_BASE_URL, model),
        })
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::OracleError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.endpoint, self.api_key);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 2048,
                response_mime_type: "application/json",
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
        };

        info!("Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::OracleError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(OrchestrationError::OracleError(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::OracleError(format!("Gemini parse error: {}", e))
        })?;

        gemini_response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| {
                OrchestrationError::OracleError("Empty response from Gemini".to_string())
            })
    }
}

#[async_trait]
impl ReasoningOracle for GeminiOracle {
    async fn propose(&self, prompt: &str, tools: &[ToolDescriptor]) -> Result<Proposal> {
        let tool_block = if tools.is_empty() {
            "No tools are available; answer, clarify or decline.".to_string()
        } else {
            format!(
                "Available tools (JSON):\n{}",
                serde_json::to_string_pretty(tools)?
            )
        };

        let full_prompt = format!("{}\n\n{}\n\n{}", prompt, tool_block, PROPOSAL_FORMAT);
        let raw = self.generate(&full_prompt).await?;
        parse_proposal(&raw)
    }

    async fn judge(&self, prompt: &str) -> Result<Judgment> {
        let full_prompt = format!("{}\n\n{}", prompt, JUDGMENT_FORMAT);
        let raw = self.generate(&full_prompt).await?;
        parse_judgment(&raw)
    }
}

fn strip_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum RawProposal {
    Answer {
        content: String,
        #[serde(default)]
        payload: Option<Value>,
    },
    ToolCalls {
        calls: Vec<ToolCallRequest>,
    },
    Clarify {
        question: String,
    },
    Decline {
        reason: String,
    },
}

/// Parse a proposal reply from Gemini
pub(crate) fn parse_proposal(response: &str) -> Result<Proposal> {
    let raw: RawProposal = serde_json::from_str(strip_fences(response)).map_err(|e| {
        OrchestrationError::OracleError(format!(
            "Failed to parse Gemini proposal: {} | raw={}",
            e, response
        ))
    })?;

    let proposal = match raw {
        RawProposal::Answer { content, payload } => Proposal::Answer {
            content,
            payload: payload.filter(|p| !p.is_null()),
        },
        RawProposal::ToolCalls { calls } if calls.is_empty() => {
            return Err(OrchestrationError::OracleError(
                "Gemini requested tool_calls with no calls".to_string(),
            ));
        }
        RawProposal::ToolCalls { calls } => Proposal::ToolCalls(calls),
        RawProposal::Clarify { question } => Proposal::Clarify(question),
        RawProposal::Decline { reason } => Proposal::Decline(reason),
    };

    Ok(proposal)
}

/// Parse an evaluator reply from Gemini
pub(crate) fn parse_judgment(response: &str) -> Result<Judgment> {
    serde_json::from_str(strip_fences(response)).map_err(|e| {
        OrchestrationError::OracleError(format!(
            "Failed to parse Gemini judgment: {} | raw={}",
            e, response
        ))
    })
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    response_mime_type: &'static str,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

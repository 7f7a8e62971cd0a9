//! Reasoning oracle
//!
//! The language-model capability handlers and the oracle-backed evaluator
//! call into. The core only sees structured proposals and judgments.

use crate::tools::ToolDescriptor;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

pub mod gemini;
pub use gemini::GeminiOracle;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// What the oracle wants the handler to do next
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    Answer {
        content: String,
        payload: Option<Value>,
    },
    ToolCalls(Vec<ToolCallRequest>),
    Clarify(String),
    Decline(String),
}

impl Proposal {
    pub fn answer(content: impl Into<String>) -> Self {
        Proposal::Answer {
            content: content.into(),
            payload: None,
        }
    }

    pub fn answer_with(content: impl Into<String>, payload: Value) -> Self {
        Proposal::Answer {
            content: content.into(),
            payload: Some(payload),
        }
    }

    pub fn call(tool_name: impl Into<String>, arguments: Value) -> Self {
        Proposal::ToolCalls(vec![ToolCallRequest {
            tool_name: tool_name.into(),
            arguments,
        }])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Judgment {
    pub feedback: String,
    pub success_criteria_met: bool,
    #[serde(default)]
    pub user_input_needed: bool,
}

impl Judgment {
    pub fn accept() -> Self {
        Self {
            feedback: String::new(),
            success_criteria_met: true,
            user_input_needed: false,
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            feedback: feedback.into(),
            success_criteria_met: false,
            user_input_needed: false,
        }
    }
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// Draft an answer or request tool calls
    async fn propose(&self, prompt: &str, tools: &[ToolDescriptor]) -> Result<Proposal>;

    /// Judge a conversation against a success criterion
    async fn judge(&self, prompt: &str) -> Result<Judgment>;
}

/// Oracle replaying canned proposals, for offline runs and tests.
///
/// Scripts are keyed by a marker looked up in the prompt (handler prompts
/// open with the handler's name); the first matching script with entries
/// left supplies the next proposal.
pub struct ScriptedOracle {
    scripts: Mutex<Vec<(String, VecDeque<Proposal>)>>,
    judgments: Mutex<VecDeque<Judgment>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            judgments: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn script(self, marker: impl Into<String>, proposals: Vec<Proposal>) -> Self {
        lock(&self.scripts).push((marker.into(), proposals.into()));
        self
    }

    pub fn judgments(self, judgments: Vec<Judgment>) -> Self {
        lock(&self.judgments).extend(judgments);
        self
    }

    /// Every prompt seen so far, in order
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    async fn propose(&self, prompt: &str, _tools: &[ToolDescriptor]) -> Result<Proposal> {
        lock(&self.prompts).push(prompt.to_string());

        let mut scripts = lock(&self.scripts);
        let next = scripts
            .iter_mut()
            .filter(|(marker, queue)| prompt.contains(marker.as_str()) && !queue.is_empty())
            .find_map(|(_, queue)| queue.pop_front());

        Ok(next.unwrap_or_else(|| Proposal::Decline("no scripted proposal left".to_string())))
    }

    async fn judge(&self, prompt: &str) -> Result<Judgment> {
        lock(&self.prompts).push(prompt.to_string());
        Ok(lock(&self.judgments)
            .pop_front()
            .unwrap_or_else(Judgment::accept))
    }
}

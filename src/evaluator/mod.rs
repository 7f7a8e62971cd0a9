//! Draft evaluation
//!
//! An evaluator judges a draft against the caller's success criterion.
//! It reads the session but never mutates it and never calls tools.
//! Without an explicit criterion every draft is accepted after one pass.

use crate::models::{Draft, Verdict};
use crate::oracle::ReasoningOracle;
use crate::router::normalize;
use crate::session::Session;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Criterion assumed when the caller supplies none
pub const DEFAULT_CRITERION: &str = "The assistant should provide a complete, accurate, and actionable response to the advisor's request, using appropriate specialized agents and tools as needed.";

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Judge a draft against an explicit criterion
    async fn judge(&self, criterion: &str, draft: &Draft, session: &Session) -> Result<Verdict>;

    /// Entry point used by the orchestrator. A missing or blank criterion
    /// accepts without validation.
    async fn evaluate(
        &self,
        criterion: Option<&str>,
        draft: &Draft,
        session: &Session,
    ) -> Result<Verdict> {
        match criterion.map(str::trim).filter(|c| !c.is_empty()) {
            Some(criterion) => self.judge(criterion, draft, session).await,
            None => {
                debug!("No success criterion, accepting draft");
                Ok(Verdict::Accepted)
            }
        }
    }
}

//
// ================= Rule-based evaluator =================
//

pub struct RuleCheck {
    pub passed: bool,
    pub feedback: String,
}

impl RuleCheck {
    pub fn pass() -> Self {
        Self {
            passed: true,
            feedback: String::new(),
        }
    }

    pub fn fail(feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            feedback: feedback.into(),
        }
    }
}

pub trait EvaluationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, criterion: &str, draft: &Draft, session: &Session) -> RuleCheck;
}

/// Deterministic evaluator made of independent rules
pub struct RuleEvaluator {
    rules: Vec<Box<dyn EvaluationRule>>,
}

impl RuleEvaluator {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn EvaluationRule>) {
        self.rules.push(rule);
    }

    pub fn with_rule(mut self, rule: Box<dyn EvaluationRule>) -> Self {
        self.add_rule(rule);
        self
    }
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Evaluator for RuleEvaluator {
    async fn judge(&self, criterion: &str, draft: &Draft, session: &Session) -> Result<Verdict> {
        let failures: Vec<String> = self
            .rules
            .iter()
            .map(|rule| (rule.name(), rule.check(criterion, draft, session)))
            .filter(|(_, check)| !check.passed)
            .map(|(name, check)| {
                debug!(rule = name, feedback = %check.feedback, "Rule failed");
                check.feedback
            })
            .collect();

        info!(
            rule_count = self.rules.len(),
            failed = failures.len(),
            "Evaluation completed"
        );

        if failures.is_empty() {
            Ok(Verdict::Accepted)
        } else {
            Ok(Verdict::Rejected(failures.join("; ")))
        }
    }
}

/// Rule: the draft has content
pub struct NonEmptyDraftRule;

impl EvaluationRule for NonEmptyDraftRule {
    fn name(&self) -> &'static str {
        "non_empty_draft"
    }

    fn check(&self, _criterion: &str, draft: &Draft, _session: &Session) -> RuleCheck {
        if draft.content.trim().is_empty() {
            RuleCheck::fail("draft is empty")
        } else {
            RuleCheck::pass()
        }
    }
}

/// Rule: terms the criterion requires ("must include a VaR figure") appear
pub struct RequiredTermsRule;

const REQUIRE_MARKERS: &[&str] = &[
    "must include ",
    "must mention ",
    "must contain ",
    "must have ",
    "should include ",
    "should mention ",
    "should contain ",
];

impl EvaluationRule for RequiredTermsRule {
    fn name(&self) -> &'static str {
        "required_terms"
    }

    fn check(&self, criterion: &str, draft: &Draft, _session: &Session) -> RuleCheck {
        let text = draft_text(draft);
        let missing: Vec<String> = criterion_terms(criterion, REQUIRE_MARKERS)
            .into_iter()
            .filter(|term| !text.contains(&normalize(term)))
            .collect();

        if missing.is_empty() {
            RuleCheck::pass()
        } else {
            RuleCheck::fail(format!("missing {}", missing.join(", ")))
        }
    }
}

/// Rule: terms the criterion forbids ("must not mention crypto") are absent
pub struct ForbiddenTermsRule;

const FORBID_MARKERS: &[&str] = &[
    "must not include ",
    "must not mention ",
    "must not contain ",
    "should not include ",
    "should not mention ",
    "must avoid ",
    "should avoid ",
];

impl EvaluationRule for ForbiddenTermsRule {
    fn name(&self) -> &'static str {
        "forbidden_terms"
    }

    fn check(&self, criterion: &str, draft: &Draft, _session: &Session) -> RuleCheck {
        let text = draft_text(draft);
        let present: Vec<String> = criterion_terms(criterion, FORBID_MARKERS)
            .into_iter()
            .filter(|term| text.contains(&normalize(term)))
            .collect();

        if present.is_empty() {
            RuleCheck::pass()
        } else {
            RuleCheck::fail(format!("mentions {}", present.join(", ")))
        }
    }
}

/// Evaluator with all built-in rules
pub fn create_default_evaluator() -> RuleEvaluator {
    RuleEvaluator::new()
        .with_rule(Box::new(NonEmptyDraftRule))
        .with_rule(Box::new(RequiredTermsRule))
        .with_rule(Box::new(ForbiddenTermsRule))
}

fn draft_text(draft: &Draft) -> String {
    match &draft.payload {
        Some(payload) => normalize(&format!("{} {}", draft.content, payload)),
        None => normalize(&draft.content),
    }
}

const LEADING_FILLER: &[&str] = &["a", "an", "the", "some", "any"];
const TRAILING_FILLER: &[&str] = &[
    "figure", "figures", "number", "numbers", "value", "values", "estimate", "estimates",
    "metric", "metrics", "section", "breakdown",
];
const CLAUSE_BREAKS: &[&str] = &[" must ", " should ", " but "];

/// Terms following any of `markers`, in original case
fn criterion_terms(criterion: &str, markers: &[&str]) -> Vec<String> {
    let mut terms = Vec::new();

    for sentence in criterion.split(['.', ';', '\n']) {
        // ASCII lowercasing keeps byte offsets aligned with `sentence`
        let lower = sentence.to_ascii_lowercase();

        for marker in markers {
            let Some(pos) = lower.find(marker) else {
                continue;
            };

            let start = pos + marker.len();
            let end = CLAUSE_BREAKS
                .iter()
                .filter_map(|b| lower[start..].find(b).map(|i| start + i))
                .min()
                .unwrap_or(sentence.len());

            for chunk in sentence[start..end].split(',') {
                let words: Vec<&str> = chunk.split_whitespace().collect();
                for group in words.split(|w| w.eq_ignore_ascii_case("and")) {
                    if let Some(term) = clean_term(group) {
                        terms.push(term);
                    }
                }
            }
        }
    }

    terms
}

fn clean_term(group: &[&str]) -> Option<String> {
    let mut words: Vec<&str> = group
        .iter()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '-'))
        .filter(|w| !w.is_empty())
        .collect();

    while words
        .first()
        .is_some_and(|w| LEADING_FILLER.contains(&w.to_lowercase().as_str()))
    {
        words.remove(0);
    }
    while words.len() > 1
        && words
            .last()
            .is_some_and(|w| TRAILING_FILLER.contains(&w.to_lowercase().as_str()))
    {
        words.pop();
    }

    (!words.is_empty()).then(|| words.join(" "))
}

//
// ================= Oracle-backed evaluator =================
//

/// Evaluator that asks the reasoning oracle for a judgment
pub struct OracleEvaluator {
    oracle: Arc<dyn ReasoningOracle>,
}

impl OracleEvaluator {
    pub fn new(oracle: Arc<dyn ReasoningOracle>) -> Self {
        Self { oracle }
    }

    fn build_prompt(&self, criterion: &str, draft: &Draft, session: &Session) -> String {
        let mut prompt = format!(
            "You are an evaluator that determines if a task has been completed successfully by an Assistant.\n\
             Assess the Assistant's last response based on the given criteria. Respond with your feedback, \
             and with your decision on whether the success criteria has been met, and whether more input is needed from the user.\n\n\
             The entire conversation with the assistant, with the user's original request and all replies, is:\n{}\n\n\
             The success criteria for this assignment is:\n{}\n\n\
             The final response from the Assistant that you are evaluating is:\n{}\n",
            session.format_conversation(),
            criterion,
            draft.content
        );

        if !session.feedback().is_empty() {
            prompt.push_str(&format!(
                "\nIn a prior attempt from the Assistant, you provided this feedback: {}\n\
                 If the Assistant is repeating the same mistakes, consider responding that user input is required.\n",
                session.feedback()
            ));
        }

        prompt.push_str(
            "\nIf the Assistant has asked a question or needs clarification, user input is needed. \
             Give the Assistant the benefit of the doubt if it says it has completed a step.",
        );
        prompt
    }
}

#[async_trait]
impl Evaluator for OracleEvaluator {
    async fn judge(&self, criterion: &str, draft: &Draft, session: &Session) -> Result<Verdict> {
        let prompt = self.build_prompt(criterion, draft, session);
        let judgment = self.oracle.judge(&prompt).await?;

        info!(
            met = judgment.success_criteria_met,
            user_input_needed = judgment.user_input_needed,
            "Oracle judgment"
        );

        let verdict = if judgment.success_criteria_met {
            Verdict::Accepted
        } else if judgment.user_input_needed {
            Verdict::NeedsInput(non_empty(
                judgment.feedback,
                "More information is needed to continue.",
            ))
        } else {
            Verdict::Rejected(non_empty(judgment.feedback, "success criterion not met"))
        };

        Ok(verdict)
    }
}

fn non_empty(text: String, fallback: &str) -> String {
    if text.trim().is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Judgment, ScriptedOracle};
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_criterion_accepts_anything() {
        let evaluator = create_default_evaluator();
        let verdict = evaluator
            .evaluate(None, &Draft::new(""), &Session::new("c"))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Accepted);
    }

    #[tokio::test]
    async fn test_required_term_missing_is_rejected() {
        let evaluator = create_default_evaluator();
        let session = Session::new("c");

        let verdict = evaluator
            .evaluate(Some("must include a VaR figure"), &Draft::new("60/40 allocation"), &session)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Rejected("missing VaR".to_string()));

        let verdict = evaluator
            .evaluate(
                Some("must include a VaR figure"),
                &Draft::new("60/40 allocation with a 1-day VaR of 4.2%"),
                &session,
            )
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Accepted);
    }

    #[tokio::test]
    async fn test_payload_counts_towards_required_terms() {
        let draft = Draft::new("allocation ready").with_payload(json!({"sharpe": 1.1}));
        let verdict = create_default_evaluator()
            .evaluate(Some("Must mention Sharpe"), &draft, &Session::new("c"))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Accepted);
    }

    #[tokio::test]
    async fn test_forbidden_terms_and_required_terms_combine() {
        let verdict = create_default_evaluator()
            .evaluate(
                Some("must include VaR and must not mention crypto"),
                &Draft::new("Add 5% crypto exposure"),
                &Session::new("c"),
            )
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Verdict::Rejected("missing VaR; mentions crypto".to_string())
        );
    }

    #[test]
    fn test_criterion_terms_strip_filler() {
        assert_eq!(
            criterion_terms(
                "Must include the Sharpe ratio, a VaR figure and beta.",
                REQUIRE_MARKERS
            ),
            vec!["Sharpe ratio", "VaR", "beta"]
        );
        assert!(criterion_terms(DEFAULT_CRITERION, REQUIRE_MARKERS).is_empty());
    }

    #[tokio::test]
    async fn test_oracle_evaluator_maps_judgments() {
        let oracle = Arc::new(ScriptedOracle::new().judgments(vec![
            Judgment::reject("missing VaR"),
            Judgment {
                feedback: "Which client is this for?".to_string(),
                success_criteria_met: false,
                user_input_needed: true,
            },
        ]));
        let evaluator = OracleEvaluator::new(oracle.clone());
        let session = Session::new("c");
        let draft = Draft::new("60/40");

        assert_eq!(
            evaluator.evaluate(Some("must include VaR"), &draft, &session).await.unwrap(),
            Verdict::Rejected("missing VaR".to_string())
        );
        assert_eq!(
            evaluator.evaluate(Some("must include VaR"), &draft, &session).await.unwrap(),
            Verdict::NeedsInput("Which client is this for?".to_string())
        );
        assert_eq!(
            evaluator.evaluate(Some("must include VaR"), &draft, &session).await.unwrap(),
            Verdict::Accepted
        );
        assert!(oracle.prompts()[0].contains("must include VaR"));
    }
}

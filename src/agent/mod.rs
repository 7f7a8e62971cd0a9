//! Orchestrator - drives the route / dispatch / evaluate loop
//!
//! ROUTING → DISPATCHING ⇄ TOOL_EXECUTING → EVALUATING → (next handler | retry | done)
//!
//! One submit runs the loop until every planned handler has an accepted
//! draft, a handler or the evaluator needs caller input, or the iteration
//! cap is spent. The session is checkpointed at the end of every submit.

use crate::checkpoint::CheckpointStore;
use crate::error::{OrchestrationError, RoutingError};
use crate::evaluator::Evaluator;
use crate::handlers::{Handler, HandlerRegistry};
use crate::models::{
    Assignment, Contribution, Draft, ExecutionMode, FailureCause, FinalResult, HandlerId,
    HandlerOutcome, RoutingDecision, SubmitResponse, Verdict,
};
use crate::router::Router;
use crate::session::{PendingPlan, Session, SessionStatus, Turn};
use crate::tools::ToolRegistry;
use crate::Result;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Routing→Evaluating cycles allowed per submit
    pub max_iterations: u32,
    /// On a handler failure, move on to the next planned handler if one remains
    pub advance_on_handler_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            advance_on_handler_failure: true,
        }
    }
}

/// A handler outcome once its tool requests are resolved
#[derive(Debug)]
enum Work {
    Draft(Draft),
    NeedsInput(String),
    Failed(String),
    /// Carries the handler's last tool error, if any
    ToolRoundsExhausted(Option<String>),
}

impl Work {
    fn not_registered(handler: HandlerId) -> Self {
        Work::Failed(OrchestrationError::HandlerNotFound(handler.to_string()).to_string())
    }
}

/// Plan progress for the current submit
struct Run {
    task: String,
    decision: RoutingDecision,
    position: usize,
    accepted: Vec<Contribution>,
    iterations: u32,
    fanned_out: bool,
    prefetched: BTreeMap<usize, Work>,
}

impl Run {
    fn new(
        task: String,
        decision: RoutingDecision,
        position: usize,
        accepted: Vec<Contribution>,
    ) -> Self {
        Self {
            task,
            decision,
            position,
            accepted,
            iterations: 0,
            fanned_out: false,
            prefetched: BTreeMap::new(),
        }
    }

    fn pending(&self) -> PendingPlan {
        PendingPlan {
            task: self.task.clone(),
            decision: Some(self.decision.clone()),
            position: self.position,
            accepted: self.accepted.clone(),
        }
    }
}

/// How a submit ended, before it is written back to the session
enum Finish {
    Accepted(FinalResult),
    NeedsInput(String, PendingPlan),
    Failed(FailureCause, String),
}

/// Main orchestrator that coordinates routing, handlers, tools and evaluation
pub struct Orchestrator {
    router: Router,
    handlers: HandlerRegistry,
    tools: Arc<ToolRegistry>,
    evaluator: Box<dyn Evaluator>,
    checkpoints: Box<dyn CheckpointStore>,
    config: OrchestratorConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        handlers: HandlerRegistry,
        tools: Arc<ToolRegistry>,
        evaluator: Box<dyn Evaluator>,
        checkpoints: Box<dyn CheckpointStore>,
    ) -> Self {
        Self {
            router: Router::new(&handlers),
            handlers,
            tools,
            evaluator,
            checkpoints,
            config: OrchestratorConfig::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.config
    }

    /// Last checkpointed state of a conversation
    pub async fn session(&self, conversation_id: &str) -> Result<Option<Session>> {
        self.checkpoints.load(conversation_id).await
    }

    pub async fn submit(
        &self,
        conversation_id: &str,
        task: &str,
        success_criterion: Option<&str>,
    ) -> Result<SubmitResponse> {
        self.submit_with_cancel(conversation_id, task, success_criterion, &CancellationToken::new())
            .await
    }

    /// Submit a task or an answer to a pending question.
    ///
    /// Cancelling `cancel` stops the loop at its next suspension point; the
    /// session is checkpointed as it stood and `Cancelled` is returned.
    pub async fn submit_with_cancel(
        &self,
        conversation_id: &str,
        task: &str,
        success_criterion: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SubmitResponse> {
        let lock = self.conversation_lock(conversation_id).await;

        let result = match cancellable(cancel, lock.lock()).await {
            Ok(_guard) => {
                self.submit_locked(conversation_id, task, success_criterion, cancel)
                    .await
            }
            Err(e) => Err(e),
        };

        drop(lock);
        self.release_lock(conversation_id).await;
        result
    }

    /// Forget a conversation. Waits for any submit in flight on it;
    /// returns `false` when nothing was stored.
    pub async fn reset(&self, conversation_id: &str) -> Result<bool> {
        let lock = self.conversation_lock(conversation_id).await;
        let deleted = {
            let _guard = lock.lock().await;
            self.checkpoints.delete(conversation_id).await
        };

        drop(lock);
        self.release_lock(conversation_id).await;

        if let Ok(true) = deleted {
            info!(conversation_id, "Session reset");
        }
        deleted
    }

    async fn submit_locked(
        &self,
        conversation_id: &str,
        task: &str,
        success_criterion: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SubmitResponse> {
        let mut session = self
            .checkpoints
            .load(conversation_id)
            .await?
            .unwrap_or_else(|| Session::new(conversation_id));

        let prior_status = session.status();
        let prior_pending = session.pending().cloned();

        info!(
            conversation_id,
            turns = session.turn_count(),
            resuming = prior_status == SessionStatus::NeedsInput,
            "Submit received"
        );

        session.clear_feedback();
        session.append(Turn::user(task));

        let outcome = match self.begin(&mut session, task, success_criterion) {
            Ok(mut run) => {
                session.set_status(SessionStatus::Running);
                self.drive(&mut session, &mut run, cancel).await
            }
            Err(finish) => Ok(finish),
        };

        match outcome {
            Ok(finish) => {
                let response = self.finish(&mut session, finish);
                self.checkpoints.save(&session).await?;

                info!(
                    conversation_id,
                    status = response.status(),
                    "Submit finished"
                );
                Ok(response)
            }
            Err(OrchestrationError::Cancelled) => {
                warn!(conversation_id, "Submit cancelled");
                session.set_status(prior_status);
                session.set_pending(prior_pending);
                self.checkpoints.save(&session).await?;
                Err(OrchestrationError::Cancelled)
            }
            Err(e) => {
                error!(conversation_id, error = %e, "Submit aborted");
                session.set_status(SessionStatus::Failed);
                session.set_pending(None);
                if let Err(save_error) = self.checkpoints.save(&session).await {
                    error!(
                        conversation_id,
                        error = %save_error,
                        "Failed to checkpoint aborted session"
                    );
                }
                Err(e)
            }
        }
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Remove the conversation's lock once no other submit holds or awaits it
    async fn release_lock(&self, conversation_id: &str) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(conversation_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(conversation_id);
        }
    }

    // =============================
    // ROUTING
    // =============================

    /// Resume a suspended plan or route a new task
    fn begin(
        &self,
        session: &mut Session,
        task: &str,
        success_criterion: Option<&str>,
    ) -> std::result::Result<Run, Finish> {
        let resumed = if session.status() == SessionStatus::NeedsInput {
            session.take_pending()
        } else {
            session.set_pending(None);
            None
        };

        match resumed {
            Some(pending) => {
                if let Some(criterion) = success_criterion {
                    session.set_success_criterion(Some(criterion.to_string()));
                }

                match pending.decision {
                    Some(decision) => {
                        debug!(position = pending.position, "Resuming suspended plan");
                        Ok(Run::new(pending.task, decision, pending.position, pending.accepted))
                    }
                    None => {
                        let combined = format!("{} {}", pending.task, task.trim());
                        self.route(session, combined)
                    }
                }
            }
            None => {
                session.set_success_criterion(success_criterion.map(str::to_string));
                self.route(session, task.trim().to_string())
            }
        }
    }

    fn route(&self, session: &mut Session, task: String) -> std::result::Result<Run, Finish> {
        match self.router.route(&task, session) {
            Ok(decision) => {
                info!(handlers = ?decision.handlers(), mode = ?decision.mode, "Task routed");
                Ok(Run::new(task, decision, 0, Vec::new()))
            }
            Err(RoutingError::NoRoute(_)) => {
                let question = format!(
                    "Please clarify your request. None of the specialists matched \"{}\"; \
                     say whether you need portfolio construction, investment research, risk analysis, \
                     tax optimization, transition planning, a client report or an account operation.",
                    task
                );
                session.append(Turn::system(format!("No route for task: {}", task)));

                Err(Finish::NeedsInput(
                    question,
                    PendingPlan {
                        task,
                        decision: None,
                        position: 0,
                        accepted: Vec::new(),
                    },
                ))
            }
        }
    }

    // =============================
    // LOOP
    // =============================

    async fn drive(
        &self,
        session: &mut Session,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Finish> {
        loop {
            if run.position >= run.decision.len() {
                return Ok(Finish::Accepted(FinalResult::from_contributions(
                    std::mem::take(&mut run.accepted),
                )));
            }

            if run.iterations >= self.config.max_iterations {
                warn!(iterations = run.iterations, "Iteration cap reached");
                return Ok(Finish::Failed(
                    FailureCause::MaxIterationsExceeded,
                    format!(
                        "No accepted result after {} iterations",
                        self.config.max_iterations
                    ),
                ));
            }

            if run.decision.mode == ExecutionMode::Parallel && !run.fanned_out {
                self.fan_out(session, run, cancel).await?;
            }

            run.iterations += 1;
            let assignment = run.decision.assignments[run.position].clone();
            let handler_id = assignment.handler;

            debug!(
                iteration = run.iterations,
                handler = %handler_id,
                position = run.position,
                "Dispatching"
            );

            let work = match run.prefetched.remove(&run.position) {
                Some(work) => work,
                None => match self.handlers.get(handler_id) {
                    Some(handler) => {
                        self.work(handler.as_ref(), &assignment.sub_task, session, cancel)
                            .await?
                    }
                    None => Work::not_registered(handler_id),
                },
            };

            match work {
                Work::Draft(mut draft) => {
                    if let Some(plan) = draft.plan.take() {
                        session.append(Turn::assistant(handler_id, &draft.content));
                        if let Some(finish) = self.substitute_plan(run, plan) {
                            return Ok(finish);
                        }
                        continue;
                    }

                    session.merge_context(std::mem::take(&mut draft.context_updates));
                    session.append(Turn::assistant(handler_id, &draft.content));

                    let judged = cancellable(
                        cancel,
                        self.evaluator
                            .evaluate(session.success_criterion(), &draft, session),
                    )
                    .await?;

                    let verdict = match judged {
                        Ok(verdict) => verdict,
                        Err(e) => {
                            warn!(handler = %handler_id, error = %e, "Evaluator errored");
                            let reason =
                                OrchestrationError::EvaluationError(e.to_string()).to_string();
                            session.append(Turn::system(reason.clone()));
                            return Ok(Finish::Failed(FailureCause::EvaluationError, reason));
                        }
                    };

                    match verdict {
                        Verdict::Accepted => {
                            info!(
                                handler = %handler_id,
                                iteration = run.iterations,
                                "Draft accepted"
                            );
                            session.clear_feedback();
                            run.accepted.push(Contribution {
                                handler: handler_id,
                                content: draft.content,
                                payload: draft.payload,
                            });
                            run.position += 1;
                        }
                        Verdict::Rejected(feedback) => {
                            info!(
                                handler = %handler_id,
                                iteration = run.iterations,
                                %feedback,
                                "Draft rejected"
                            );
                            session
                                .append(Turn::system(format!("Evaluator feedback: {}", feedback)));
                            session.set_feedback(feedback);
                        }
                        Verdict::NeedsInput(question) => {
                            session.append(Turn::system(format!(
                                "Evaluator needs input: {}",
                                question
                            )));
                            return Ok(Finish::NeedsInput(question, run.pending()));
                        }
                    }
                }
                Work::NeedsInput(question) => {
                    info!(handler = %handler_id, "Handler needs caller input");
                    session.append(Turn::assistant(handler_id, &question));
                    return Ok(Finish::NeedsInput(question, run.pending()));
                }
                Work::Failed(reason) => {
                    session.append(Turn::system(format!(
                        "{} failed: {}",
                        handler_id.display_name(),
                        reason
                    )));

                    let alternate_remains = run.position + 1 < run.decision.len();
                    if self.config.advance_on_handler_failure && alternate_remains {
                        warn!(handler = %handler_id, %reason, "Handler failed, advancing plan");
                        session.clear_feedback();
                        run.position += 1;
                        continue;
                    }

                    warn!(handler = %handler_id, %reason, "Handler failed with no alternate");
                    return Ok(Finish::Failed(FailureCause::HandlerFailure, reason));
                }
                Work::ToolRoundsExhausted(last_error) => {
                    let mut reason = format!(
                        "{} exceeded {} tool rounds",
                        handler_id.display_name(),
                        self.config.max_iterations
                    );
                    if let Some(last_error) = last_error {
                        reason.push_str(&format!("; last tool error: {}", last_error));
                    }
                    return Ok(Finish::Failed(FailureCause::MaxIterationsExceeded, reason));
                }
            }
        }
    }

    // =============================
    // DISPATCHING ⇄ TOOL_EXECUTING
    // =============================

    /// Dispatch one handler and run its tool requests until it settles
    async fn work(
        &self,
        handler: &dyn Handler,
        sub_task: &str,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<Work> {
        let handler_id = handler.id();
        let mut rounds = 0;

        loop {
            let outcome = match cancellable(cancel, handler.handle(sub_task, session)).await? {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(handler = %handler_id, error = %e, "Handler errored");
                    HandlerOutcome::Failed(e.to_string())
                }
            };

            let calls = match outcome {
                HandlerOutcome::NeedsMoreWork(calls) => calls,
                HandlerOutcome::DraftReady(draft) => return Ok(Work::Draft(draft)),
                HandlerOutcome::NeedsHumanInput(question) => return Ok(Work::NeedsInput(question)),
                HandlerOutcome::Failed(reason) => return Ok(Work::Failed(reason)),
            };

            rounds += 1;
            if rounds > self.config.max_iterations {
                let last_error = session
                    .tool_records_for(handler_id)
                    .filter_map(|record| record.result.failure())
                    .last()
                    .map(|failure| failure.message.clone());
                return Ok(Work::ToolRoundsExhausted(last_error));
            }

            debug!(handler = %handler_id, round = rounds, calls = calls.len(), "Executing tools");

            for call in &calls {
                cancellable(cancel, self.tools.execute_call(handler_id, call, session)).await?;
            }
        }
    }

    /// Run every remaining assignment of a parallel plan concurrently on
    /// session snapshots, then splice their turns back in plan order.
    async fn fan_out(
        &self,
        session: &mut Session,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<()> {
        run.fanned_out = true;
        let base_len = session.turn_count();

        let remaining: Vec<(usize, Assignment, Session)> = (run.position..run.decision.len())
            .map(|position| {
                (
                    position,
                    run.decision.assignments[position].clone(),
                    session.clone(),
                )
            })
            .collect();

        info!(branches = remaining.len(), "Fanning out");

        let branches = remaining.into_iter().map(|(position, assignment, mut branch)| {
            async move {
                let result = match self.handlers.get(assignment.handler) {
                    Some(handler) => {
                        self.work(handler.as_ref(), &assignment.sub_task, &mut branch, cancel)
                            .await
                    }
                    None => Ok(Work::not_registered(assignment.handler)),
                };
                (position, branch, result)
            }
        });

        let mut cancelled = false;
        for (position, branch, result) in join_all(branches).await {
            session.extend(branch.turns_after(base_len).to_vec());
            match result {
                Ok(work) => {
                    run.prefetched.insert(position, work);
                }
                Err(_) => cancelled = true,
            }
        }

        if cancelled {
            return Err(OrchestrationError::Cancelled);
        }
        Ok(())
    }

    /// Replace the dispatcher's slot with its plan
    fn substitute_plan(&self, run: &mut Run, plan: RoutingDecision) -> Option<Finish> {
        let assignments: Vec<_> = plan
            .assignments
            .into_iter()
            .filter(|a| a.handler != HandlerId::Dispatcher && self.handlers.contains(a.handler))
            .collect();

        if assignments.is_empty() {
            return Some(Finish::NeedsInput(
                format!(
                    "Please clarify which parts of \"{}\" the specialists should handle.",
                    run.task
                ),
                PendingPlan {
                    task: run.task.clone(),
                    decision: None,
                    position: 0,
                    accepted: run.accepted.clone(),
                },
            ));
        }

        info!(
            handlers = ?assignments.iter().map(|a| a.handler).collect::<Vec<_>>(),
            "Dispatcher plan adopted"
        );

        let sole = run.decision.len() == 1;
        let position = run.position;
        run.decision
            .assignments
            .splice(position..=position, assignments);
        run.decision.mode = if sole { plan.mode } else { ExecutionMode::Sequential };
        run.fanned_out = false;
        run.prefetched.clear();
        None
    }

    // =============================
    // TERMINATION
    // =============================

    fn finish(&self, session: &mut Session, finish: Finish) -> SubmitResponse {
        match finish {
            Finish::Accepted(result) => {
                session.set_status(SessionStatus::Accepted);
                session.set_pending(None);
                SubmitResponse::Accepted { result }
            }
            Finish::NeedsInput(question, pending) => {
                session.set_status(SessionStatus::NeedsInput);
                session.set_pending(Some(pending));
                SubmitResponse::NeedsInput { question }
            }
            Finish::Failed(cause, reason) => {
                session.set_status(SessionStatus::Failed);
                session.set_pending(None);
                let last_feedback = Some(session.feedback().to_string()).filter(|f| !f.is_empty());
                SubmitResponse::Failed {
                    cause,
                    reason,
                    last_feedback,
                }
            }
        }
    }
}

/// Await `fut` unless `cancel` fires first
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestrationError::Cancelled),
        output = fut => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::evaluator::create_default_evaluator;
    use crate::handlers::create_default_handlers;
    use crate::oracle::{Proposal, ScriptedOracle};
    use crate::tools::create_registry;
    use serde_json::json;
    use std::time::Duration;

    fn orchestrator(oracle: ScriptedOracle) -> Orchestrator {
        let tools = create_registry(None, Duration::from_secs(1));
        let handlers = create_default_handlers(Arc::new(oracle), &tools);
        Orchestrator::new(
            handlers,
            Arc::new(tools),
            Box::new(create_default_evaluator()),
            Box::new(InMemoryCheckpointStore::new()),
        )
    }

    #[tokio::test]
    async fn test_single_pass_accepts() {
        let orchestrator = orchestrator(ScriptedOracle::new().script(
            "You are the Portfolio Architect Agent",
            vec![
                Proposal::call("get_client_profile", json!({"client_id": "42"})),
                Proposal::answer("60/40 allocation"),
            ],
        ));

        let response = orchestrator
            .submit("conv", "construct a portfolio for client 42", None)
            .await
            .unwrap();

        assert_eq!(response.status(), "accepted");
        let session = orchestrator.session("conv").await.unwrap().unwrap();
        assert_eq!(session.status(), SessionStatus::Accepted);
        assert_eq!(session.context_value("client_id"), Some(&json!("42")));
    }

    #[tokio::test]
    async fn test_cancelled_submit_keeps_prior_state() {
        let orchestrator = orchestrator(ScriptedOracle::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator
            .submit_with_cancel("conv", "construct a portfolio", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled));
    }

    #[tokio::test]
    async fn test_tool_rounds_are_capped() {
        let calls = (0..5)
            .map(|_| Proposal::call("get_client_profile", json!({"client_id": "42"})))
            .collect();
        let orchestrator = orchestrator(
            ScriptedOracle::new().script("You are the Portfolio Architect Agent", calls),
        )
        .with_config(OrchestratorConfig {
            max_iterations: 2,
            advance_on_handler_failure: true,
        });

        let response = orchestrator
            .submit("conv", "construct a portfolio for client 42", None)
            .await
            .unwrap();

        match response {
            SubmitResponse::Failed { cause, .. } => {
                assert_eq!(cause, FailureCause::MaxIterationsExceeded)
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_round_failure_reports_last_tool_error() {
        let calls = (0..5)
            .map(|_| Proposal::call("get_client_profile", json!({})))
            .collect();
        let orchestrator = orchestrator(
            ScriptedOracle::new().script("You are the Portfolio Architect Agent", calls),
        )
        .with_config(OrchestratorConfig {
            max_iterations: 2,
            advance_on_handler_failure: true,
        });

        let response = orchestrator
            .submit("conv", "construct a portfolio for client 42", None)
            .await
            .unwrap();

        let SubmitResponse::Failed { cause, reason, .. } = response else {
            panic!("expected failure, got {:?}", response);
        };
        assert_eq!(cause, FailureCause::MaxIterationsExceeded);
        assert!(reason.starts_with("Portfolio Architect exceeded 2 tool rounds"));
        assert!(reason.contains("last tool error: Schema violation for get_client_profile"));
    }

    #[tokio::test]
    async fn test_conversation_locks_are_released() {
        let answers = (0..12).map(|i| Proposal::answer(format!("allocation {}", i))).collect();
        let orchestrator = orchestrator(
            ScriptedOracle::new().script("You are the Portfolio Architect Agent", answers),
        );

        for i in 0..10 {
            orchestrator
                .submit(&format!("conv-{}", i), "construct a portfolio", None)
                .await
                .unwrap();
        }
        assert!(orchestrator.locks.lock().await.is_empty());

        let (first, second) = tokio::join!(
            orchestrator.submit("shared", "construct a portfolio", None),
            orchestrator.submit("shared", "rebalance the portfolio", None),
        );
        assert!(first.is_ok() && second.is_ok());
        assert!(orchestrator.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_forgets_conversation() {
        let orchestrator = orchestrator(ScriptedOracle::new().script(
            "You are the Portfolio Architect Agent",
            vec![Proposal::answer("60/40 allocation")],
        ));

        orchestrator
            .submit("conv", "construct a portfolio for client 42", None)
            .await
            .unwrap();

        assert!(orchestrator.reset("conv").await.unwrap());
        assert!(orchestrator.session("conv").await.unwrap().is_none());
        assert!(!orchestrator.reset("conv").await.unwrap());
        assert!(orchestrator.locks.lock().await.is_empty());
    }
}

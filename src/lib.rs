//! Advisor Orchestrator
//!
//! Orchestration core for a financial-advisor assistant:
//! - Routes advisor requests to domain specialist handlers
//! - Lets handlers call validated, time-bounded tools
//! - Judges every draft against the caller's success criterion
//! - Retries with evaluator feedback up to an iteration cap
//! - Checkpoints each conversation with a verifiable turn log
//!
//! LOOP:
//! ROUTE → DISPATCH ⇄ TOOLS → EVALUATE → (RETRY | NEXT HANDLER | DONE)

pub mod agent;
pub mod api;
pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod handlers;
pub mod models;
pub mod oracle;
pub mod router;
pub mod session;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use agent::{Orchestrator, OrchestratorConfig};
pub use models::*;
pub use session::{Session, SessionStatus, Turn, TurnRole};

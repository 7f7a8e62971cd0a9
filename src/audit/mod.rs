//! Turn-log audit
//!
//! The session turn log is the audit trail. Its SHA-256 digest is stored
//! with every checkpoint and re-checked on load.

use crate::session::{Session, Turn, TurnRole};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;

/// Compute SHA256 digest of a turn log
/// Streams JSON straight into the hasher
pub fn turn_log_digest(turns: &[Turn]) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), turns).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

pub fn verify_turn_log(turns: &[Turn], expected: &str) -> bool {
    !expected.is_empty() && turn_log_digest(turns) == expected
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Counts over a session's turn log, reported alongside its digest
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditSummary {
    pub conversation_id: String,
    pub turn_count: usize,
    pub user_turns: usize,
    pub tool_calls: usize,
    pub failed_tool_calls: usize,
    pub mutating_tool_calls: usize,
    pub digest: String,
}

impl AuditSummary {
    pub fn of(session: &Session) -> Self {
        let turns = session.turns();
        let tools = turns.iter().filter_map(|t| t.tool.as_ref());

        Self {
            conversation_id: session.conversation_id().to_string(),
            turn_count: turns.len(),
            user_turns: turns.iter().filter(|t| t.role == TurnRole::User).count(),
            tool_calls: tools.clone().count(),
            failed_tool_calls: tools.clone().filter(|r| !r.result.is_success()).count(),
            mutating_tool_calls: tools
                .filter(|r| r.side_effect == crate::models::SideEffect::Mutating)
                .count(),
            digest: turn_log_digest(turns),
        }
    }
}

//! Session checkpointing
//!
//! Sessions are persisted between submits so a conversation can resume
//! after `NeedsInput` or continue multi-turn. Every save records the
//! turn-log digest; loads verify it.

use crate::audit::{turn_log_digest, verify_turn_log};
use crate::error::OrchestrationError;
use crate::session::Session;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub mod postgres;
pub use postgres::PostgresCheckpointStore;

/// Trait for session persistence
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    /// Drop a conversation; `false` when nothing was stored under the id
    async fn delete(&self, conversation_id: &str) -> Result<bool>;
}

#[derive(Clone)]
struct StoredSession {
    session: Session,
    digest: String,
}

/// In-memory checkpoint store for development and tests
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;

        let Some(stored) = sessions.get(conversation_id) else {
            return Ok(None);
        };

        if !verify_turn_log(stored.session.turns(), &stored.digest) {
            warn!(conversation_id, "Checkpoint digest mismatch");
            return Err(OrchestrationError::CheckpointCorrupted(
                conversation_id.to_string(),
            ));
        }

        Ok(Some(stored.session.clone()))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let stored = StoredSession {
            session: session.clone(),
            digest: turn_log_digest(session.turns()),
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.conversation_id().to_string(), stored);
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(conversation_id).is_some())
    }
}

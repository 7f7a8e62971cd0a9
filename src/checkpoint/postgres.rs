//! Postgres checkpoint store
//!
//! One row per session in `orchestration_sessions`, one row per turn in
//! `orchestration_turns`. The schema is created on first use and every
//! save replaces the session's turns inside a single transaction.

use super::CheckpointStore;
use crate::audit::{turn_log_digest, verify_turn_log};
use crate::error::OrchestrationError;
use crate::models::HandlerId;
use crate::session::{PendingPlan, Session, SessionStatus, ToolRecord, Turn, TurnRole};
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

pub struct PostgresCheckpointStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    /// Build a lazily-connecting pool for `database_url`
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;

        info!("Checkpoint backend: postgres");
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = &self.pool;

        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS orchestration_sessions (
                      conversation_id TEXT PRIMARY KEY,
                      success_criterion TEXT,
                      feedback TEXT NOT NULL DEFAULT '',
                      status TEXT NOT NULL,
                      shared_context JSONB NOT NULL DEFAULT '{}'::jsonb,
                      pending JSONB,
                      turn_digest TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS orchestration_turns (
                      turn_id UUID PRIMARY KEY,
                      conversation_id TEXT NOT NULL,
                      seq INTEGER NOT NULL,
                      role TEXT NOT NULL,
                      content TEXT NOT NULL,
                      handler TEXT,
                      tool JSONB,
                      created_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_orchestration_turns_conversation_seq
                    ON orchestration_turns (conversation_id, seq);
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::CheckpointError(format!(
                    "Failed to initialize checkpoint schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    fn role_to_db(role: TurnRole) -> &'static str {
        match role {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::Tool => "tool",
            TurnRole::System => "system",
        }
    }

    fn role_from_db(role: &str) -> TurnRole {
        match role {
            "assistant" => TurnRole::Assistant,
            "tool" => TurnRole::Tool,
            "system" => TurnRole::System,
            _ => TurnRole::User,
        }
    }

    fn turn_from_row(row: &PgRow) -> Result<Turn> {
        let role: String = row.try_get("role")?;
        let handler: Option<String> = row.try_get("handler")?;
        let tool: Option<Value> = row.try_get("tool")?;

        let tool = tool
            .map(serde_json::from_value::<ToolRecord>)
            .transpose()?;

        Ok(Turn {
            turn_id: row.try_get("turn_id")?,
            role: Self::role_from_db(&role),
            content: row.try_get("content")?,
            handler: handler.and_then(|h| h.parse::<HandlerId>().ok()),
            tool,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait::async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<Session>> {
        self.ensure_schema().await?;

        let Some(row) = sqlx::query(
            r#"
            SELECT success_criterion, feedback, status, shared_context, pending,
                   turn_digest, created_at, updated_at
            FROM orchestration_sessions
            WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            OrchestrationError::CheckpointError(format!("Failed to load session: {}", e))
        })?
        else {
            return Ok(None);
        };

        let turn_rows = sqlx::query(
            r#"
            SELECT turn_id, role, content, handler, tool, created_at
            FROM orchestration_turns
            WHERE conversation_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            OrchestrationError::CheckpointError(format!("Failed to load session turns: {}", e))
        })?;

        let turns = turn_rows
            .iter()
            .map(Self::turn_from_row)
            .collect::<Result<Vec<_>>>()?;

        let digest: String = row.try_get("turn_digest")?;
        if !verify_turn_log(&turns, &digest) {
            warn!(conversation_id, "Checkpoint digest mismatch");
            return Err(OrchestrationError::CheckpointCorrupted(
                conversation_id.to_string(),
            ));
        }

        let status: String = row.try_get("status")?;
        let shared_context: Value = row.try_get("shared_context")?;
        let pending: Option<Value> = row.try_get("pending")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        let shared_context: BTreeMap<String, Value> = serde_json::from_value(shared_context)?;
        let pending = pending
            .map(serde_json::from_value::<PendingPlan>)
            .transpose()?;

        Ok(Some(Session::restore(
            conversation_id.to_string(),
            turns,
            row.try_get("success_criterion")?,
            row.try_get("feedback")?,
            SessionStatus::parse(&status),
            shared_context,
            pending,
            created_at,
            updated_at,
        )))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.ensure_schema().await?;

        let conversation_id = session.conversation_id();
        let shared_context = serde_json::to_value(session.shared_context())?;
        let pending = session.pending().map(serde_json::to_value).transpose()?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestrationError::CheckpointError(format!(
                "Failed to begin checkpoint transaction: {}",
                e
            ))
        })?;

        sqlx::query(
            r#"
            INSERT INTO orchestration_sessions
              (conversation_id, success_criterion, feedback, status, shared_context, pending, turn_digest, created_at, updated_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (conversation_id) DO UPDATE SET
              success_criterion = EXCLUDED.success_criterion,
              feedback = EXCLUDED.feedback,
              status = EXCLUDED.status,
              shared_context = EXCLUDED.shared_context,
              pending = EXCLUDED.pending,
              turn_digest = EXCLUDED.turn_digest,
              updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(conversation_id)
        .bind(session.success_criterion())
        .bind(session.feedback())
        .bind(session.status().as_str())
        .bind(shared_context)
        .bind(pending)
        .bind(turn_log_digest(session.turns()))
        .bind(session.created_at())
        .bind(session.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            OrchestrationError::CheckpointError(format!("Failed to upsert session: {}", e))
        })?;

        sqlx::query("DELETE FROM orchestration_turns WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                OrchestrationError::CheckpointError(format!("Failed to clear old turns: {}", e))
            })?;

        for (seq, turn) in session.turns().iter().enumerate() {
            let tool = turn.tool.as_ref().map(serde_json::to_value).transpose()?;

            sqlx::query(
                r#"
                INSERT INTO orchestration_turns
                  (turn_id, conversation_id, seq, role, content, handler, tool, created_at)
                VALUES
                  ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(turn.turn_id)
            .bind(conversation_id)
            .bind(seq as i32)
            .bind(Self::role_to_db(turn.role))
            .bind(&turn.content)
            .bind(turn.handler.map(|h| h.as_str()))
            .bind(tool)
            .bind(turn.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                OrchestrationError::CheckpointError(format!("Failed to insert turn: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            OrchestrationError::CheckpointError(format!(
                "Failed to commit checkpoint transaction: {}",
                e
            ))
        })?;

        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestrationError::CheckpointError(format!(
                "Failed to begin checkpoint transaction: {}",
                e
            ))
        })?;

        sqlx::query("DELETE FROM orchestration_turns WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                OrchestrationError::CheckpointError(format!("Failed to delete turns: {}", e))
            })?;

        let deleted = sqlx::query("DELETE FROM orchestration_sessions WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                OrchestrationError::CheckpointError(format!("Failed to delete session: {}", e))
            })?;

        tx.commit().await.map_err(|e| {
            OrchestrationError::CheckpointError(format!(
                "Failed to commit checkpoint transaction: {}",
                e
            ))
        })?;

        Ok(deleted.rows_affected() > 0)
    }
}

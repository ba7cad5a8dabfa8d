//! Audit Log Service - system journal entries for registry mutations
//!
//! Every record add/edit/delete and every automated import writes one row to
//! `public.system_log_record`. Writes take the caller's connection so the
//! journal entry commits or rolls back together with the mutation it describes.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Journal action codes, as stored in `system_log_record.action`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditAction {
    Edit,
    Add,
    Delete,
    AutomatedImport,
    AutomatedImportCreateObject,
}

impl AuditAction {
    pub fn code(self) -> i32 {
        match self {
            AuditAction::Edit => 50,
            AuditAction::Add => 60,
            AuditAction::Delete => 70,
            AuditAction::AutomatedImport => 100,
            AuditAction::AutomatedImportCreateObject => 110,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::Edit => write!(f, "EDIT"),
            AuditAction::Add => write!(f, "ADD"),
            AuditAction::Delete => write!(f, "DELETE"),
            AuditAction::AutomatedImport => write!(f, "AUTOMATED_IMPORT"),
            AuditAction::AutomatedImportCreateObject => write!(f, "AUTOMATED_IMPORT_OBJECT"),
        }
    }
}

/// A journal row
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: i32,
    pub target: Option<String>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub created: Option<chrono::DateTime<chrono::Utc>>,
}

/// Service for writing and reading the system journal
#[derive(Clone, Debug)]
pub struct AuditLogService {
    pool: PgPool,
}

impl AuditLogService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write a journal entry on the caller's (transactional) connection.
    pub async fn record(
        conn: &mut PgConnection,
        action: AuditAction,
        actor_name: &str,
        target: &str,
        comment: &str,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO public.system_log_record (id, action, target, comment, created_by, created, updated)
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(action.code())
        .bind(target)
        .bind(comment)
        .bind(actor_name)
        .execute(&mut *conn)
        .await?;

        debug!("Journal {} by {} on {}", action, actor_name, target);
        Ok(id)
    }

    /// Most recent journal entries for one target, newest first.
    pub async fn entries_for_target(&self, target: &str, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, action, target, comment, created_by, created
            FROM public.system_log_record
            WHERE target = $1 AND deleted IS NULL
            ORDER BY created DESC
            LIMIT $2
            "#,
        )
        .bind(target)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

//! Reconciliation audit trail
//!
//! Append-only record of what the periodic passes did: reminders sent, grants
//! expired, credentials revoked, hygiene repairs, and failed cycles. Each row
//! names the action, the affected account (when there is one), an outcome,
//! and free-form detail.

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    ReminderSent,
    GrantExpired,
    CredentialRevoked,
    CredentialHygiene,
    SettlementRepaired,
    CycleFailed,
    OperatorAction,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ReminderSent => "reminder_sent",
            AuditKind::GrantExpired => "grant_expired",
            AuditKind::CredentialRevoked => "credential_revoked",
            AuditKind::CredentialHygiene => "credential_hygiene",
            AuditKind::SettlementRepaired => "settlement_repaired",
            AuditKind::CycleFailed => "cycle_failed",
            AuditKind::OperatorAction => "operator_action",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failed,
    Skipped,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failed => "failed",
            AuditOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub kind: String,
    pub account_id: Option<i64>,
    pub outcome: String,
    pub detail: Option<String>,
    pub created_at: OffsetDateTime,
}

pub struct AuditLog {
    pool: PgPool,
}

impl AuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        kind: AuditKind,
        account_id: Option<i64>,
        outcome: AuditOutcome,
        detail: Option<&str>,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO audit_log (kind, account_id, outcome, detail) VALUES ($1, $2, $3, $4)",
        )
        .bind(kind.as_str())
        .bind(account_id)
        .bind(outcome.as_str())
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> CoreResult<Vec<AuditEntry>> {
        let entries = sqlx::query_as(
            "SELECT id, kind, account_id, outcome, detail, created_at \
             FROM audit_log ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn recent_for_account(
        &self,
        account_id: i64,
        limit: i64,
    ) -> CoreResult<Vec<AuditEntry>> {
        let entries = sqlx::query_as(
            "SELECT id, kind, account_id, outcome, detail, created_at \
             FROM audit_log WHERE account_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_distinct() {
        let kinds = [
            AuditKind::ReminderSent,
            AuditKind::GrantExpired,
            AuditKind::CredentialRevoked,
            AuditKind::CredentialHygiene,
            AuditKind::SettlementRepaired,
            AuditKind::CycleFailed,
            AuditKind::OperatorAction,
        ];
        let labels: std::collections::HashSet<_> = kinds.iter().map(|k| k.as_str()).collect();
        assert_eq!(labels.len(), kinds.len());
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(AuditOutcome::Success.as_str(), "success");
        assert_eq!(AuditOutcome::Failed.as_str(), "failed");
        assert_eq!(AuditOutcome::Skipped.as_str(), "skipped");
    }
}

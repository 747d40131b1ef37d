//! Operator surface
//!
//! Manual interventions that bypass the payment flow: courtesy extensions,
//! trial grants, region moves with credential rotation, and referral payout
//! bookkeeping. Every mutation lands in the audit trail under
//! `operator_action` so the manual history stays reviewable.

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::accounts::AccountService;
use crate::audit::{AuditKind, AuditLog, AuditOutcome};
use crate::credentials::{Credential, CredentialService};
use crate::error::{CoreError, CoreResult};
use crate::locks::KeyedLocks;
use crate::subscriptions::{Grant, SubscriptionService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutStatus {
    Pending,
    Completed,
    Cancelled,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "completed" => Ok(PayoutStatus::Completed),
            "cancelled" => Ok(PayoutStatus::Cancelled),
            other => Err(CoreError::InvariantViolation(format!(
                "unknown payout status '{other}'"
            ))),
        }
    }

    pub fn can_transition(from: PayoutStatus, to: PayoutStatus) -> bool {
        from == PayoutStatus::Pending && to != PayoutStatus::Pending
    }
}

/// One referral payout request. Amount is fixed at request time from the
/// then-unpaid balance.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Payout {
    pub id: i64,
    pub account_id: i64,
    pub amount_cents: i64,
    #[sqlx(rename = "status")]
    pub status_raw: String,
    pub notes: Option<String>,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl Payout {
    pub fn status(&self) -> CoreResult<PayoutStatus> {
        PayoutStatus::parse(&self.status_raw)
    }
}

const PAYOUT_COLUMNS: &str =
    "id, account_id, amount_cents, status, notes, created_at, completed_at";

pub struct AdminService {
    pool: PgPool,
    accounts: Arc<AccountService>,
    subscriptions: Arc<SubscriptionService>,
    credentials: Arc<CredentialService>,
    audit: Arc<AuditLog>,
    locks: Arc<KeyedLocks>,
    trial_enabled: bool,
    trial_days: i64,
}

impl AdminService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        accounts: Arc<AccountService>,
        subscriptions: Arc<SubscriptionService>,
        credentials: Arc<CredentialService>,
        audit: Arc<AuditLog>,
        locks: Arc<KeyedLocks>,
        trial_enabled: bool,
        trial_days: i64,
    ) -> Self {
        Self {
            pool,
            accounts,
            subscriptions,
            credentials,
            audit,
            locks,
            trial_enabled,
            trial_days,
        }
    }

    /// Courtesy extension of the account's live grant.
    pub async fn extend_grant(&self, account_id: i64, days: i64) -> CoreResult<Grant> {
        if days <= 0 {
            return Err(CoreError::Config(format!(
                "extension days must be positive, got {days}"
            )));
        }
        let _guard = self.locks.lock(account_id).await;
        let grant = self.subscriptions.extend_active_grant(account_id, days).await?;
        self.audit
            .record(
                AuditKind::OperatorAction,
                Some(account_id),
                AuditOutcome::Success,
                Some(&format!("extended grant {} by {days} day(s)", grant.id)),
            )
            .await?;
        Ok(grant)
    }

    /// Open a trial grant for an account with no live grant. Rejected when
    /// trials are disabled or the account already holds access; a trial
    /// must never stack onto paid time. `days` overrides the configured
    /// trial length.
    pub async fn grant_trial(&self, account_id: i64, days: Option<i64>) -> CoreResult<Grant> {
        if !self.trial_enabled {
            return Err(CoreError::Config("trials are disabled".to_string()));
        }
        let trial_days = days.unwrap_or(self.trial_days);
        if trial_days <= 0 {
            return Err(CoreError::Config(format!(
                "trial days must be positive, got {trial_days}"
            )));
        }

        let _guard = self.locks.lock(account_id).await;
        if self.subscriptions.active_grant(account_id).await?.is_some() {
            return Err(CoreError::InvariantViolation(format!(
                "account {account_id} already holds a live grant"
            )));
        }

        let plan = self
            .subscriptions
            .active_plans()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Config("no active plans to anchor a trial".to_string()))?;

        let grant = self
            .subscriptions
            .open_or_extend(account_id, &plan, true, Some(trial_days))
            .await?;

        let account = self.accounts.get(account_id).await?;
        if let Err(e) = self.credentials.provision(account_id, &account.region).await {
            tracing::warn!(account_id, error = %e, "Trial credential provisioning failed");
        }

        self.audit
            .record(
                AuditKind::OperatorAction,
                Some(account_id),
                AuditOutcome::Success,
                Some(&format!("granted {trial_days}-day trial")),
            )
            .await?;
        Ok(grant)
    }

    /// Move the account to another region and rotate credentials there. The
    /// old region's credentials are revoked either way; new ones are only
    /// issued while a live grant exists.
    pub async fn change_region(&self, account_id: i64, region: &str) -> CoreResult<()> {
        let _guard = self.locks.lock(account_id).await;

        self.accounts.set_region(account_id, region).await?;
        self.credentials.revoke(account_id, None).await?;
        if self.subscriptions.active_grant(account_id).await?.is_some() {
            self.credentials.provision(account_id, region).await?;
        }

        self.audit
            .record(
                AuditKind::OperatorAction,
                Some(account_id),
                AuditOutcome::Success,
                Some(&format!("moved to region '{region}'")),
            )
            .await?;
        Ok(())
    }

    /// Revoke and reissue the account's credentials in its current region,
    /// for suspected leaks. Requires a live grant; without one there is
    /// nothing to reissue.
    pub async fn rotate_credentials(&self, account_id: i64) -> CoreResult<Credential> {
        let _guard = self.locks.lock(account_id).await;

        if self.subscriptions.active_grant(account_id).await?.is_none() {
            return Err(CoreError::NotFound(format!(
                "no active grant for account {account_id}"
            )));
        }
        let account = self.accounts.get(account_id).await?;
        let credential = self.credentials.rotate(account_id, &account.region).await?;

        self.audit
            .record(
                AuditKind::OperatorAction,
                Some(account_id),
                AuditOutcome::Success,
                Some(&format!("rotated credentials in region '{}'", account.region)),
            )
            .await?;
        Ok(credential)
    }

    /// Turn the referrer's unpaid balance into a pending payout and zero the
    /// underlying referral balances, atomically. Returns None when there is
    /// nothing to pay out.
    pub async fn request_payout(&self, account_id: i64) -> CoreResult<Option<Payout>> {
        let _guard = self.locks.lock(account_id).await;
        let mut tx = self.pool.begin().await?;

        // The UPDATE both locks and zeroes the unpaid balances; the old
        // values come back through the self-join so the payout total is
        // captured atomically.
        let amounts: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE referrals r
            SET amount_cents = 0, last_paid_at = NOW()
            FROM (
                SELECT id, amount_cents FROM referrals
                WHERE referrer_id = $1 AND amount_cents > 0
                FOR UPDATE
            ) prior
            WHERE r.id = prior.id
            RETURNING prior.amount_cents
            "#,
        )
        .bind(account_id)
        .fetch_all(&mut *tx)
        .await?;

        let amount: i64 = amounts.iter().sum();
        if amount <= 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let payout: Payout = sqlx::query_as(&format!(
            "INSERT INTO payouts (account_id, amount_cents, status) \
             VALUES ($1, $2, 'pending') RETURNING {PAYOUT_COLUMNS}"
        ))
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            payout_id = payout.id,
            account_id,
            amount_cents = amount,
            "Payout requested"
        );
        Ok(Some(payout))
    }

    /// Mark a pending payout as paid out-of-band.
    pub async fn mark_payout_completed(
        &self,
        payout_id: i64,
        notes: Option<&str>,
    ) -> CoreResult<Payout> {
        let payout: Option<Payout> = sqlx::query_as(&format!(
            "UPDATE payouts SET status = 'completed', completed_at = NOW(), notes = $1 \
             WHERE id = $2 AND status = 'pending' RETURNING {PAYOUT_COLUMNS}"
        ))
        .bind(notes)
        .bind(payout_id)
        .fetch_optional(&self.pool)
        .await?;

        let payout = payout.ok_or_else(|| {
            CoreError::NotFound(format!("pending payout {payout_id}"))
        })?;

        self.audit
            .record(
                AuditKind::OperatorAction,
                Some(payout.account_id),
                AuditOutcome::Success,
                Some(&format!(
                    "payout {} completed ({} cents)",
                    payout.id, payout.amount_cents
                )),
            )
            .await?;
        Ok(payout)
    }

    pub async fn pending_payouts(&self) -> CoreResult<Vec<Payout>> {
        let payouts = sqlx::query_as(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE status = 'pending' ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(payouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payout_status_round_trips() {
        for s in [
            PayoutStatus::Pending,
            PayoutStatus::Completed,
            PayoutStatus::Cancelled,
        ] {
            assert_eq!(PayoutStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(PayoutStatus::parse("queued").is_err());
    }

    #[test]
    fn payout_terminal_states_are_final() {
        use PayoutStatus::*;
        assert!(PayoutStatus::can_transition(Pending, Completed));
        assert!(PayoutStatus::can_transition(Pending, Cancelled));
        for from in [Completed, Cancelled] {
            for to in [Pending, Completed, Cancelled] {
                assert!(!PayoutStatus::can_transition(from, to));
            }
        }
    }
}

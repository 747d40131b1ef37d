//! Consistency Invariants Module
//!
//! Runnable consistency checks over grants, credentials, payments and
//! referrals. These can be run after any settlement or reconcile pass to
//! verify the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::CoreResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Account(s) affected
    pub account_ids: Vec<i64>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - accounts may have wrong access or money may be mislinked
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple live grants violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleGrantsRow {
    account_id: i64,
    grant_count: i64,
}

/// Row type for duplicate active credentials violation
#[derive(Debug, sqlx::FromRow)]
struct DuplicateCredentialRow {
    account_id: i64,
    region: String,
    cred_count: i64,
}

/// Row type for orphaned credential violation
#[derive(Debug, sqlx::FromRow)]
struct OrphanedCredentialRow {
    account_id: i64,
    region: String,
}

/// Row type for uncorrelated completed payment violation
#[derive(Debug, sqlx::FromRow)]
struct UncorrelatedPaymentRow {
    payment_id: i64,
    account_id: i64,
    provider: String,
}

/// Row type for stale expired grant violation
#[derive(Debug, sqlx::FromRow)]
struct StaleExpiryRow {
    grant_id: i64,
    account_id: i64,
    ends_at: OffsetDateTime,
}

/// Row type for inconsistent referral balance violation
#[derive(Debug, sqlx::FromRow)]
struct ReferralBalanceRow {
    referrer_id: i64,
    referred_id: i64,
    amount_cents: i64,
    total_earned_cents: i64,
}

/// Service for running consistency invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> CoreResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        // Run all checks
        violations.extend(self.check_single_live_grant().await?);
        violations.extend(self.check_single_active_credential().await?);
        violations.extend(self.check_credential_has_live_grant().await?);
        violations.extend(self.check_completed_payment_correlated().await?);
        violations.extend(self.check_expired_grants_in_past().await?);
        violations.extend(self.check_referral_amounts_nonnegative().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 live grant per account
    ///
    /// Multiple live grants would make expiry and credential lifetime
    /// ambiguous; extensions must stack onto the existing grant instead.
    async fn check_single_live_grant(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleGrantsRow> = sqlx::query_as(
            r#"
            SELECT account_id, COUNT(*) as grant_count
            FROM grants
            WHERE status IN ('trial', 'active') AND ends_at > NOW()
            GROUP BY account_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_live_grant".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account has {} live grants (expected at most 1)",
                    row.grant_count
                ),
                context: serde_json::json!({
                    "grant_count": row.grant_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: At most 1 active credential per (account, region)
    ///
    /// Duplicate active credentials mean revocation can miss one and leave
    /// relay access open after expiry.
    async fn check_single_active_credential(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateCredentialRow> = sqlx::query_as(
            r#"
            SELECT account_id, region, COUNT(*) as cred_count
            FROM credentials
            WHERE is_active
            GROUP BY account_id, region
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_credential".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account has {} active credentials in region '{}' (expected 1)",
                    row.cred_count, row.region
                ),
                context: serde_json::json!({
                    "region": row.region,
                    "credential_count": row.cred_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: Active credentials require a live grant
    ///
    /// A credential outliving its grant is exactly the access leak the
    /// hygiene pass exists to close.
    async fn check_credential_has_live_grant(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanedCredentialRow> = sqlx::query_as(
            r#"
            SELECT c.account_id, c.region
            FROM credentials c
            WHERE c.is_active
              AND NOT EXISTS (
                  SELECT 1 FROM grants g
                  WHERE g.account_id = c.account_id
                    AND g.status IN ('trial', 'active')
                    AND g.ends_at > NOW()
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "credential_has_live_grant".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Active credential in region '{}' with no live grant",
                    row.region
                ),
                context: serde_json::json!({
                    "region": row.region,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Completed payments carry a provider correlation id
    ///
    /// A completed payment with no transaction reference cannot be traced
    /// back to money received.
    async fn check_completed_payment_correlated(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<UncorrelatedPaymentRow> = sqlx::query_as(
            r#"
            SELECT p.id as payment_id, p.account_id, p.provider
            FROM payments p
            WHERE p.status = 'completed'
              AND p.chain_tx_id IS NULL
              AND p.wallet_charge_id IS NULL
              AND p.gateway_payment_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_payment_correlated".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Completed payment {} on provider '{}' has no transaction reference",
                    row.payment_id, row.provider
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "provider": row.provider,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: Expired grants lie in the past
    ///
    /// A grant marked expired while its end date is still in the future was
    /// expired by something other than the clock.
    async fn check_expired_grants_in_past(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleExpiryRow> = sqlx::query_as(
            r#"
            SELECT g.id as grant_id, g.account_id, g.ends_at
            FROM grants g
            WHERE g.status = 'expired'
              AND g.ends_at > NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "expired_grants_in_past".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Grant {} is marked expired but ends at {}",
                    row.grant_id, row.ends_at
                ),
                context: serde_json::json!({
                    "grant_id": row.grant_id,
                    "ends_at": row.ends_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Referral balances are consistent
    ///
    /// Accrual only adds and payout only zeroes, so the unpaid balance must
    /// be non-negative and can never exceed lifetime earnings.
    async fn check_referral_amounts_nonnegative(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<ReferralBalanceRow> = sqlx::query_as(
            r#"
            SELECT referrer_id, referred_id, amount_cents, total_earned_cents
            FROM referrals
            WHERE amount_cents < 0 OR amount_cents > total_earned_cents
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "referral_amounts_nonnegative".to_string(),
                account_ids: vec![row.referrer_id, row.referred_id],
                description: format!(
                    "Referral balance {} is inconsistent with lifetime earnings {}",
                    row.amount_cents, row.total_earned_cents
                ),
                context: serde_json::json!({
                    "referrer_id": row.referrer_id,
                    "referred_id": row.referred_id,
                    "amount_cents": row.amount_cents,
                    "total_earned_cents": row.total_earned_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> CoreResult<Vec<InvariantViolation>> {
        match name {
            "single_live_grant" => self.check_single_live_grant().await,
            "single_active_credential" => self.check_single_active_credential().await,
            "credential_has_live_grant" => self.check_credential_has_live_grant().await,
            "completed_payment_correlated" => self.check_completed_payment_correlated().await,
            "expired_grants_in_past" => self.check_expired_grants_in_past().await,
            "referral_amounts_nonnegative" => self.check_referral_amounts_nonnegative().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_live_grant",
            "single_active_credential",
            "credential_has_live_grant",
            "completed_payment_correlated",
            "expired_grants_in_past",
            "referral_amounts_nonnegative",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_live_grant"));
        assert!(checks.contains(&"credential_has_live_grant"));
    }
}

//! Referral commission accrual
//!
//! Commission accrues on every settled payment by a referred account, as a
//! fixed percentage of the paid amount. The commission row is created at
//! referral time by account creation; a missing row means no referral
//! relationship and is silently skipped, never fabricated here.
//!
//! The engine keeps no record of which payments it has processed: the
//! orchestrator guarantees at most one accrual call per payment, and the
//! row's `last_payment_id` linkage lets retries detect an already-applied
//! payment.

use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::error::CoreResult;
use crate::payments::Payment;

/// One (referrer, referred) commission row. `amount_cents` is the current
/// unpaid balance; `total_earned_cents` only grows.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReferralCommission {
    pub id: i64,
    pub referrer_id: i64,
    pub referred_id: i64,
    pub amount_cents: i64,
    pub total_earned_cents: i64,
    pub last_payment_id: Option<i64>,
    pub created_at: OffsetDateTime,
    pub last_paid_at: Option<OffsetDateTime>,
}

pub struct CommissionService {
    commission_percent: i64,
}

impl CommissionService {
    pub fn new(commission_percent: i64) -> Self {
        Self { commission_percent }
    }

    /// Accrue commission for a settled payment onto the payer's referral
    /// row, if one exists. Runs on the caller's transaction so the accrual
    /// commits atomically with the payment settlement.
    ///
    /// Skips silently when the payer has no referrer, and skips when the row
    /// already credits this payment (idempotent under settlement retry).
    pub async fn accrue_on_payment(
        &self,
        conn: &mut PgConnection,
        payment: &Payment,
    ) -> CoreResult<Option<i64>> {
        let referrer_id: Option<i64> =
            sqlx::query_scalar("SELECT referred_by FROM accounts WHERE id = $1")
                .bind(payment.account_id)
                .fetch_optional(&mut *conn)
                .await?
                .flatten();

        let Some(referrer_id) = referrer_id else {
            return Ok(None);
        };

        let commission = commission_cents(payment.amount_cents, self.commission_percent);
        if commission == 0 {
            return Ok(None);
        }

        // The WHERE clauses make this a no-op when there is no referral row
        // for the pair, and when this payment was already credited.
        let rows = sqlx::query(
            r#"
            UPDATE referrals
            SET amount_cents = amount_cents + $1,
                total_earned_cents = total_earned_cents + $1,
                last_payment_id = $2
            WHERE referrer_id = $3 AND referred_id = $4
              AND (last_payment_id IS NULL OR last_payment_id <> $2)
            "#,
        )
        .bind(commission)
        .bind(payment.id)
        .bind(referrer_id)
        .bind(payment.account_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if rows == 0 {
            tracing::debug!(
                payment_id = payment.id,
                referrer_id = referrer_id,
                "No referral row to credit (missing pair or already applied)"
            );
            return Ok(None);
        }

        tracing::info!(
            payment_id = payment.id,
            referrer_id = referrer_id,
            referred_id = payment.account_id,
            commission_cents = commission,
            "Accrued referral commission"
        );
        Ok(Some(commission))
    }
}

/// Integer commission in cents: `amount × percent / 100`, floored.
pub(crate) fn commission_cents(amount_cents: i64, percent: i64) -> i64 {
    amount_cents.saturating_mul(percent) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_percent_of_ten_dollars_is_two() {
        assert_eq!(commission_cents(1000, 20), 200);
    }

    #[test]
    fn rounding_floors() {
        assert_eq!(commission_cents(999, 20), 199); // 199.8 -> 199
        assert_eq!(commission_cents(1, 20), 0);
    }

    #[test]
    fn zero_percent_accrues_nothing() {
        assert_eq!(commission_cents(100_000, 0), 0);
    }

    #[test]
    fn accrual_is_additive_across_payments() {
        // Accumulated row value equals the sum of per-payment commissions.
        let amounts = [1000_i64, 2500, 499];
        let total: i64 = amounts.iter().map(|a| commission_cents(*a, 20)).sum();
        assert_eq!(total, 200 + 500 + 99);
    }

    #[test]
    fn never_negative_and_never_overflows() {
        assert_eq!(commission_cents(0, 20), 0);
        assert!(commission_cents(i64::MAX, 100) >= 0);
    }
}

//! Account management and referral relationships
//!
//! An account is keyed by the external principal id of the messaging channel.
//! The referral code is generated once at creation and never changes; the
//! referrer back-reference is likewise set once. The referral commission row
//! is created here, at referral time, never by the commission engine.

use rand::Rng;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::commission::ReferralCommission;
use crate::error::{CoreError, CoreResult};

const REFERRAL_CODE_LEN: usize = 8;
const REFERRAL_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// One account. Maps 1:1 onto the `accounts` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub external_id: i64,
    pub username: Option<String>,
    pub referral_code: String,
    pub referred_by: Option<i64>,
    pub region: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub created_at: OffsetDateTime,
}

/// Referral earnings rollup for one referrer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferralEarnings {
    pub total_cents: i64,
    pub unpaid_cents: i64,
}

pub struct AccountService {
    pool: PgPool,
    default_region: String,
}

impl AccountService {
    pub fn new(pool: PgPool, default_region: String) -> Self {
        Self {
            pool,
            default_region,
        }
    }

    /// Find an account by external principal id, creating it on first
    /// contact. A referral code supplied at creation binds the referrer and
    /// opens the commission row for the (referrer, referred) pair.
    pub async fn find_or_create(
        &self,
        external_id: i64,
        username: Option<&str>,
        referred_by_code: Option<&str>,
    ) -> CoreResult<Account> {
        if let Some(existing) = self.by_external_id(external_id).await? {
            return Ok(existing);
        }

        let referrer_id = match referred_by_code {
            Some(code) => self.resolve_referrer(code).await?,
            None => None,
        };

        // Referral codes collide roughly never (36^8 space), but the unique
        // index makes a collision a retry, not an outage.
        let mut last_err: Option<sqlx::Error> = None;
        for _ in 0..3 {
            let code = generate_referral_code();
            let inserted: Result<Account, sqlx::Error> = sqlx::query_as(
                r#"
                INSERT INTO accounts (external_id, username, referral_code, referred_by, region)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, external_id, username, referral_code, referred_by, region,
                          is_active, is_admin, created_at
                "#,
            )
            .bind(external_id)
            .bind(username)
            .bind(&code)
            .bind(referrer_id)
            .bind(&self.default_region)
            .fetch_one(&self.pool)
            .await;

            match inserted {
                Ok(account) => {
                    if let Some(referrer_id) = referrer_id {
                        self.open_referral(referrer_id, account.id).await?;
                    }
                    tracing::info!(
                        account_id = account.id,
                        external_id = external_id,
                        referred = referrer_id.is_some(),
                        "Account created"
                    );
                    return Ok(account);
                }
                Err(e) if is_unique_violation(&e) => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_err {
            Some(e) => Err(e.into()),
            None => Err(CoreError::Database(sqlx::Error::RowNotFound)),
        }
    }

    pub async fn by_external_id(&self, external_id: i64) -> CoreResult<Option<Account>> {
        let account = sqlx::query_as(
            r#"
            SELECT id, external_id, username, referral_code, referred_by, region,
                   is_active, is_admin, created_at
            FROM accounts WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    pub async fn get(&self, account_id: i64) -> CoreResult<Account> {
        sqlx::query_as(
            r#"
            SELECT id, external_id, username, referral_code, referred_by, region,
                   is_active, is_admin, created_at
            FROM accounts WHERE id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("account {account_id}")))
    }

    /// Update the account's current region. Credential rotation for the new
    /// region is the caller's responsibility (see the admin surface).
    pub async fn set_region(&self, account_id: i64, region: &str) -> CoreResult<()> {
        let rows = sqlx::query("UPDATE accounts SET region = $1, updated_at = NOW() WHERE id = $2")
            .bind(region)
            .bind(account_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(CoreError::NotFound(format!("account {account_id}")));
        }
        Ok(())
    }

    /// Total and unpaid commission earned by `referrer_id` across all
    /// accounts they referred.
    pub async fn referral_earnings(&self, referrer_id: i64) -> CoreResult<ReferralEarnings> {
        let (total, unpaid): (Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(total_earned_cents), 0),
                   COALESCE(SUM(amount_cents), 0)
            FROM referrals WHERE referrer_id = $1
            "#,
        )
        .bind(referrer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ReferralEarnings {
            total_cents: total.unwrap_or(0),
            unpaid_cents: unpaid.unwrap_or(0),
        })
    }

    /// Per-referred breakdown of the referrer's commission rows, for the
    /// operator view behind payout decisions.
    pub async fn referral_rows(&self, referrer_id: i64) -> CoreResult<Vec<ReferralCommission>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, referrer_id, referred_id, amount_cents, total_earned_cents,
                   last_payment_id, created_at, last_paid_at
            FROM referrals WHERE referrer_id = $1 ORDER BY created_at
            "#,
        )
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn resolve_referrer(&self, code: &str) -> CoreResult<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM accounts WHERE referral_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        if id.is_none() {
            tracing::debug!(code = %code, "Unknown referral code ignored");
        }
        Ok(id)
    }

    /// Create the commission row for a new referral pair. The unique
    /// constraint makes re-creation a no-op.
    async fn open_referral(&self, referrer_id: i64, referred_id: i64) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO referrals (referrer_id, referred_id, amount_cents, total_earned_cents)
            VALUES ($1, $2, 0, 0)
            ON CONFLICT (referrer_id, referred_id) DO NOTHING
            "#,
        )
        .bind(referrer_id)
        .bind(referred_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub(crate) fn generate_referral_code() -> String {
    let mut rng = rand::rng();
    (0..REFERRAL_CODE_LEN)
        .map(|_| {
            let idx = rng.random_range(0..REFERRAL_CODE_CHARSET.len());
            REFERRAL_CODE_CHARSET[idx] as char
        })
        .collect()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_code_shape() {
        let code = generate_referral_code();
        assert_eq!(code.len(), REFERRAL_CODE_LEN);
        assert!(code
            .bytes()
            .all(|b| REFERRAL_CODE_CHARSET.contains(&b)));
    }

    #[test]
    fn referral_codes_vary() {
        let codes: std::collections::HashSet<String> =
            (0..64).map(|_| generate_referral_code()).collect();
        // 64 draws from a 36^8 space should essentially never collide.
        assert!(codes.len() > 60);
    }
}

//! Subscription ledger
//!
//! Owns the grant lifecycle (trial, active, expired, cancelled) and the
//! single-active-grant rule: an account with a live grant gets its end pushed
//! forward instead of a second grant. Rows are never deleted; every lifecycle
//! change is a state transition so the history stays auditable.

use sqlx::{PgConnection, PgPool};
use time::{Duration, OffsetDateTime};

use crate::error::{CoreError, CoreResult};

/// Closed set of grant states. Stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStatus {
    Trial,
    Active,
    Expired,
    Cancelled,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Trial => "trial",
            GrantStatus::Active => "active",
            GrantStatus::Expired => "expired",
            GrantStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "trial" => Ok(GrantStatus::Trial),
            "active" => Ok(GrantStatus::Active),
            "expired" => Ok(GrantStatus::Expired),
            "cancelled" => Ok(GrantStatus::Cancelled),
            other => Err(CoreError::InvariantViolation(format!(
                "unknown grant status '{other}'"
            ))),
        }
    }

    /// Live grants count against the single-active-grant rule.
    pub fn is_live(&self) -> bool {
        matches!(self, GrantStatus::Trial | GrantStatus::Active)
    }

    /// The full transition table. Expiry is one-way; an expired grant is
    /// never reactivated; a later payment opens a fresh grant instead.
    pub fn can_transition(from: GrantStatus, to: GrantStatus) -> bool {
        use GrantStatus::*;
        matches!(
            (from, to),
            (Trial, Active)
                | (Trial, Expired)
                | (Trial, Cancelled)
                | (Active, Expired)
                | (Active, Cancelled)
                | (Cancelled, Active)
        )
    }
}

/// Reference plan data. Read-only to the core.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub duration_days: i32,
    pub price_cents: i64,
    pub is_active: bool,
}

/// One access grant. Maps onto the `grants` table; `status` is text in
/// storage, use [`Grant::status`] for the typed view.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Grant {
    pub id: i64,
    pub account_id: i64,
    pub plan_id: i64,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    #[sqlx(rename = "status")]
    pub status_raw: String,
    pub is_trial: bool,
    pub auto_renew: bool,
    pub created_at: OffsetDateTime,
}

impl Grant {
    pub fn status(&self) -> CoreResult<GrantStatus> {
        GrantStatus::parse(&self.status_raw)
    }

    pub fn days_until_expiry(&self, now: OffsetDateTime) -> i64 {
        if self.ends_at <= now {
            return 0;
        }
        (self.ends_at - now).whole_days()
    }
}

const GRANT_COLUMNS: &str =
    "id, account_id, plan_id, starts_at, ends_at, status, is_trial, auto_renew, created_at";

/// What a settlement or trial request should do to the ledger, given the
/// account's live grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GrantAction {
    /// Push the live grant's end forward. Extending instead of inserting is
    /// what keeps each account at a single live grant; `promote` moves a
    /// trial to active on a paid extension.
    Extend { grant_id: i64, promote: bool },
    /// No live grant: open a fresh one in this state.
    Open { status: GrantStatus },
}

pub(crate) fn grant_action(existing: Option<&Grant>, is_trial: bool) -> CoreResult<GrantAction> {
    match existing {
        Some(grant) => Ok(GrantAction::Extend {
            grant_id: grant.id,
            promote: !is_trial && grant.status()? == GrantStatus::Trial,
        }),
        None => Ok(GrantAction::Open {
            status: if is_trial {
                GrantStatus::Trial
            } else {
                GrantStatus::Active
            },
        }),
    }
}

pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, plan_id: i64) -> CoreResult<Plan> {
        sqlx::query_as(
            "SELECT id, name, duration_days, price_cents, is_active FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("plan {plan_id}")))
    }

    pub async fn active_plans(&self) -> CoreResult<Vec<Plan>> {
        let plans = sqlx::query_as(
            "SELECT id, name, duration_days, price_cents, is_active FROM plans \
             WHERE is_active ORDER BY duration_days",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    /// The account's live grant, if any. Live means trial or active and
    /// still inside its window.
    pub async fn active_grant(&self, account_id: i64) -> CoreResult<Option<Grant>> {
        let grant = sqlx::query_as(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants \
             WHERE account_id = $1 AND status IN ('trial', 'active') AND ends_at > NOW() \
             ORDER BY ends_at DESC LIMIT 1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(grant)
    }

    /// Open a grant for the account, or extend the live one.
    ///
    /// Callers must hold the account's advisory lock: this is the
    /// read-check-write that enforces the single-active-grant rule.
    pub async fn open_or_extend(
        &self,
        account_id: i64,
        plan: &Plan,
        is_trial: bool,
        trial_days: Option<i64>,
    ) -> CoreResult<Grant> {
        let mut tx = self.pool.begin().await?;
        let grant = self
            .open_or_extend_on(&mut tx, account_id, plan, is_trial, trial_days)
            .await?;
        tx.commit().await?;
        Ok(grant)
    }

    /// Transactional variant of [`Self::open_or_extend`], for callers that
    /// need the grant change committed together with other effects.
    pub async fn open_or_extend_on(
        &self,
        conn: &mut PgConnection,
        account_id: i64,
        plan: &Plan,
        is_trial: bool,
        trial_days: Option<i64>,
    ) -> CoreResult<Grant> {
        let duration_days = if is_trial {
            trial_days.unwrap_or(i64::from(plan.duration_days))
        } else {
            i64::from(plan.duration_days)
        };
        let duration = Duration::days(duration_days);

        let existing: Option<Grant> = sqlx::query_as(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants \
             WHERE account_id = $1 AND status IN ('trial', 'active') AND ends_at > NOW() \
             ORDER BY ends_at DESC LIMIT 1 FOR UPDATE"
        ))
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .await?;

        match grant_action(existing.as_ref(), is_trial)? {
            GrantAction::Extend { grant_id, promote } => {
                let updated: Grant = sqlx::query_as(&format!(
                    "UPDATE grants SET ends_at = ends_at + make_interval(days => $1), \
                            status = CASE WHEN $2 THEN 'active' ELSE status END, \
                            is_trial = is_trial AND NOT $2, \
                            updated_at = NOW() \
                     WHERE id = $3 RETURNING {GRANT_COLUMNS}"
                ))
                .bind(i32::try_from(duration_days).unwrap_or(i32::MAX))
                .bind(promote)
                .bind(grant_id)
                .fetch_one(&mut *conn)
                .await?;

                tracing::info!(
                    account_id = account_id,
                    grant_id = updated.id,
                    new_end = %updated.ends_at,
                    promoted = promote,
                    "Extended existing grant"
                );
                Ok(updated)
            }
            GrantAction::Open { status } => {
                let now = OffsetDateTime::now_utc();
                let grant: Grant = sqlx::query_as(&format!(
                    "INSERT INTO grants (account_id, plan_id, starts_at, ends_at, status, is_trial) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING {GRANT_COLUMNS}"
                ))
                .bind(account_id)
                .bind(plan.id)
                .bind(now)
                .bind(now + duration)
                .bind(status.as_str())
                .bind(is_trial)
                .fetch_one(&mut *conn)
                .await?;

                tracing::info!(
                    account_id = account_id,
                    grant_id = grant.id,
                    status = status.as_str(),
                    ends_at = %grant.ends_at,
                    "Opened new grant"
                );
                Ok(grant)
            }
        }
    }

    /// Live grants whose end falls within `(now, now + days]`. Grants that
    /// already expired never appear here.
    pub async fn expiring_before(&self, days: i64) -> CoreResult<Vec<Grant>> {
        let grants = sqlx::query_as(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants \
             WHERE status IN ('trial', 'active') \
               AND ends_at > NOW() AND ends_at <= NOW() + make_interval(days => $1) \
             ORDER BY ends_at"
        ))
        .bind(i32::try_from(days).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(grants)
    }

    /// Live grants whose window has closed, ready for the expiry transition.
    pub async fn all_expired(&self, now: OffsetDateTime) -> CoreResult<Vec<Grant>> {
        let grants = sqlx::query_as(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants \
             WHERE status IN ('trial', 'active') AND ends_at <= $1 \
             ORDER BY ends_at"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(grants)
    }

    /// One-way expiry transition. Returns false when the grant was already
    /// in a terminal state, which makes the reconciler's retry a no-op.
    pub async fn mark_expired(&self, grant_id: i64) -> CoreResult<bool> {
        let rows = sqlx::query(
            "UPDATE grants SET status = 'expired', updated_at = NOW() \
             WHERE id = $1 AND status IN ('trial', 'active')",
        )
        .bind(grant_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Cancel a live grant. Caller must hold the account lock.
    pub async fn cancel(&self, grant_id: i64) -> CoreResult<bool> {
        let rows = sqlx::query(
            "UPDATE grants SET status = 'cancelled', updated_at = NOW() \
             WHERE id = $1 AND status IN ('trial', 'active')",
        )
        .bind(grant_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Push the live grant's end forward by `days`. Errors when the account
    /// holds no live grant.
    pub async fn extend_active_grant(&self, account_id: i64, days: i64) -> CoreResult<Grant> {
        let grant = self
            .active_grant(account_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("no active grant for account {account_id}"))
            })?;

        let updated: Grant = sqlx::query_as(&format!(
            "UPDATE grants SET ends_at = ends_at + make_interval(days => $1), updated_at = NOW() \
             WHERE id = $2 RETURNING {GRANT_COLUMNS}"
        ))
        .bind(i32::try_from(days).unwrap_or(i32::MAX))
        .bind(grant.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(status: &str, ends_in_hours: i64) -> Grant {
        let now = OffsetDateTime::now_utc();
        Grant {
            id: 1,
            account_id: 1,
            plan_id: 1,
            starts_at: now - Duration::days(30),
            ends_at: now + Duration::hours(ends_in_hours),
            status_raw: status.to_string(),
            is_trial: status == "trial",
            auto_renew: false,
            created_at: now - Duration::days(30),
        }
    }

    #[test]
    fn status_round_trips() {
        for s in [
            GrantStatus::Trial,
            GrantStatus::Active,
            GrantStatus::Expired,
            GrantStatus::Cancelled,
        ] {
            assert_eq!(GrantStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(GrantStatus::parse("paused").is_err());
    }

    #[test]
    fn live_states() {
        assert!(GrantStatus::Trial.is_live());
        assert!(GrantStatus::Active.is_live());
        assert!(!GrantStatus::Expired.is_live());
        assert!(!GrantStatus::Cancelled.is_live());
    }

    #[test]
    fn expiry_is_terminal() {
        use GrantStatus::*;
        assert!(GrantStatus::can_transition(Trial, Expired));
        assert!(GrantStatus::can_transition(Active, Expired));
        for to in [Trial, Active, Cancelled, Expired] {
            assert!(!GrantStatus::can_transition(Expired, to));
        }
    }

    #[test]
    fn trial_promotes_but_never_demotes() {
        use GrantStatus::*;
        assert!(GrantStatus::can_transition(Trial, Active));
        assert!(!GrantStatus::can_transition(Active, Trial));
    }

    #[test]
    fn cancel_and_reinstate() {
        use GrantStatus::*;
        assert!(GrantStatus::can_transition(Active, Cancelled));
        assert!(GrantStatus::can_transition(Cancelled, Active));
        assert!(!GrantStatus::can_transition(Cancelled, Trial));
    }

    #[test]
    fn live_grant_is_extended_never_duplicated() {
        for status in ["trial", "active"] {
            let g = grant(status, 24);
            match grant_action(Some(&g), false).unwrap() {
                GrantAction::Extend { grant_id, .. } => assert_eq!(grant_id, g.id),
                other => panic!("expected extend for live {status} grant, got {other:?}"),
            }
        }
    }

    #[test]
    fn paid_extension_promotes_a_trial() {
        let trial = grant("trial", 24);
        assert_eq!(
            grant_action(Some(&trial), false).unwrap(),
            GrantAction::Extend {
                grant_id: trial.id,
                promote: true
            }
        );
        // A second trial on top of a trial extends without promotion.
        assert_eq!(
            grant_action(Some(&trial), true).unwrap(),
            GrantAction::Extend {
                grant_id: trial.id,
                promote: false
            }
        );
    }

    #[test]
    fn paid_extension_of_active_grant_does_not_promote() {
        let active = grant("active", 24);
        assert_eq!(
            grant_action(Some(&active), false).unwrap(),
            GrantAction::Extend {
                grant_id: active.id,
                promote: false
            }
        );
    }

    #[test]
    fn no_live_grant_opens_fresh() {
        assert_eq!(
            grant_action(None, false).unwrap(),
            GrantAction::Open {
                status: GrantStatus::Active
            }
        );
        assert_eq!(
            grant_action(None, true).unwrap(),
            GrantAction::Open {
                status: GrantStatus::Trial
            }
        );
    }

    #[test]
    fn days_until_expiry_floors_at_zero() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(grant("active", -5).days_until_expiry(now), 0);
        assert_eq!(grant("active", 49).days_until_expiry(now), 2);
    }
}

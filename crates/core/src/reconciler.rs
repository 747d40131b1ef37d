//! Periodic reconciliation
//!
//! The background loop that keeps the ledger honest: it reminds accounts
//! whose grant is about to end, transitions overdue grants to expired and
//! revokes their relay credentials, and closes any credential that somehow
//! outlived its grant. One item failing never stops the rest of the pass;
//! a whole-cycle failure is escalated to the operator channel.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;

use crate::accounts::AccountService;
use crate::audit::{AuditKind, AuditLog, AuditOutcome};
use crate::credentials::CredentialService;
use crate::error::CoreResult;
use crate::notify::Notifier;
use crate::subscriptions::SubscriptionService;

/// What one cycle did. Counts only; details go to the audit trail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reminders_sent: u32,
    pub grants_expired: u32,
    pub credentials_revoked: u64,
    pub hygiene_revocations: u64,
    /// Individual items that failed and were skipped.
    pub item_failures: u32,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.item_failures == 0
    }

    pub fn merge(&mut self, other: CycleReport) {
        self.reminders_sent += other.reminders_sent;
        self.grants_expired += other.grants_expired;
        self.credentials_revoked += other.credentials_revoked;
        self.hygiene_revocations += other.hygiene_revocations;
        self.item_failures += other.item_failures;
    }
}

pub struct Reconciler {
    accounts: Arc<AccountService>,
    subscriptions: Arc<SubscriptionService>,
    credentials: Arc<CredentialService>,
    notifier: Arc<Notifier>,
    audit: Arc<AuditLog>,
    reminder_days: Vec<i64>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        accounts: Arc<AccountService>,
        subscriptions: Arc<SubscriptionService>,
        credentials: Arc<CredentialService>,
        notifier: Arc<Notifier>,
        audit: Arc<AuditLog>,
        reminder_days: Vec<i64>,
        interval: Duration,
    ) -> Self {
        Self {
            accounts,
            subscriptions,
            credentials,
            notifier,
            audit,
            reminder_days,
            interval,
        }
    }

    /// One full reconciliation cycle: reminders, expiry, hygiene.
    pub async fn run_cycle(&self) -> CoreResult<CycleReport> {
        let now = OffsetDateTime::now_utc();
        let mut report = CycleReport::default();
        report.merge(self.reminder_pass(now).await?);
        report.merge(self.expiry_pass(now).await?);
        report.merge(self.hygiene_pass().await?);

        tracing::info!(
            reminders = report.reminders_sent,
            expired = report.grants_expired,
            revoked = report.credentials_revoked,
            hygiene = report.hygiene_revocations,
            item_failures = report.item_failures,
            "Reconcile cycle finished"
        );
        Ok(report)
    }

    /// Remind accounts whose grant ends at one of the configured offsets.
    /// Reminders are re-evaluated every cycle; with a day-granular offset
    /// and a sub-day interval an account can be reminded more than once on
    /// the boundary day, which beats silently missing the window.
    async fn reminder_pass(&self, now: OffsetDateTime) -> CoreResult<CycleReport> {
        let mut report = CycleReport::default();
        let Some(max_days) = self.reminder_days.iter().copied().max() else {
            return Ok(report);
        };

        for grant in self.subscriptions.expiring_before(max_days).await? {
            let days_left = grant.days_until_expiry(now);
            if !is_reminder_day(days_left, &self.reminder_days) {
                continue;
            }

            let delivered = async {
                let account = self.accounts.get(grant.account_id).await?;
                let message = reminder_message(days_left);
                self.notifier.send(account.external_id, &message).await
            }
            .await;

            match delivered {
                Ok(()) => {
                    report.reminders_sent += 1;
                    self.audit
                        .record(
                            AuditKind::ReminderSent,
                            Some(grant.account_id),
                            AuditOutcome::Success,
                            Some(&format!("{days_left} day(s) before expiry")),
                        )
                        .await?;
                }
                Err(e) => {
                    report.item_failures += 1;
                    tracing::warn!(
                        account_id = grant.account_id,
                        error = %e,
                        "Expiry reminder delivery failed"
                    );
                    self.audit
                        .record(
                            AuditKind::ReminderSent,
                            Some(grant.account_id),
                            AuditOutcome::Failed,
                            Some(&e.to_string()),
                        )
                        .await?;
                }
            }
        }
        Ok(report)
    }

    /// Expire overdue grants and revoke their credentials. Expiry is
    /// recorded even when revocation or the notice fails; the hygiene pass
    /// and the next cycle pick up the remainder.
    async fn expiry_pass(&self, now: OffsetDateTime) -> CoreResult<CycleReport> {
        let mut report = CycleReport::default();

        for grant in self.subscriptions.all_expired(now).await? {
            if !self.subscriptions.mark_expired(grant.id).await? {
                // A concurrent actor already moved it to a terminal state.
                continue;
            }
            report.grants_expired += 1;
            self.audit
                .record(
                    AuditKind::GrantExpired,
                    Some(grant.account_id),
                    AuditOutcome::Success,
                    Some(&format!("grant {}", grant.id)),
                )
                .await?;

            match self.credentials.revoke(grant.account_id, None).await {
                Ok(revoked) => {
                    report.credentials_revoked += revoked;
                    if revoked > 0 {
                        self.audit
                            .record(
                                AuditKind::CredentialRevoked,
                                Some(grant.account_id),
                                AuditOutcome::Success,
                                Some(&format!("{revoked} credential(s) on expiry")),
                            )
                            .await?;
                    }
                }
                Err(e) => {
                    report.item_failures += 1;
                    tracing::error!(
                        account_id = grant.account_id,
                        error = %e,
                        "Credential revocation on expiry failed"
                    );
                    self.audit
                        .record(
                            AuditKind::CredentialRevoked,
                            Some(grant.account_id),
                            AuditOutcome::Failed,
                            Some(&e.to_string()),
                        )
                        .await?;
                }
            }

            let notice = async {
                let account = self.accounts.get(grant.account_id).await?;
                self.notifier
                    .send(
                        account.external_id,
                        "Your relay access has expired. Renew to restore your credentials.",
                    )
                    .await
            }
            .await;
            if let Err(e) = notice {
                // Notice delivery is best-effort; the state change stands.
                tracing::warn!(account_id = grant.account_id, error = %e, "Expiry notice failed");
            }
        }
        Ok(report)
    }

    /// Close active credentials whose owner no longer holds a live grant.
    async fn hygiene_pass(&self) -> CoreResult<CycleReport> {
        let mut report = CycleReport::default();

        for account_id in self.credentials.orphaned_credential_accounts().await? {
            match self.credentials.revoke(account_id, None).await {
                Ok(revoked) => {
                    report.hygiene_revocations += revoked;
                    tracing::warn!(
                        account_id,
                        revoked,
                        "Closed credentials with no live grant"
                    );
                    self.audit
                        .record(
                            AuditKind::CredentialHygiene,
                            Some(account_id),
                            AuditOutcome::Success,
                            Some(&format!("{revoked} orphaned credential(s)")),
                        )
                        .await?;
                }
                Err(e) => {
                    report.item_failures += 1;
                    self.audit
                        .record(
                            AuditKind::CredentialHygiene,
                            Some(account_id),
                            AuditOutcome::Failed,
                            Some(&e.to_string()),
                        )
                        .await?;
                }
            }
        }
        Ok(report)
    }

    /// Run cycles at the configured interval until `shutdown` flips true.
    /// An in-flight cycle always finishes; a failed cycle is audited and
    /// escalated, then the loop keeps going.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            reminder_days = ?self.reminder_days,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "Reconcile cycle failed");
                if let Err(audit_err) = self
                    .audit
                    .record(AuditKind::CycleFailed, None, AuditOutcome::Failed, Some(&e.to_string()))
                    .await
                {
                    tracing::error!(error = %audit_err, "Could not audit failed cycle");
                }
                self.notifier
                    .alert_operator(&format!("Reconcile cycle failed: {e}"))
                    .await;
            }
        }

        tracing::info!("Reconciler stopped");
    }
}

fn is_reminder_day(days_left: i64, offsets: &[i64]) -> bool {
    offsets.contains(&days_left)
}

fn reminder_message(days_left: i64) -> String {
    if days_left <= 1 {
        "Your relay access expires within a day. Renew now to keep your credentials.".to_string()
    } else {
        format!("Your relay access expires in {days_left} days.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_merges_counts() {
        let mut report = CycleReport {
            reminders_sent: 2,
            item_failures: 1,
            ..CycleReport::default()
        };
        report.merge(CycleReport {
            grants_expired: 3,
            credentials_revoked: 4,
            hygiene_revocations: 1,
            item_failures: 1,
            ..CycleReport::default()
        });
        assert_eq!(report.reminders_sent, 2);
        assert_eq!(report.grants_expired, 3);
        assert_eq!(report.credentials_revoked, 4);
        assert_eq!(report.hygiene_revocations, 1);
        assert_eq!(report.item_failures, 2);
        assert!(!report.is_clean());
    }

    #[test]
    fn empty_report_is_clean() {
        assert!(CycleReport::default().is_clean());
    }

    #[test]
    fn reminder_fires_only_on_configured_offsets() {
        let offsets = [7, 1];
        assert!(is_reminder_day(7, &offsets));
        assert!(is_reminder_day(1, &offsets));
        assert!(!is_reminder_day(6, &offsets));
        assert!(!is_reminder_day(0, &offsets));
    }

    #[test]
    fn reminder_message_wording() {
        assert!(reminder_message(1).contains("within a day"));
        assert!(reminder_message(7).contains("7 days"));
    }
}

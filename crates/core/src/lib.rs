// Core crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Service constructors wire many collaborators
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! RelayPass Core
//!
//! Orchestration core for selling time-boxed access to regional relay
//! servers.
//!
//! ## Features
//!
//! - **Payments**: Three settlement rails tried in priority order with
//!   per-rail failure isolation and idempotent verification
//! - **Subscriptions**: Grant lifecycle with a single live grant per account;
//!   renewals extend instead of stacking
//! - **Credentials**: Relay credentials encrypted at rest, provisioned on
//!   settlement and revoked on expiry
//! - **Referrals**: Percentage commission accrual per settled payment, with
//!   payout bookkeeping
//! - **Reconciliation**: Periodic reminders, expiry sweeps and credential
//!   hygiene, with an audit trail and operator escalation
//! - **Invariants**: Runnable consistency checks over the whole ledger

pub mod accounts;
pub mod admin;
pub mod audit;
pub mod commission;
pub mod credentials;
pub mod error;
pub mod invariants;
pub mod locks;
pub mod notify;
pub mod payments;
pub mod reconciler;
pub mod subscriptions;

#[cfg(test)]
mod edge_case_tests;

// Accounts
pub use accounts::{Account, AccountService, ReferralEarnings};

// Admin
pub use admin::{AdminService, Payout, PayoutStatus};

// Audit
pub use audit::{AuditEntry, AuditKind, AuditLog, AuditOutcome};

// Commission
pub use commission::{CommissionService, ReferralCommission};

// Credentials
pub use credentials::{Credential, CredentialService};

// Error
pub use error::{CoreError, CoreResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Locks
pub use locks::KeyedLocks;

// Notifications
pub use notify::{NotificationChannel, Notifier};

// Payments
pub use payments::{
    InitiatedPayment, Payment, PaymentOutcome, PaymentService, PaymentStatus, ProviderKind,
    VerifyOutcome,
};

// Reconciler
pub use reconciler::{CycleReport, Reconciler};

// Subscriptions
pub use subscriptions::{Grant, GrantStatus, Plan, SubscriptionService};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use relaypass_shared::Config;

/// Main core service that combines all orchestration functionality
pub struct CoreService {
    pub accounts: Arc<AccountService>,
    pub subscriptions: Arc<SubscriptionService>,
    pub credentials: Arc<CredentialService>,
    pub commission: Arc<CommissionService>,
    pub payments: Arc<PaymentService>,
    pub admin: Arc<AdminService>,
    pub notifier: Arc<Notifier>,
    pub audit: Arc<AuditLog>,
    pub invariants: Arc<InvariantChecker>,
    pub reconciler: Arc<Reconciler>,
    pub locks: Arc<KeyedLocks>,
}

impl CoreService {
    /// Create a new core service from environment variables
    pub fn from_env(pool: PgPool) -> CoreResult<Self> {
        let config = Config::from_env()?;
        Ok(Self::new(&config, pool))
    }

    /// Create a new core service with explicit config
    pub fn new(config: &Config, pool: PgPool) -> Self {
        let locks = Arc::new(KeyedLocks::new());
        let accounts = Arc::new(AccountService::new(
            pool.clone(),
            config.default_region.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(pool.clone()));
        let credentials = Arc::new(CredentialService::new(
            pool.clone(),
            &config.encryption_key,
            config.relay_servers.clone(),
        ));
        let commission = Arc::new(CommissionService::new(config.commission_percent));
        let notifier = Arc::new(Notifier::new(config));
        let audit = Arc::new(AuditLog::new(pool.clone()));
        let invariants = Arc::new(InvariantChecker::new(pool.clone()));

        let payments = Arc::new(PaymentService::new(
            config,
            pool.clone(),
            subscriptions.clone(),
            commission.clone(),
            credentials.clone(),
            locks.clone(),
        ));

        let admin = Arc::new(AdminService::new(
            pool.clone(),
            accounts.clone(),
            subscriptions.clone(),
            credentials.clone(),
            audit.clone(),
            locks.clone(),
            config.trial_enabled,
            config.trial_days,
        ));

        let reconciler = Arc::new(Reconciler::new(
            accounts.clone(),
            subscriptions.clone(),
            credentials.clone(),
            notifier.clone(),
            audit.clone(),
            config.reminder_days.clone(),
            Duration::from_secs(config.reconcile_interval_secs),
        ));

        Self {
            accounts,
            subscriptions,
            credentials,
            commission,
            payments,
            admin,
            notifier,
            audit,
            invariants,
            reconciler,
            locks,
        }
    }
}

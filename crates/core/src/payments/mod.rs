//! Payment orchestration
//!
//! Abstracts over the settlement rails (on-chain transfer, in-app wallet
//! balance, third-party crypto gateway) and tries them in priority order with
//! independent failure semantics. On verified settlement the grant is opened
//! or extended, commission accrues to the referrer, and relay credentials
//! are provisioned, exactly once per payment.

pub mod chain;
pub mod gateway;
pub mod wallet;

use std::sync::Arc;

use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;

use relaypass_shared::Config;

use crate::accounts::Account;
use crate::commission::CommissionService;
use crate::credentials::CredentialService;
use crate::error::{CoreError, CoreResult};
use crate::locks::KeyedLocks;
use crate::subscriptions::SubscriptionService;

use chain::ChainProvider;
use gateway::GatewayProvider;
use wallet::WalletProvider;

/// The settlement rails, in fixed fallback priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    ChainTransfer,
    WalletBalance,
    CryptoGateway,
}

impl ProviderKind {
    pub const PRIORITY: [ProviderKind; 3] = [
        ProviderKind::ChainTransfer,
        ProviderKind::WalletBalance,
        ProviderKind::CryptoGateway,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::ChainTransfer => "chain_transfer",
            ProviderKind::WalletBalance => "wallet_balance",
            ProviderKind::CryptoGateway => "crypto_gateway",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "chain_transfer" => Ok(ProviderKind::ChainTransfer),
            "wallet_balance" => Ok(ProviderKind::WalletBalance),
            "crypto_gateway" => Ok(ProviderKind::CryptoGateway),
            other => Err(CoreError::Provider(format!("unknown provider '{other}'"))),
        }
    }

    /// Column on `payments` that stores this rail's transaction reference.
    /// At most one of the three is ever non-null per payment.
    fn correlation_column(&self) -> &'static str {
        match self {
            ProviderKind::ChainTransfer => "chain_tx_id",
            ProviderKind::WalletBalance => "wallet_charge_id",
            ProviderKind::CryptoGateway => "gateway_payment_id",
        }
    }
}

/// Candidate list for a purchase: the preferred rail alone when given,
/// otherwise the full priority order.
pub(crate) fn candidate_providers(preferred: Option<ProviderKind>) -> Vec<ProviderKind> {
    match preferred {
        Some(kind) => vec![kind],
        None => ProviderKind::PRIORITY.to_vec(),
    }
}

/// Closed set of payment states. Pending is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(CoreError::InvariantViolation(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Pending → {Completed, Failed, Cancelled}; terminal states are final.
    pub fn can_transition(from: PaymentStatus, to: PaymentStatus) -> bool {
        from == PaymentStatus::Pending && to.is_terminal()
    }
}

/// One payment attempt against one provider.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub account_id: i64,
    pub grant_id: Option<i64>,
    pub plan_id: Option<i64>,
    pub provider: String,
    pub amount_cents: i64,
    pub provider_payment_id: Option<String>,
    pub chain_tx_id: Option<String>,
    pub wallet_charge_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    #[sqlx(rename = "status")]
    pub status_raw: String,
    pub payload: Option<serde_json::Value>,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl Payment {
    pub fn status(&self) -> CoreResult<PaymentStatus> {
        PaymentStatus::parse(&self.status_raw)
    }

    pub fn provider_kind(&self) -> CoreResult<ProviderKind> {
        ProviderKind::parse(&self.provider)
    }
}

const PAYMENT_COLUMNS: &str = "id, account_id, grant_id, plan_id, provider, amount_cents, \
     provider_payment_id, chain_tx_id, wallet_charge_id, gateway_payment_id, status, payload, \
     created_at, completed_at";

/// What a provider reports about a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Settled; carries the provider's transaction reference.
    Confirmed { tx_ref: String },
    /// Reachable but no matching settlement yet.
    NotFound,
}

/// Opaque initiation handle handed back to the purchase flow for display
/// (transfer link, invoice id, charge payload).
#[derive(Debug, Clone)]
pub struct InitiatedPayment {
    pub provider: ProviderKind,
    pub provider_payment_id: String,
    pub payload: serde_json::Value,
}

/// What verification should do for a payment in a given state, decided
/// before any provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerifyGate {
    /// Settled earlier; verification is a no-op and must not re-apply
    /// effects.
    AlreadyCompleted,
    /// Failed and cancelled payments are final and unverifiable.
    Rejected,
    /// Pending: ask the provider.
    Proceed,
}

pub(crate) fn verify_gate(status: PaymentStatus) -> VerifyGate {
    match status {
        PaymentStatus::Completed => VerifyGate::AlreadyCompleted,
        PaymentStatus::Failed | PaymentStatus::Cancelled => VerifyGate::Rejected,
        PaymentStatus::Pending => VerifyGate::Proceed,
    }
}

/// Outcome of the guarded completion UPDATE. Zero affected rows means a
/// concurrent verifier moved the payment out of pending first; the loser
/// must not apply settlement effects a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SettlementAction {
    Apply,
    LostRace,
}

pub(crate) fn settlement_action(rows_updated: u64) -> SettlementAction {
    if rows_updated > 0 {
        SettlementAction::Apply
    } else {
        SettlementAction::LostRace
    }
}

/// Decision for the settlement repair path. Applied twice: once on the
/// cheap pre-lock read and again after the account lock is held, so two
/// concurrent repairs cannot both extend the grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RepairAction {
    /// Only completed payments are repairable.
    NotRepairable,
    /// The grant step already ran; hand back its result.
    AlreadyLinked(i64),
    Apply,
}

pub(crate) fn repair_action(status: PaymentStatus, grant_id: Option<i64>) -> RepairAction {
    match (status, grant_id) {
        (PaymentStatus::Completed, Some(id)) => RepairAction::AlreadyLinked(id),
        (PaymentStatus::Completed, None) => RepairAction::Apply,
        _ => RepairAction::NotRepairable,
    }
}

/// Result of verifying one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// Settled just now; downstream effects applied.
    Confirmed { grant_id: Option<i64> },
    /// Already settled earlier; no effects re-applied.
    AlreadyCompleted,
    /// Provider reachable, settlement not yet visible. Try again later.
    NotConfirmed { detail: String },
}

pub struct PaymentService {
    pool: PgPool,
    chain: ChainProvider,
    wallet: WalletProvider,
    gateway: GatewayProvider,
    subscriptions: Arc<SubscriptionService>,
    commission: Arc<CommissionService>,
    credentials: Arc<CredentialService>,
    locks: Arc<KeyedLocks>,
}

impl PaymentService {
    pub fn new(
        config: &Config,
        pool: PgPool,
        subscriptions: Arc<SubscriptionService>,
        commission: Arc<CommissionService>,
        credentials: Arc<CredentialService>,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        Self {
            pool,
            chain: ChainProvider::new(config.chain.clone()),
            wallet: WalletProvider::new(config.wallet.clone()),
            gateway: GatewayProvider::new(config.gateway.clone()),
            subscriptions,
            commission,
            credentials,
            locks,
        }
    }

    /// Create a payment for a plan purchase, trying providers in priority
    /// order (or only the preferred one). Each attempt gets its own payment
    /// row; failed attempts are marked failed before the next rail is tried.
    /// If every rail fails, the aggregated error carries the last detail.
    pub async fn create_payment(
        &self,
        account: &Account,
        amount_cents: i64,
        description: &str,
        plan_id: Option<i64>,
        preferred: Option<ProviderKind>,
    ) -> CoreResult<(Payment, InitiatedPayment)> {
        let mut last_error = String::from("no providers configured");

        for kind in candidate_providers(preferred) {
            let payment: Payment = sqlx::query_as(&format!(
                "INSERT INTO payments (account_id, plan_id, provider, amount_cents) \
                 VALUES ($1, $2, $3, $4) RETURNING {PAYMENT_COLUMNS}"
            ))
            .bind(account.id)
            .bind(plan_id)
            .bind(kind.as_str())
            .bind(amount_cents)
            .fetch_one(&self.pool)
            .await?;

            match self.initiate(kind, account, amount_cents, description).await {
                Ok(handle) => {
                    let payment: Payment = sqlx::query_as(&format!(
                        "UPDATE payments SET provider_payment_id = $1, payload = $2 \
                         WHERE id = $3 RETURNING {PAYMENT_COLUMNS}"
                    ))
                    .bind(&handle.provider_payment_id)
                    .bind(&handle.payload)
                    .bind(payment.id)
                    .fetch_one(&self.pool)
                    .await?;

                    tracing::info!(
                        payment_id = payment.id,
                        account_id = account.id,
                        provider = kind.as_str(),
                        amount_cents = amount_cents,
                        "Payment initiated"
                    );
                    return Ok((payment, handle));
                }
                Err(e) => {
                    tracing::warn!(
                        payment_id = payment.id,
                        provider = kind.as_str(),
                        error = %e,
                        "Provider initiation failed, falling through"
                    );
                    last_error = e.to_string();
                    sqlx::query("UPDATE payments SET status = 'failed' WHERE id = $1")
                        .bind(payment.id)
                        .execute(&self.pool)
                        .await?;
                }
            }
        }

        Err(CoreError::AllProvidersFailed(last_error))
    }

    async fn initiate(
        &self,
        kind: ProviderKind,
        account: &Account,
        amount_cents: i64,
        description: &str,
    ) -> CoreResult<InitiatedPayment> {
        match kind {
            ProviderKind::ChainTransfer => {
                self.chain.initiate(account.id, amount_cents, description).await
            }
            ProviderKind::WalletBalance => {
                self.wallet.initiate(account.id, amount_cents, description)
            }
            ProviderKind::CryptoGateway => {
                self.gateway.initiate(account.id, amount_cents, description).await
            }
        }
    }

    pub async fn get(&self, payment_id: i64) -> CoreResult<Payment> {
        sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("payment {payment_id}")))
    }

    /// Most recent pending payment for the account on one rail. Used by the
    /// push-based completion events to locate the payment they settle.
    pub async fn latest_pending(
        &self,
        account_id: i64,
        kind: ProviderKind,
    ) -> CoreResult<Option<Payment>> {
        let payment = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE account_id = $1 AND provider = $2 AND status = 'pending' \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(account_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    pub async fn by_gateway_order(&self, order_id: &str) -> CoreResult<Option<Payment>> {
        let payment = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE provider = 'crypto_gateway' AND provider_payment_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    /// Authenticate a wallet charge callback by its shared secret. Fails
    /// closed when no secret is configured.
    pub fn verify_wallet_callback_secret(&self, provided: &str) -> CoreResult<()> {
        self.wallet.verify_callback_secret(provided)
    }

    /// Attach the wallet rail's push event (charge id) to a pending payment
    /// so that verification can see it.
    pub async fn record_wallet_charge(&self, payment_id: i64, charge_id: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE payments SET payload = COALESCE(payload, '{}'::jsonb) \
                 || jsonb_build_object('wallet_charge_id', $1::text) \
             WHERE id = $2 AND status = 'pending'",
        )
        .bind(charge_id)
        .bind(payment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attach a gateway callback payload (including its signature field) to
    /// a pending payment. The signature is checked at verification time.
    pub async fn record_gateway_callback(
        &self,
        payment_id: i64,
        callback: &serde_json::Value,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE payments SET payload = COALESCE(payload, '{}'::jsonb) \
                 || jsonb_build_object('gateway_callback', $1::jsonb) \
             WHERE id = $2 AND status = 'pending'",
        )
        .bind(callback)
        .bind(payment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Verify a payment and, on first confirmation, apply the settlement:
    /// complete the payment, open or extend the grant, accrue commission,
    /// provision credentials.
    ///
    /// Idempotent: an already-completed payment short-circuits to
    /// [`PaymentOutcome::AlreadyCompleted`] without re-triggering effects.
    pub async fn verify_payment(&self, payment_id: i64) -> CoreResult<PaymentOutcome> {
        let payment = self.get(payment_id).await?;
        match verify_gate(payment.status()?) {
            VerifyGate::AlreadyCompleted => return Ok(PaymentOutcome::AlreadyCompleted),
            VerifyGate::Rejected => {
                return Err(CoreError::Verification(format!(
                    "payment {payment_id} is {} and cannot be verified",
                    payment.status_raw
                )));
            }
            VerifyGate::Proceed => {}
        }

        let kind = payment.provider_kind()?;
        let outcome = match kind {
            ProviderKind::ChainTransfer => self.chain.verify(&payment).await?,
            ProviderKind::WalletBalance => self.wallet.verify(&payment)?,
            ProviderKind::CryptoGateway => self.gateway.verify(&payment)?,
        };

        let tx_ref = match outcome {
            VerifyOutcome::Confirmed { tx_ref } => tx_ref,
            VerifyOutcome::NotFound => {
                return Ok(PaymentOutcome::NotConfirmed {
                    detail: "settlement not yet visible at the provider".to_string(),
                });
            }
        };

        // Serialize grant/credential effects per account.
        let _guard = self.locks.lock(payment.account_id).await;

        let mut tx = self.pool.begin().await?;
        let completed = sqlx::query(&format!(
            "UPDATE payments SET status = 'completed', completed_at = NOW(), {} = $1 \
             WHERE id = $2 AND status = 'pending'",
            kind.correlation_column()
        ))
        .bind(&tx_ref)
        .bind(payment.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if settlement_action(completed) == SettlementAction::LostRace {
            tx.rollback().await?;
            return Ok(PaymentOutcome::AlreadyCompleted);
        }

        match self.apply_settlement(&mut tx, &payment).await {
            Ok(grant_id) => {
                tx.commit().await?;
                tracing::info!(
                    payment_id = payment.id,
                    account_id = payment.account_id,
                    provider = kind.as_str(),
                    tx_ref = %tx_ref,
                    grant_id = grant_id,
                    "Payment settled"
                );

                // Money, grant and commission are committed; a credential
                // hiccup here is repaired by the next reconcile pass.
                if let Err(e) = self.provision_for(&payment).await {
                    tracing::warn!(
                        payment_id = payment.id,
                        error = %e,
                        "Credential provisioning after settlement failed"
                    );
                }
                Ok(PaymentOutcome::Confirmed { grant_id })
            }
            Err(e) => {
                // Money was received: the payment must stay completed even
                // though the downstream step failed. Roll back the joint
                // transaction, re-mark completion alone, surface the error.
                tx.rollback().await?;
                sqlx::query(&format!(
                    "UPDATE payments SET status = 'completed', completed_at = NOW(), {} = $1 \
                     WHERE id = $2 AND status = 'pending'",
                    kind.correlation_column()
                ))
                .bind(&tx_ref)
                .bind(payment.id)
                .execute(&self.pool)
                .await?;

                tracing::error!(
                    payment_id = payment.id,
                    error = %e,
                    "Settlement side effects failed; payment kept completed"
                );
                Err(e)
            }
        }
    }

    /// Grant + commission portion of a settlement, on the caller's
    /// transaction. Returns the grant id when a plan was attached.
    async fn apply_settlement(
        &self,
        conn: &mut PgConnection,
        payment: &Payment,
    ) -> CoreResult<Option<i64>> {
        let grant_id = match payment.plan_id {
            Some(plan_id) => {
                let plan = self.subscriptions.plan(plan_id).await?;
                let grant = self
                    .subscriptions
                    .open_or_extend_on(conn, payment.account_id, &plan, false, None)
                    .await?;
                sqlx::query("UPDATE payments SET grant_id = $1 WHERE id = $2")
                    .bind(grant.id)
                    .bind(payment.id)
                    .execute(&mut *conn)
                    .await?;
                Some(grant.id)
            }
            None => {
                tracing::warn!(
                    payment_id = payment.id,
                    "Payment has no plan attached; skipping grant step"
                );
                None
            }
        };

        self.commission.accrue_on_payment(conn, payment).await?;
        Ok(grant_id)
    }

    async fn provision_for(&self, payment: &Payment) -> CoreResult<()> {
        let region: String = sqlx::query_scalar("SELECT region FROM accounts WHERE id = $1")
            .bind(payment.account_id)
            .fetch_one(&self.pool)
            .await?;
        self.credentials.provision(payment.account_id, &region).await?;
        Ok(())
    }

    /// Repair pass for a payment that completed but whose grant/commission
    /// step failed: re-applies the settlement effects exactly once.
    pub async fn reconcile_settlement(&self, payment_id: i64) -> CoreResult<Option<i64>> {
        let payment = self.get(payment_id).await?;
        match repair_action(payment.status()?, payment.grant_id) {
            RepairAction::NotRepairable => {
                return Err(CoreError::Verification(format!(
                    "payment {payment_id} is not completed"
                )));
            }
            RepairAction::AlreadyLinked(grant_id) => return Ok(Some(grant_id)),
            RepairAction::Apply => {}
        }

        let _guard = self.locks.lock(payment.account_id).await;

        // Re-read under the lock: a concurrent repair of the same payment
        // could have linked the grant between the first read and here, and
        // extending twice would hand out free time.
        let payment = self.get(payment_id).await?;
        match repair_action(payment.status()?, payment.grant_id) {
            RepairAction::NotRepairable => {
                return Err(CoreError::Verification(format!(
                    "payment {payment_id} is not completed"
                )));
            }
            RepairAction::AlreadyLinked(grant_id) => return Ok(Some(grant_id)),
            RepairAction::Apply => {}
        }

        let mut tx = self.pool.begin().await?;
        let grant_id = self.apply_settlement(&mut tx, &payment).await?;
        tx.commit().await?;

        if let Err(e) = self.provision_for(&payment).await {
            tracing::warn!(payment_id = payment.id, error = %e, "Provisioning during repair failed");
        }
        Ok(grant_id)
    }

    /// Raw provider status for a payment, without side effects.
    pub async fn provider_status(&self, payment: &Payment) -> CoreResult<VerifyOutcome> {
        let handle = payment
            .provider_payment_id
            .as_deref()
            .ok_or_else(|| CoreError::Verification("payment was never initiated".to_string()))?;
        match payment.provider_kind()? {
            ProviderKind::ChainTransfer => self.chain.status(handle).await,
            ProviderKind::WalletBalance => self.wallet.status(handle),
            ProviderKind::CryptoGateway => self.gateway.status(handle).await,
        }
    }
}

/// Helper used by providers to build deterministic-but-unique order ids.
pub(crate) fn order_reference(prefix: &str, account_id: i64) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{account_id}_{}", &token[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_fixed() {
        assert_eq!(
            candidate_providers(None),
            vec![
                ProviderKind::ChainTransfer,
                ProviderKind::WalletBalance,
                ProviderKind::CryptoGateway,
            ]
        );
    }

    #[test]
    fn preferred_provider_is_the_only_candidate() {
        assert_eq!(
            candidate_providers(Some(ProviderKind::CryptoGateway)),
            vec![ProviderKind::CryptoGateway]
        );
    }

    #[test]
    fn payment_status_transitions() {
        use PaymentStatus::*;
        assert!(PaymentStatus::can_transition(Pending, Completed));
        assert!(PaymentStatus::can_transition(Pending, Failed));
        assert!(PaymentStatus::can_transition(Pending, Cancelled));
        for from in [Completed, Failed, Cancelled] {
            for to in [Pending, Completed, Failed, Cancelled] {
                assert!(!PaymentStatus::can_transition(from, to));
            }
        }
    }

    #[test]
    fn provider_round_trip_and_columns() {
        for kind in ProviderKind::PRIORITY {
            assert_eq!(ProviderKind::parse(kind.as_str()).unwrap(), kind);
        }
        // Distinct correlation columns: at most one non-null per payment.
        let cols: std::collections::HashSet<_> = ProviderKind::PRIORITY
            .iter()
            .map(|k| k.correlation_column())
            .collect();
        assert_eq!(cols.len(), 3);
    }

    #[test]
    fn completed_payment_short_circuits_verification() {
        // Idempotence: re-verifying a settled payment never re-applies
        // effects, regardless of how often it is retried.
        assert_eq!(
            verify_gate(PaymentStatus::Completed),
            VerifyGate::AlreadyCompleted
        );
        assert_eq!(verify_gate(PaymentStatus::Pending), VerifyGate::Proceed);
    }

    #[test]
    fn terminal_failures_are_not_verifiable() {
        assert_eq!(verify_gate(PaymentStatus::Failed), VerifyGate::Rejected);
        assert_eq!(verify_gate(PaymentStatus::Cancelled), VerifyGate::Rejected);
    }

    #[test]
    fn completion_race_loser_applies_nothing() {
        // The guarded UPDATE moves exactly one verifier out of pending;
        // everyone else sees zero rows and must back off.
        assert_eq!(settlement_action(1), SettlementAction::Apply);
        assert_eq!(settlement_action(0), SettlementAction::LostRace);
    }

    #[test]
    fn repair_skips_an_already_linked_payment() {
        assert_eq!(
            repair_action(PaymentStatus::Completed, Some(31)),
            RepairAction::AlreadyLinked(31)
        );
        assert_eq!(
            repair_action(PaymentStatus::Completed, None),
            RepairAction::Apply
        );
    }

    #[test]
    fn repair_requires_a_completed_payment() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Failed,
            PaymentStatus::Cancelled,
        ] {
            assert_eq!(repair_action(status, None), RepairAction::NotRepairable);
            assert_eq!(
                repair_action(status, Some(1)),
                RepairAction::NotRepairable
            );
        }
    }

    #[test]
    fn order_references_are_unique() {
        let a = order_reference("relay", 7);
        let b = order_reference("relay", 7);
        assert!(a.starts_with("relay_7_"));
        assert_ne!(a, b);
    }
}

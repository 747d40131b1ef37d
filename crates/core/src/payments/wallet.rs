//! In-app wallet balance provider
//!
//! Second rail. The wallet platform is push-based: it charges the user's
//! balance and calls back with a charge id, so initiation only builds an
//! invoice payload and verification checks whether the callback has landed.
//! Callbacks carry a shared secret; the check fails closed when the secret
//! is unconfigured, so a forged callback can never settle a payment.

use serde_json::json;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use relaypass_shared::WalletConfig;

use crate::error::{CoreError, CoreResult};
use crate::payments::{InitiatedPayment, Payment, ProviderKind, VerifyOutcome};

pub struct WalletProvider {
    config: WalletConfig,
}

impl WalletProvider {
    pub fn new(config: WalletConfig) -> Self {
        Self { config }
    }

    pub fn initiate(
        &self,
        account_id: i64,
        amount_cents: i64,
        description: &str,
    ) -> CoreResult<InitiatedPayment> {
        if !self.config.enabled {
            return Err(CoreError::Provider("wallet provider is disabled".into()));
        }

        // The wallet denominates in whole units at 1 unit per cent.
        let amount_units = amount_cents;
        let invoice_ref = format!("wallet_{}_{}", account_id, Uuid::new_v4().simple());

        Ok(InitiatedPayment {
            provider: ProviderKind::WalletBalance,
            provider_payment_id: invoice_ref.clone(),
            payload: json!({
                "invoice_ref": invoice_ref,
                "amount_units": amount_units,
                "amount_cents": amount_cents,
                "description": description,
            }),
        })
    }

    /// Constant-time check of the shared secret a charge callback carries.
    /// Rejects every callback while no secret is configured.
    pub fn verify_callback_secret(&self, provided: &str) -> CoreResult<()> {
        let expected = self.config.callback_secret.as_bytes();
        if expected.is_empty() {
            return Err(CoreError::Verification(
                "wallet callback secret is not configured".into(),
            ));
        }
        let ok = provided.len() == expected.len()
            && provided.as_bytes().ct_eq(expected).unwrap_u8() == 1;
        if ok {
            Ok(())
        } else {
            Err(CoreError::Verification(
                "wallet callback secret mismatch".into(),
            ))
        }
    }

    /// Confirmed once the platform callback recorded a charge id on the
    /// payment. There is no pull API to query against.
    pub fn verify(&self, payment: &Payment) -> CoreResult<VerifyOutcome> {
        let charge_id = payment
            .payload
            .as_ref()
            .and_then(|p| p.get("wallet_charge_id"))
            .and_then(|v| v.as_str());

        Ok(match charge_id {
            Some(id) if !id.is_empty() => VerifyOutcome::Confirmed {
                tx_ref: id.to_string(),
            },
            _ => VerifyOutcome::NotFound,
        })
    }

    pub fn status(&self, _invoice_ref: &str) -> CoreResult<VerifyOutcome> {
        // Push-only platform: without the charge callback there is nothing
        // to look up.
        Ok(VerifyOutcome::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::PaymentStatus;
    use time::OffsetDateTime;

    fn provider(enabled: bool) -> WalletProvider {
        WalletProvider::new(WalletConfig {
            enabled,
            callback_secret: "hush".to_string(),
        })
    }

    fn payment_with_payload(payload: Option<serde_json::Value>) -> Payment {
        Payment {
            id: 1,
            account_id: 7,
            grant_id: None,
            plan_id: Some(1),
            provider: ProviderKind::WalletBalance.as_str().to_string(),
            amount_cents: 500,
            provider_payment_id: Some("wallet_7_x".into()),
            chain_tx_id: None,
            wallet_charge_id: None,
            gateway_payment_id: None,
            status_raw: PaymentStatus::Pending.as_str().to_string(),
            payload,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
        }
    }

    #[test]
    fn disabled_provider_refuses_initiation() {
        let err = provider(false).initiate(7, 500, "30 days").unwrap_err();
        assert!(matches!(err, CoreError::Provider(_)));
    }

    #[test]
    fn initiation_carries_invoice_and_amount() {
        let initiated = provider(true).initiate(7, 500, "30 days").unwrap();
        assert_eq!(initiated.provider, ProviderKind::WalletBalance);
        assert_eq!(initiated.payload["amount_units"], 500);
        assert!(initiated.provider_payment_id.starts_with("wallet_7_"));
    }

    #[test]
    fn verify_without_charge_callback_is_not_found() {
        let payment = payment_with_payload(Some(json!({"invoice_ref": "wallet_7_x"})));
        let outcome = provider(true).verify(&payment).unwrap();
        assert!(matches!(outcome, VerifyOutcome::NotFound));
    }

    #[test]
    fn verify_with_recorded_charge_confirms() {
        let payment = payment_with_payload(Some(json!({
            "invoice_ref": "wallet_7_x",
            "wallet_charge_id": "chg_123",
        })));
        match provider(true).verify(&payment).unwrap() {
            VerifyOutcome::Confirmed { tx_ref } => assert_eq!(tx_ref, "chg_123"),
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[test]
    fn callback_secret_must_match() {
        let p = provider(true);
        assert!(p.verify_callback_secret("hush").is_ok());
        assert!(p.verify_callback_secret("wrong").is_err());
        assert!(p.verify_callback_secret("").is_err());
        assert!(p.verify_callback_secret("hushh").is_err());
    }

    #[test]
    fn unconfigured_secret_rejects_every_callback() {
        let p = WalletProvider::new(WalletConfig {
            enabled: true,
            callback_secret: String::new(),
        });
        assert!(p.verify_callback_secret("anything").is_err());
        assert!(p.verify_callback_secret("").is_err());
    }

    #[test]
    fn empty_charge_id_does_not_confirm() {
        let payment = payment_with_payload(Some(json!({"wallet_charge_id": ""})));
        assert!(matches!(
            provider(true).verify(&payment).unwrap(),
            VerifyOutcome::NotFound
        ));
    }
}

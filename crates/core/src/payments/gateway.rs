//! Crypto payment gateway provider
//!
//! Last-resort rail. Initiation creates a hosted invoice through the
//! gateway's REST API; confirmation arrives over an instant-payment
//! notification (IPN) callback whose authenticity we check with an
//! HMAC-SHA512 signature over the sorted payload. Verification fails closed:
//! a missing or malformed signature, or an unconfigured secret, rejects the
//! callback.

use std::collections::BTreeMap;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha512;

use relaypass_shared::GatewayConfig;

use crate::error::{CoreError, CoreResult};
use crate::payments::{order_reference, InitiatedPayment, Payment, ProviderKind, VerifyOutcome};

type HmacSha512 = Hmac<Sha512>;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GatewayProvider {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl GatewayProvider {
    pub fn new(config: GatewayConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    pub async fn initiate(
        &self,
        account_id: i64,
        amount_cents: i64,
        description: &str,
    ) -> CoreResult<InitiatedPayment> {
        if self.config.api_key.is_empty() {
            return Err(CoreError::Provider("gateway api key not configured".into()));
        }

        let order_id = order_reference("GW", account_id);
        let body = json!({
            "price_amount": amount_cents as f64 / 100.0,
            "price_currency": "usd",
            "order_id": order_id,
            "order_description": description,
            "ipn_callback_url": self.config.callback_url,
        });

        let resp = self
            .client
            .post(format!("{}/payment", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(CoreError::from)?;

        let created: serde_json::Value = resp.json().await?;
        let payment_id = created
            .get("payment_id")
            .map(json_value_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CoreError::Provider("gateway returned no payment_id".into()))?;

        Ok(InitiatedPayment {
            provider: ProviderKind::CryptoGateway,
            provider_payment_id: order_id.clone(),
            payload: json!({
                "order_id": order_id,
                "gateway_payment_id": payment_id,
                "pay_address": created.get("pay_address"),
                "pay_amount": created.get("pay_amount"),
                "pay_currency": created.get("pay_currency"),
                "amount_cents": amount_cents,
            }),
        })
    }

    /// Confirmed once an authentic IPN callback with a finished status has
    /// been recorded on the payment.
    pub fn verify(&self, payment: &Payment) -> CoreResult<VerifyOutcome> {
        let Some(callback) = payment
            .payload
            .as_ref()
            .and_then(|p| p.get("gateway_callback"))
            .and_then(|v| v.as_object())
        else {
            return Ok(VerifyOutcome::NotFound);
        };

        let fields: BTreeMap<String, serde_json::Value> =
            callback.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let signature = fields
            .get("signature")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if !verify_callback_signature(&fields, signature, &self.config.ipn_secret) {
            return Err(CoreError::Verification(
                "gateway callback signature mismatch".into(),
            ));
        }

        let status = fields
            .get("payment_status")
            .map(json_value_string)
            .unwrap_or_default();
        if status != "finished" {
            return Ok(VerifyOutcome::NotFound);
        }

        let tx_ref = fields
            .get("payment_id")
            .map(json_value_string)
            .unwrap_or_else(|| "gateway".to_string());
        Ok(VerifyOutcome::Confirmed { tx_ref })
    }

    /// Pull the payment state directly from the gateway API.
    pub async fn status(&self, gateway_payment_id: &str) -> CoreResult<VerifyOutcome> {
        let resp = self
            .client
            .get(format!("{}/payment/{}", self.config.base_url, gateway_payment_id))
            .header("x-api-key", &self.config.api_key)
            .send()
            .await?
            .error_for_status()
            .map_err(CoreError::from)?;

        let state: serde_json::Value = resp.json().await?;
        let status = state
            .get("payment_status")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Ok(if status == "finished" {
            VerifyOutcome::Confirmed {
                tx_ref: gateway_payment_id.to_string(),
            }
        } else {
            VerifyOutcome::NotFound
        })
    }
}

/// Canonical string the gateway signs: fields sorted by key, joined as
/// `k=v&...`, with the signature field itself excluded.
pub(crate) fn signature_base(fields: &BTreeMap<String, serde_json::Value>) -> String {
    fields
        .iter()
        .filter(|(k, _)| k.as_str() != "signature")
        .map(|(k, v)| format!("{}={}", k, json_value_string(v)))
        .collect::<Vec<_>>()
        .join("&")
}

pub(crate) fn compute_signature(
    fields: &BTreeMap<String, serde_json::Value>,
    secret: &str,
) -> Option<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(signature_base(fields).as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a callback signature. Returns false for an empty
/// secret, an empty or non-hex signature, or a digest mismatch.
pub(crate) fn verify_callback_signature(
    fields: &BTreeMap<String, serde_json::Value>,
    signature: &str,
    secret: &str,
) -> bool {
    if secret.is_empty() || signature.is_empty() {
        return false;
    }
    let Ok(provided) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signature_base(fields).as_bytes());
    mac.verify_slice(&provided).is_ok()
}

/// String form used for signing: raw string content for strings, JSON
/// serialization for everything else.
fn json_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback_fields() -> BTreeMap<String, serde_json::Value> {
        let mut fields = BTreeMap::new();
        fields.insert("payment_id".to_string(), json!(4385012991_i64));
        fields.insert("payment_status".to_string(), json!("finished"));
        fields.insert("order_id".to_string(), json!("GW_7_abc"));
        fields.insert("price_amount".to_string(), json!(10.0));
        fields
    }

    #[test]
    fn signature_base_is_sorted_and_excludes_signature() {
        let mut fields = callback_fields();
        fields.insert("signature".to_string(), json!("deadbeef"));
        let base = signature_base(&fields);
        assert_eq!(
            base,
            "order_id=GW_7_abc&payment_id=4385012991&payment_status=finished&price_amount=10.0"
        );
    }

    #[test]
    fn valid_signature_verifies() {
        let fields = callback_fields();
        let sig = compute_signature(&fields, "topsecret").unwrap();
        assert!(verify_callback_signature(&fields, &sig, "topsecret"));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut fields = callback_fields();
        let sig = compute_signature(&fields, "topsecret").unwrap();
        fields.insert("price_amount".to_string(), json!(0.01));
        assert!(!verify_callback_signature(&fields, &sig, "topsecret"));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let fields = callback_fields();
        let sig = compute_signature(&fields, "topsecret").unwrap();
        assert!(!verify_callback_signature(&fields, &sig, "other"));
    }

    #[test]
    fn missing_or_garbage_signature_fails_closed() {
        let fields = callback_fields();
        assert!(!verify_callback_signature(&fields, "", "topsecret"));
        assert!(!verify_callback_signature(&fields, "not-hex!!", "topsecret"));
    }

    #[test]
    fn unconfigured_secret_fails_closed() {
        let fields = callback_fields();
        let sig = compute_signature(&fields, "topsecret").unwrap();
        assert!(!verify_callback_signature(&fields, &sig, ""));
    }

    #[test]
    fn string_values_sign_without_quotes() {
        assert_eq!(json_value_string(&json!("abc")), "abc");
        assert_eq!(json_value_string(&json!(42)), "42");
        assert_eq!(json_value_string(&json!(true)), "true");
    }
}

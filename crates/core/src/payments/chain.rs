//! On-chain transfer provider
//!
//! The primary rail. Initiation quotes the amount in the chain's native
//! nano-units using a fetched exchange rate (with a fixed conservative
//! fallback when the rate source is down) and generates a unique memo.
//! Verification polls the wallet's recent-transaction feed and matches by
//! memo equality and amount >= expected.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;

use relaypass_shared::ChainConfig;

use crate::error::{CoreError, CoreResult};
use crate::payments::{order_reference, InitiatedPayment, Payment, ProviderKind, VerifyOutcome};

/// Conservative rate used when the rate source is unreachable. Quoting low
/// means we ask for slightly more native units, never less.
const FALLBACK_RATE_USD: f64 = 2.5;

const NANO_PER_UNIT: f64 = 1e9;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// One transaction from the wallet feed. Fields we do not match on are
/// ignored.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChainTx {
    #[serde(default)]
    pub comment: Option<String>,
    /// Amount in nano-units, as the feed serializes it (string).
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TxFeed {
    #[serde(default)]
    result: Vec<ChainTx>,
}

pub struct ChainProvider {
    config: ChainConfig,
    client: reqwest::Client,
}

impl ChainProvider {
    pub fn new(config: ChainConfig) -> Self {
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
        let rate = self.fetch_rate().await;
        let amount_nano = quote_nano(amount_cents, rate);
        let memo = order_reference(&self.config.memo_prefix, account_id);
        let transfer_url = format!(
            "transfer://{}?amount={}&text={}",
            self.config.wallet_address, amount_nano, memo
        );

        Ok(InitiatedPayment {
            provider: ProviderKind::ChainTransfer,
            provider_payment_id: memo.clone(),
            payload: json!({
                "wallet_address": self.config.wallet_address,
                "amount_nano": amount_nano,
                "amount_cents": amount_cents,
                "rate_usd": rate,
                "memo": memo,
                "transfer_url": transfer_url,
                "description": description,
                "expires_at": (OffsetDateTime::now_utc() + time::Duration::hours(1)).to_string(),
            }),
        })
    }

    /// Check the wallet feed for a transfer matching this payment's memo
    /// with at least the quoted amount.
    pub async fn verify(&self, payment: &Payment) -> CoreResult<VerifyOutcome> {
        let payload = payment
            .payload
            .as_ref()
            .ok_or_else(|| CoreError::Verification("payment has no initiation payload".into()))?;
        let memo = payload
            .get("memo")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Verification("payment payload has no memo".into()))?;
        let expected_nano = payload
            .get("amount_nano")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let transactions = self.wallet_transactions().await?;
        Ok(match match_transfer(&transactions, memo, expected_nano) {
            Some(tx) => VerifyOutcome::Confirmed {
                tx_ref: tx.hash.clone().unwrap_or_else(|| memo.to_string()),
            },
            None => VerifyOutcome::NotFound,
        })
    }

    /// Status by memo only, without an amount check.
    pub async fn status(&self, memo: &str) -> CoreResult<VerifyOutcome> {
        let transactions = self.wallet_transactions().await?;
        Ok(match match_transfer(&transactions, memo, 0) {
            Some(tx) => VerifyOutcome::Confirmed {
                tx_ref: tx.hash.clone().unwrap_or_else(|| memo.to_string()),
            },
            None => VerifyOutcome::NotFound,
        })
    }

    async fn fetch_rate(&self) -> f64 {
        let url = format!("{}/getRate", self.config.api_endpoint);
        let fetched: Result<f64, CoreError> = async {
            let resp = self
                .client
                .get(&url)
                .query(&[("api_key", self.config.api_key.as_str())])
                .send()
                .await?
                .error_for_status()
                .map_err(CoreError::from)?;
            let body: serde_json::Value = resp.json().await?;
            body.get("usd")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| CoreError::Provider("rate feed returned no usd field".into()))
        }
        .await;

        match fetched {
            Ok(rate) if rate > 0.0 => rate,
            Ok(_) | Err(_) => {
                tracing::warn!(fallback = FALLBACK_RATE_USD, "Rate source unavailable, using fallback");
                FALLBACK_RATE_USD
            }
        }
    }

    async fn wallet_transactions(&self) -> CoreResult<Vec<ChainTx>> {
        let url = format!("{}/getTransactions", self.config.api_endpoint);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("address", self.config.wallet_address.as_str()),
                ("limit", "50"),
                ("api_key", self.config.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(CoreError::from)?;
        let feed: TxFeed = resp.json().await?;
        Ok(feed.result)
    }
}

/// Convert cents to nano-units at `rate` USD per native unit, rounding up
/// so the quoted transfer always covers the price.
pub(crate) fn quote_nano(amount_cents: i64, rate_usd: f64) -> i64 {
    let usd = amount_cents as f64 / 100.0;
    (usd / rate_usd * NANO_PER_UNIT).ceil() as i64
}

/// Find a feed transaction with exactly this memo and at least the expected
/// amount.
pub(crate) fn match_transfer<'a>(
    transactions: &'a [ChainTx],
    memo: &str,
    expected_nano: i64,
) -> Option<&'a ChainTx> {
    transactions.iter().find(|tx| {
        let memo_matches = tx.comment.as_deref() == Some(memo);
        let value_nano: i64 = tx
            .value
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        memo_matches && value_nano >= expected_nano
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(comment: &str, value: &str) -> ChainTx {
        ChainTx {
            comment: Some(comment.to_string()),
            value: Some(value.to_string()),
            hash: Some(format!("hash_{comment}")),
        }
    }

    #[test]
    fn quote_rounds_up() {
        // $10.00 at $2.50/unit = 4 units = 4e9 nano exactly.
        assert_eq!(quote_nano(1000, 2.5), 4_000_000_000);
        // $1.00 at $3.00/unit = 0.333... units, rounded up.
        assert_eq!(quote_nano(100, 3.0), 333_333_334);
    }

    #[test]
    fn matches_memo_and_sufficient_amount() {
        let txs = vec![tx("RELAY_1_abc", "3999999999"), tx("RELAY_1_def", "4000000000")];
        let found = match_transfer(&txs, "RELAY_1_def", 4_000_000_000).unwrap();
        assert_eq!(found.hash.as_deref(), Some("hash_RELAY_1_def"));
    }

    #[test]
    fn underpaid_transfer_does_not_match() {
        let txs = vec![tx("RELAY_1_abc", "3999999999")];
        assert!(match_transfer(&txs, "RELAY_1_abc", 4_000_000_000).is_none());
    }

    #[test]
    fn overpaid_transfer_matches() {
        let txs = vec![tx("RELAY_1_abc", "5000000000")];
        assert!(match_transfer(&txs, "RELAY_1_abc", 4_000_000_000).is_some());
    }

    #[test]
    fn memo_must_match_exactly() {
        let txs = vec![tx("RELAY_1_abc_extra", "9000000000")];
        assert!(match_transfer(&txs, "RELAY_1_abc", 0).is_none());
    }

    #[test]
    fn malformed_value_is_treated_as_zero() {
        let txs = vec![ChainTx {
            comment: Some("m".into()),
            value: Some("not-a-number".into()),
            hash: None,
        }];
        assert!(match_transfer(&txs, "m", 1).is_none());
        // With no amount expectation the memo alone matches.
        assert!(match_transfer(&txs, "m", 0).is_some());
    }
}

//! Outbound notifications
//!
//! Thin push channel for user-facing notices (expiry reminders, settlement
//! confirmations) and operator escalations. Delivery is best-effort: the
//! caller's flow never fails because a notice could not be pushed, but every
//! failure is logged.

use std::time::Duration;

use serde_json::json;

use relaypass_shared::Config;

use crate::error::{CoreError, CoreResult};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub enum NotificationChannel {
    /// POST `{recipient, message}` to a configured endpoint.
    Http {
        endpoint: String,
        client: reqwest::Client,
    },
    /// No endpoint configured. Sends are recorded in the log only.
    Disabled,
}

pub struct Notifier {
    channel: NotificationChannel,
    operator_alert_id: Option<i64>,
}

impl Notifier {
    pub fn new(config: &Config) -> Self {
        let channel = match &config.notify_endpoint {
            Some(endpoint) => NotificationChannel::Http {
                endpoint: endpoint.clone(),
                client: reqwest::Client::builder()
                    .timeout(DELIVERY_TIMEOUT)
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            },
            None => NotificationChannel::Disabled,
        };
        Self {
            channel,
            operator_alert_id: config.operator_alert_id,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.channel, NotificationChannel::Http { .. })
    }

    /// Push one message to one external principal. Returns Err on delivery
    /// failure so callers that care (audit trail) can record it; most call
    /// sites log and move on.
    pub async fn send(&self, recipient: i64, message: &str) -> CoreResult<()> {
        match &self.channel {
            NotificationChannel::Http { endpoint, client } => {
                let resp = client
                    .post(endpoint)
                    .json(&json!({ "recipient": recipient, "message": message }))
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(CoreError::Provider(format!(
                        "notification endpoint returned {}",
                        resp.status()
                    )));
                }
                tracing::debug!(recipient, "Notification delivered");
                Ok(())
            }
            NotificationChannel::Disabled => {
                tracing::debug!(recipient, message, "Notification channel disabled, dropping");
                Ok(())
            }
        }
    }

    /// Escalate to the operator channel, if one is configured. Never fails
    /// the caller.
    pub async fn alert_operator(&self, message: &str) {
        let Some(operator) = self.operator_alert_id else {
            tracing::warn!(message, "Operator alert with no operator channel configured");
            return;
        };
        if let Err(e) = self.send(operator, message).await {
            tracing::error!(error = %e, "Operator alert delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(endpoint: Option<&str>, operator: Option<i64>) -> Notifier {
        let channel = match endpoint {
            Some(e) => NotificationChannel::Http {
                endpoint: e.to_string(),
                client: reqwest::Client::new(),
            },
            None => NotificationChannel::Disabled,
        };
        Notifier {
            channel,
            operator_alert_id: operator,
        }
    }

    #[tokio::test]
    async fn disabled_channel_accepts_sends() {
        let n = notifier(None, None);
        assert!(!n.is_enabled());
        assert!(n.send(42, "hello").await.is_ok());
    }

    #[tokio::test]
    async fn operator_alert_without_channel_is_a_no_op() {
        // Must not panic or error even with nothing configured.
        notifier(None, None).alert_operator("relay down").await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_failure() {
        let n = notifier(Some("http://127.0.0.1:1/notify"), None);
        assert!(n.is_enabled());
        assert!(n.send(42, "hello").await.is_err());
    }
}

//! Core error taxonomy
//!
//! Provider failures are transient and absorbed by the payment fallback loop;
//! verification failures leave the payment pending for retry; database errors
//! abort the current operation; configuration errors are startup-fatal and
//! never reach request handling; invariant violations carry a message specific
//! enough for the caller to act on.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A settlement provider was unreachable or rejected the request.
    /// Triggers fallback to the next provider in priority order.
    #[error("provider error: {0}")]
    Provider(String),

    /// Every candidate provider failed. Carries the last failure's detail.
    #[error("all payment providers failed: {0}")]
    AllProvidersFailed(String),

    /// The provider was reachable but the payment is not confirmed.
    /// The payment stays pending and can be re-verified later.
    #[error("payment not confirmed: {0}")]
    Verification(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A domain rule was about to be broken, e.g. granting a trial to an
    /// account that already holds an active grant.
    #[error("{0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Credential encryption or decryption failed.
    #[error("credential encryption error: {0}")]
    Encryption(String),
}

impl From<relaypass_shared::ConfigError> for CoreError {
    fn from(e: relaypass_shared::ConfigError) -> Self {
        CoreError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Provider(e.to_string())
    }
}

impl CoreError {
    /// True for failures the payment fallback loop should absorb.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, CoreError::Provider(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_failures_are_absorbable() {
        assert!(CoreError::Provider("timeout".into()).is_provider_failure());
        assert!(!CoreError::Verification("pending".into()).is_provider_failure());
        assert!(!CoreError::AllProvidersFailed("x".into()).is_provider_failure());
    }

    #[test]
    fn invariant_violation_message_is_verbatim() {
        let e = CoreError::InvariantViolation("account 7 already has an active grant".into());
        assert_eq!(e.to_string(), "account 7 already has an active grant");
    }
}

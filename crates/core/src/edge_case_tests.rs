// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Orchestration Core
//!
//! Tests critical boundary conditions and race conditions in:
//! - Grant lifecycle (GRNT-01 to GRNT-05)
//! - Payment rails and fallback (PAY-01 to PAY-05)
//! - Credential encryption (CRED-01 to CRED-06)
//! - Commission accrual (COMM-01 to COMM-03)
//! - Gateway callback signatures (SIG-01 to SIG-04)
//! - Per-account serialization (LOCK-01 to LOCK-02)

#[cfg(test)]
mod grant_lifecycle_tests {
    use crate::subscriptions::GrantStatus;

    // =========================================================================
    // GRNT-01: Expired is terminal - nothing revives an expired grant
    // =========================================================================
    #[test]
    fn test_expired_grant_is_never_revived() {
        use GrantStatus::*;
        for to in [Trial, Active, Cancelled, Expired] {
            assert!(
                !GrantStatus::can_transition(Expired, to),
                "expired must not move to {to:?}"
            );
        }
    }

    // =========================================================================
    // GRNT-02: Trial promotes to Active on paid extension, never the reverse
    // =========================================================================
    #[test]
    fn test_trial_promotion_is_one_way() {
        assert!(GrantStatus::can_transition(
            GrantStatus::Trial,
            GrantStatus::Active
        ));
        assert!(!GrantStatus::can_transition(
            GrantStatus::Active,
            GrantStatus::Trial
        ));
    }

    // =========================================================================
    // GRNT-03: Cancelled can be reinstated to Active, but not to Trial
    // =========================================================================
    #[test]
    fn test_cancelled_reinstatement() {
        assert!(GrantStatus::can_transition(
            GrantStatus::Cancelled,
            GrantStatus::Active
        ));
        assert!(!GrantStatus::can_transition(
            GrantStatus::Cancelled,
            GrantStatus::Trial
        ));
    }

    // =========================================================================
    // GRNT-04: Trials expire like paid grants do
    // =========================================================================
    #[test]
    fn test_trials_are_live_and_expirable() {
        assert!(GrantStatus::Trial.is_live());
        assert!(GrantStatus::can_transition(
            GrantStatus::Trial,
            GrantStatus::Expired
        ));
    }

    // =========================================================================
    // GRNT-05: No self-transitions anywhere in the table
    // =========================================================================
    #[test]
    fn test_no_self_transitions() {
        use GrantStatus::*;
        for s in [Trial, Active, Expired, Cancelled] {
            assert!(!GrantStatus::can_transition(s, s));
        }
    }
}

#[cfg(test)]
mod payment_rail_tests {
    use crate::payments::{candidate_providers, PaymentStatus, ProviderKind};

    // =========================================================================
    // PAY-01: Fallback order is chain, then wallet, then gateway
    // =========================================================================
    #[test]
    fn test_fallback_priority_order() {
        let order = candidate_providers(None);
        assert_eq!(order[0], ProviderKind::ChainTransfer);
        assert_eq!(order[1], ProviderKind::WalletBalance);
        assert_eq!(order[2], ProviderKind::CryptoGateway);
    }

    // =========================================================================
    // PAY-02: A preferred rail suppresses fallback entirely
    // =========================================================================
    #[test]
    fn test_preferred_rail_has_no_fallback() {
        let order = candidate_providers(Some(ProviderKind::WalletBalance));
        assert_eq!(order, vec![ProviderKind::WalletBalance]);
    }

    // =========================================================================
    // PAY-03: Completed payments never leave completed
    // =========================================================================
    #[test]
    fn test_completed_is_terminal() {
        use PaymentStatus::*;
        for to in [Pending, Completed, Failed, Cancelled] {
            assert!(!PaymentStatus::can_transition(Completed, to));
        }
    }

    // =========================================================================
    // PAY-04: A failed attempt on one rail never poisons another rail's state
    // (distinct correlation columns per rail)
    // =========================================================================
    #[test]
    fn test_rails_have_disjoint_correlation_state() {
        let names: std::collections::HashSet<&str> =
            ProviderKind::PRIORITY.iter().map(|k| k.as_str()).collect();
        assert_eq!(names.len(), 3);
    }

    // =========================================================================
    // PAY-05: Unknown provider labels are rejected, not defaulted
    // =========================================================================
    #[test]
    fn test_unknown_provider_is_an_error() {
        assert!(ProviderKind::parse("bank_card").is_err());
        assert!(ProviderKind::parse("").is_err());
    }
}

#[cfg(test)]
mod credential_encryption_tests {
    use crate::credentials::{decrypt_value, encrypt_value, generate_password, generate_username};
    use aes_gcm::{Aes256Gcm, Key, KeyInit};

    fn cipher(byte: u8) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&[byte; 32]))
    }

    // =========================================================================
    // CRED-01: Round trip recovers the exact plaintext
    // =========================================================================
    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let c = cipher(7);
        let stored = encrypt_value(&c, "s3cret-p@ss").unwrap();
        assert_ne!(stored, "s3cret-p@ss");
        assert_eq!(decrypt_value(&c, &stored).unwrap(), "s3cret-p@ss");
    }

    // =========================================================================
    // CRED-02: Empty string maps to empty string, both directions
    // =========================================================================
    #[test]
    fn test_empty_is_identity() {
        let c = cipher(7);
        assert_eq!(encrypt_value(&c, "").unwrap(), "");
        assert_eq!(decrypt_value(&c, "").unwrap(), "");
    }

    // =========================================================================
    // CRED-03: Same plaintext twice yields different ciphertexts (fresh nonce)
    // =========================================================================
    #[test]
    fn test_nonce_freshness() {
        let c = cipher(7);
        let a = encrypt_value(&c, "same").unwrap();
        let b = encrypt_value(&c, "same").unwrap();
        assert_ne!(a, b);
    }

    // =========================================================================
    // CRED-04: Wrong key fails with an error, not garbage output
    // =========================================================================
    #[test]
    fn test_wrong_key_errors() {
        let stored = encrypt_value(&cipher(7), "value").unwrap();
        assert!(decrypt_value(&cipher(8), &stored).is_err());
    }

    // =========================================================================
    // CRED-05: Corrupt or truncated storage errors instead of panicking
    // =========================================================================
    #[test]
    fn test_garbage_storage_errors() {
        let c = cipher(7);
        assert!(decrypt_value(&c, "not base64 !!!").is_err());
        // Valid base64 but shorter than a nonce.
        assert!(decrypt_value(&c, "QUJD").is_err());
    }

    // =========================================================================
    // CRED-06: Generated identities stay within relay limits
    // =========================================================================
    #[test]
    fn test_generated_identity_shapes() {
        let username = generate_username("rp_", 9_999_999, "eu");
        assert!(username.len() <= 32);
        assert!(username.starts_with("rp_"));

        let password = generate_password();
        assert_eq!(password.len(), 16);
        assert!(password.bytes().any(|b| b.is_ascii_uppercase()));
        assert!(password.bytes().any(|b| b.is_ascii_lowercase()));
        assert!(password.bytes().any(|b| b.is_ascii_digit()));
    }
}

#[cfg(test)]
mod commission_tests {
    use crate::commission::commission_cents;

    // =========================================================================
    // COMM-01: Sub-cent commission floors to zero rather than rounding up
    // =========================================================================
    #[test]
    fn test_subcent_commission_is_zero() {
        assert_eq!(commission_cents(4, 20), 0);
        assert_eq!(commission_cents(5, 20), 1);
    }

    // =========================================================================
    // COMM-02: Full percent range behaves
    // =========================================================================
    #[test]
    fn test_percent_extremes() {
        assert_eq!(commission_cents(1000, 0), 0);
        assert_eq!(commission_cents(1000, 100), 1000);
    }

    // =========================================================================
    // COMM-03: Extreme amounts do not overflow into negatives
    // =========================================================================
    #[test]
    fn test_no_overflow() {
        assert!(commission_cents(i64::MAX, 99) >= 0);
    }
}

#[cfg(test)]
mod gateway_signature_tests {
    use crate::payments::gateway::{compute_signature, verify_callback_signature};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn callback() -> BTreeMap<String, serde_json::Value> {
        let mut fields = BTreeMap::new();
        fields.insert("payment_id".to_string(), json!(123456));
        fields.insert("payment_status".to_string(), json!("finished"));
        fields.insert("order_id".to_string(), json!("GW_1_aaaa"));
        fields
    }

    // =========================================================================
    // SIG-01: Authentic callback verifies
    // =========================================================================
    #[test]
    fn test_authentic_callback_verifies() {
        let fields = callback();
        let sig = compute_signature(&fields, "ipn-secret").unwrap();
        assert!(verify_callback_signature(&fields, &sig, "ipn-secret"));
    }

    // =========================================================================
    // SIG-02: One flipped field invalidates the signature
    // =========================================================================
    #[test]
    fn test_single_field_tamper_detected() {
        let fields = callback();
        let sig = compute_signature(&fields, "ipn-secret").unwrap();
        let mut tampered = fields.clone();
        tampered.insert("payment_status".to_string(), json!("waiting"));
        assert!(!verify_callback_signature(&tampered, &sig, "ipn-secret"));
    }

    // =========================================================================
    // SIG-03: Extra injected fields invalidate the signature
    // =========================================================================
    #[test]
    fn test_injected_field_detected() {
        let fields = callback();
        let sig = compute_signature(&fields, "ipn-secret").unwrap();
        let mut extended = fields.clone();
        extended.insert("amount".to_string(), json!(1));
        assert!(!verify_callback_signature(&extended, &sig, "ipn-secret"));
    }

    // =========================================================================
    // SIG-04: Missing secret rejects even a correctly computed signature
    // =========================================================================
    #[test]
    fn test_missing_secret_fails_closed() {
        let fields = callback();
        let sig = compute_signature(&fields, "ipn-secret").unwrap();
        assert!(!verify_callback_signature(&fields, &sig, ""));
    }
}

#[cfg(test)]
mod lock_tests {
    use crate::locks::KeyedLocks;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // =========================================================================
    // LOCK-01: Two tasks on one account never overlap their critical sections
    // =========================================================================
    #[tokio::test]
    async fn test_same_account_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(42).await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // LOCK-02: Distinct accounts do not contend
    // =========================================================================
    #[tokio::test]
    async fn test_distinct_accounts_parallel() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(1).await;
        // Would deadlock if key 2 shared key 1's mutex.
        let _b = locks.lock(2).await;
    }
}

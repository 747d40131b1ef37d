//! Credential vault
//!
//! Issues and revokes per-account, per-region relay credentials. Secrets are
//! AES-256-GCM encrypted before they touch the database; plaintext exists
//! only transiently during generation and during decryption for delivery.
//! Revocation never deletes a row: it stamps `revoked_at` and clears the
//! active flag so history stays queryable.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::Rng;
use sqlx::PgPool;
use time::OffsetDateTime;

use relaypass_shared::RegionServer;

use crate::error::{CoreError, CoreResult};

const USERNAME_MAX_LEN: usize = 32;
const USERNAME_SUFFIX_LEN: usize = 4;
const PASSWORD_LEN: usize = 16;
const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";
const NONCE_LEN: usize = 12;

/// One credential row. Username and password are stored encrypted; use
/// [`CredentialService::decrypt_pair`] for delivery.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Credential {
    pub id: i64,
    pub account_id: i64,
    pub region: String,
    pub relay_host: String,
    pub relay_port: i32,
    pub username_enc: String,
    pub password_enc: String,
    pub is_active: bool,
    pub assigned_at: OffsetDateTime,
    pub revoked_at: Option<OffsetDateTime>,
}

const CREDENTIAL_COLUMNS: &str = "id, account_id, region, relay_host, relay_port, \
     username_enc, password_enc, is_active, assigned_at, revoked_at";

pub struct CredentialService {
    pool: PgPool,
    cipher: Aes256Gcm,
    servers: HashMap<String, RegionServer>,
}

impl CredentialService {
    pub fn new(pool: PgPool, key: &[u8; 32], servers: HashMap<String, RegionServer>) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self {
            pool,
            cipher,
            servers,
        }
    }

    /// Get-or-create the active credential for (account, region).
    ///
    /// Idempotent: an existing active credential is returned unchanged.
    /// Callers must hold the account's advisory lock.
    pub async fn provision(&self, account_id: i64, region: &str) -> CoreResult<Credential> {
        if let Some(existing) = self.active_credential(account_id, region).await? {
            tracing::debug!(
                account_id = account_id,
                region = %region,
                "Reusing existing active credential"
            );
            return Ok(existing);
        }

        let server = self.servers.get(region).ok_or_else(|| {
            CoreError::Config(format!("no relay server configured for region '{region}'"))
        })?;

        let username = generate_username(&server.username_prefix, account_id, region);
        let password = generate_password();

        let credential: Credential = sqlx::query_as(&format!(
            "INSERT INTO credentials \
                 (account_id, region, relay_host, relay_port, username_enc, password_enc) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {CREDENTIAL_COLUMNS}"
        ))
        .bind(account_id)
        .bind(region)
        .bind(&server.host)
        .bind(i32::from(server.port))
        .bind(encrypt_value(&self.cipher, &username)?)
        .bind(encrypt_value(&self.cipher, &password)?)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            account_id = account_id,
            region = %region,
            credential_id = credential.id,
            "Provisioned relay credential"
        );
        Ok(credential)
    }

    pub async fn active_credential(
        &self,
        account_id: i64,
        region: &str,
    ) -> CoreResult<Option<Credential>> {
        let credential = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials \
             WHERE account_id = $1 AND region = $2 AND is_active \
             ORDER BY assigned_at DESC LIMIT 1"
        ))
        .bind(account_id)
        .bind(region)
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }

    /// Revoke the account's active credentials, optionally scoped to one
    /// region. Returns the number revoked so callers can tell "nothing to
    /// revoke" from an error.
    pub async fn revoke(&self, account_id: i64, region: Option<&str>) -> CoreResult<u64> {
        let revoked = match region {
            Some(region) => {
                sqlx::query(
                    "UPDATE credentials SET is_active = false, revoked_at = NOW() \
                     WHERE account_id = $1 AND region = $2 AND is_active",
                )
                .bind(account_id)
                .bind(region)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            None => {
                sqlx::query(
                    "UPDATE credentials SET is_active = false, revoked_at = NOW() \
                     WHERE account_id = $1 AND is_active",
                )
                .bind(account_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };

        if revoked > 0 {
            tracing::info!(
                account_id = account_id,
                region = region.unwrap_or("*"),
                revoked = revoked,
                "Revoked relay credentials"
            );
        }
        Ok(revoked)
    }

    /// Revoke-then-provision for one (account, region). Used for region
    /// changes and credential hygiene. Callers must hold the account's
    /// advisory lock so no other provision/revoke interleaves.
    pub async fn rotate(&self, account_id: i64, region: &str) -> CoreResult<Credential> {
        self.revoke(account_id, Some(region)).await?;
        self.provision(account_id, region).await
    }

    pub async fn active_count(&self, region: Option<&str>) -> CoreResult<i64> {
        let count: i64 = match region {
            Some(region) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM credentials WHERE is_active AND region = $1",
                )
                .bind(region)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM credentials WHERE is_active")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    /// Active credential count per region, for operator dashboards.
    pub async fn region_breakdown(&self) -> CoreResult<Vec<(String, i64)>> {
        let rows = sqlx::query_as(
            "SELECT region, COUNT(*) FROM credentials WHERE is_active \
             GROUP BY region ORDER BY region",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Accounts holding active credentials without a live grant. These are
    /// drift (manual edits, crashed revocations) that the hygiene pass mops
    /// up.
    pub async fn orphaned_credential_accounts(&self) -> CoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT DISTINCT c.account_id
            FROM credentials c
            WHERE c.is_active
              AND NOT EXISTS (
                  SELECT 1 FROM grants g
                  WHERE g.account_id = c.account_id
                    AND g.status IN ('trial', 'active')
                    AND g.ends_at > NOW()
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Decrypt a credential's secret pair for delivery to the account.
    pub fn decrypt_pair(&self, credential: &Credential) -> CoreResult<(String, String)> {
        Ok((
            decrypt_value(&self.cipher, &credential.username_enc)?,
            decrypt_value(&self.cipher, &credential.password_enc)?,
        ))
    }
}

/// Encrypt a value for storage: random nonce || ciphertext, base64.
/// The empty string maps to the empty string, never to a ciphertext.
pub(crate) fn encrypt_value(cipher: &Aes256Gcm, plaintext: &str) -> CoreResult<String> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| CoreError::Encryption(e.to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(out))
}

pub(crate) fn decrypt_value(cipher: &Aes256Gcm, stored: &str) -> CoreResult<String> {
    if stored.is_empty() {
        return Ok(String::new());
    }
    let raw = base64::engine::general_purpose::STANDARD
        .decode(stored)
        .map_err(|e| CoreError::Encryption(e.to_string()))?;
    if raw.len() <= NONCE_LEN {
        return Err(CoreError::Encryption("ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| CoreError::Encryption(e.to_string()))?;
    String::from_utf8(plaintext).map_err(|e| CoreError::Encryption(e.to_string()))
}

/// Deterministic prefix + account id + region + random suffix, bounded to
/// the relay servers' 32-char username limit.
pub(crate) fn generate_username(prefix: &str, account_id: i64, region: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..USERNAME_SUFFIX_LEN)
        .map(|_| {
            const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
            CHARS[rng.random_range(0..CHARS.len())] as char
        })
        .collect();
    let mut username = format!("{prefix}{account_id}_{}_{suffix}", region.to_lowercase());
    username.truncate(USERNAME_MAX_LEN);
    username
}

/// High-entropy password over letters, digits and a restricted symbol set,
/// guaranteed to mix cases and digits.
pub(crate) fn generate_password() -> String {
    let mut rng = rand::rng();
    loop {
        let password: String = (0..PASSWORD_LEN)
            .map(|_| PASSWORD_CHARSET[rng.random_range(0..PASSWORD_CHARSET.len())] as char)
            .collect();
        let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());
        if has_upper && has_lower && has_digit {
            return password;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn cipher() -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&[7u8; 32]))
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let c = cipher();
        for input in ["user_42_eu_x9k2", "p@ssW0rd!#", "αβγ unicode ok", "a"] {
            let stored = encrypt_value(&c, input).unwrap();
            assert_ne!(stored, input);
            assert_eq!(decrypt_value(&c, &stored).unwrap(), input);
        }
    }

    #[test]
    fn empty_string_is_identity() {
        let c = cipher();
        assert_eq!(encrypt_value(&c, "").unwrap(), "");
        assert_eq!(decrypt_value(&c, "").unwrap(), "");
    }

    #[test]
    fn ciphertexts_are_nondeterministic() {
        let c = cipher();
        let a = encrypt_value(&c, "same input").unwrap();
        let b = encrypt_value(&c, "same input").unwrap();
        // Fresh nonce per encryption.
        assert_ne!(a, b);
        assert_eq!(decrypt_value(&c, &a).unwrap(), decrypt_value(&c, &b).unwrap());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let stored = encrypt_value(&cipher(), "secret").unwrap();
        let other = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&[8u8; 32]));
        assert!(decrypt_value(&other, &stored).is_err());
    }

    #[test]
    fn garbage_ciphertext_is_an_error_not_a_panic() {
        let c = cipher();
        assert!(decrypt_value(&c, "not base64 at all!!!").is_err());
        assert!(decrypt_value(&c, "AAAA").is_err()); // shorter than a nonce
    }

    #[test]
    fn username_shape_and_bound() {
        let name = generate_username("rp_", 42, "EU");
        assert!(name.starts_with("rp_42_eu_"));
        assert!(name.len() <= USERNAME_MAX_LEN);

        let long = generate_username("averylongprefix_", i64::MAX, "somewhere");
        assert!(long.len() <= USERNAME_MAX_LEN);
    }

    #[test]
    fn username_suffix_varies() {
        let a = generate_username("rp_", 1, "us");
        let b = generate_username("rp_", 1, "us");
        assert_ne!(a, b);
    }

    #[test]
    fn password_meets_policy() {
        for _ in 0..20 {
            let p = generate_password();
            assert_eq!(p.len(), PASSWORD_LEN);
            assert!(p.bytes().all(|b| PASSWORD_CHARSET.contains(&b)));
            assert!(p.chars().any(|c| c.is_ascii_uppercase()));
            assert!(p.chars().any(|c| c.is_ascii_lowercase()));
            assert!(p.chars().any(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn regenerated_secrets_differ() {
        // Rotation must never hand back the previous secret pair.
        let p1 = generate_password();
        let p2 = generate_password();
        assert_ne!(p1, p2);
    }
}

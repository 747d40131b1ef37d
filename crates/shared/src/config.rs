//! Process-wide configuration
//!
//! Loaded from the environment once at startup. Missing or malformed required
//! values fail fast here so that request-time code never discovers a broken
//! configuration.

use std::collections::HashMap;

use base64::Engine;
use thiserror::Error;

/// Configuration loading errors. All of these are startup-fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: &'static str, reason: String },
    #[error("no relay servers configured (RELAY_SERVERS)")]
    NoRelayServers,
}

/// A relay server endpoint for one region.
#[derive(Debug, Clone)]
pub struct RegionServer {
    pub region: String,
    pub host: String,
    pub port: u16,
    /// Deterministic prefix for generated usernames on this server.
    pub username_prefix: String,
}

/// On-chain transfer provider settings.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub wallet_address: String,
    pub api_endpoint: String,
    pub api_key: String,
    /// Memo prefix so inbound transfers can be correlated to payments.
    pub memo_prefix: String,
}

/// In-app wallet balance provider settings. Verification is push-based; the
/// platform authenticates its charge callbacks with a shared secret.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub enabled: bool,
    /// Shared secret the platform sends with each charge callback. Callbacks
    /// are rejected outright while this is unset.
    pub callback_secret: String,
}

/// Third-party crypto gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: String,
    pub ipn_secret: String,
    pub base_url: String,
    pub callback_url: String,
}

/// Top-level configuration shared by all binaries.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    /// 32-byte AES-256-GCM key for credentials at rest, base64 in the env.
    pub encryption_key: [u8; 32],

    pub commission_percent: i64,
    pub trial_enabled: bool,
    pub trial_days: i64,

    /// Days-before-expiry offsets at which reminders fire, e.g. [7, 1].
    pub reminder_days: Vec<i64>,
    pub reconcile_interval_secs: u64,

    /// External principal id of the operator alert channel, if any.
    pub operator_alert_id: Option<i64>,
    /// Endpoint the notification channel pushes messages to, if any.
    pub notify_endpoint: Option<String>,

    pub admin_token: String,

    pub chain: ChainConfig,
    pub wallet: WalletConfig,
    pub gateway: GatewayConfig,

    pub relay_servers: HashMap<String, RegionServer>,
    pub default_region: String,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require("DATABASE_URL")?;

        let key_b64 = require("CREDENTIAL_ENCRYPTION_KEY")?;
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|e| ConfigError::InvalidVar {
                var: "CREDENTIAL_ENCRYPTION_KEY",
                reason: e.to_string(),
            })?;
        let encryption_key: [u8; 32] =
            key_bytes
                .try_into()
                .map_err(|v: Vec<u8>| ConfigError::InvalidVar {
                    var: "CREDENTIAL_ENCRYPTION_KEY",
                    reason: format!("expected 32 bytes after base64 decode, got {}", v.len()),
                })?;

        let commission_percent = parse_or("REFERRAL_COMMISSION_PERCENT", 20)?;
        if !(0..=100).contains(&commission_percent) {
            return Err(ConfigError::InvalidVar {
                var: "REFERRAL_COMMISSION_PERCENT",
                reason: format!("{commission_percent} is outside 0..=100"),
            });
        }

        let reminder_days = parse_list("REMINDER_DAYS_BEFORE_EXPIRY", &[7, 1])?;

        let relay_servers = parse_relay_servers(&require("RELAY_SERVERS")?)?;
        if relay_servers.is_empty() {
            return Err(ConfigError::NoRelayServers);
        }
        let default_region = optional("DEFAULT_REGION").unwrap_or_else(|| "us".to_string());
        if !relay_servers.contains_key(&default_region) {
            return Err(ConfigError::InvalidVar {
                var: "DEFAULT_REGION",
                reason: format!("region '{default_region}' has no relay server configured"),
            });
        }

        Ok(Self {
            database_url,
            encryption_key,
            commission_percent,
            trial_enabled: parse_or("TRIAL_ENABLED", true)?,
            trial_days: parse_or("TRIAL_DAYS", 7)?,
            reminder_days,
            reconcile_interval_secs: parse_or("RECONCILE_INTERVAL_SECS", 600)?,
            operator_alert_id: optional("OPERATOR_ALERT_ID")
                .map(|v| {
                    v.parse().map_err(|_| ConfigError::InvalidVar {
                        var: "OPERATOR_ALERT_ID",
                        reason: format!("'{v}' is not an integer"),
                    })
                })
                .transpose()?,
            notify_endpoint: optional("NOTIFY_ENDPOINT"),
            admin_token: require("ADMIN_TOKEN")?,
            chain: ChainConfig {
                wallet_address: require("CHAIN_WALLET_ADDRESS")?,
                api_endpoint: require("CHAIN_API_ENDPOINT")?,
                api_key: optional("CHAIN_API_KEY").unwrap_or_default(),
                memo_prefix: optional("CHAIN_MEMO_PREFIX").unwrap_or_else(|| "RELAY".to_string()),
            },
            wallet: WalletConfig {
                enabled: parse_or("WALLET_PAYMENTS_ENABLED", true)?,
                callback_secret: optional("WALLET_CALLBACK_SECRET").unwrap_or_default(),
            },
            gateway: GatewayConfig {
                api_key: optional("GATEWAY_API_KEY").unwrap_or_default(),
                ipn_secret: optional("GATEWAY_IPN_SECRET").unwrap_or_default(),
                base_url: optional("GATEWAY_BASE_URL")
                    .unwrap_or_else(|| "https://api.nowpayments.io/v1".to_string()),
                callback_url: optional("GATEWAY_CALLBACK_URL").unwrap_or_default(),
            },
            relay_servers,
            default_region,
        })
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(var)),
    }
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(var) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidVar {
            var,
            reason: format!("could not parse '{v}'"),
        }),
        None => Ok(default),
    }
}

fn parse_list(var: &'static str, default: &[i64]) -> Result<Vec<i64>, ConfigError> {
    match optional(var) {
        Some(v) => v
            .split(',')
            .map(|part| {
                part.trim().parse().map_err(|_| ConfigError::InvalidVar {
                    var,
                    reason: format!("'{part}' is not an integer"),
                })
            })
            .collect(),
        None => Ok(default.to_vec()),
    }
}

/// Parse `RELAY_SERVERS`, a semicolon-separated list of
/// `region:host:port:username_prefix` entries.
fn parse_relay_servers(raw: &str) -> Result<HashMap<String, RegionServer>, ConfigError> {
    let mut servers = HashMap::new();
    for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
        let parts: Vec<&str> = entry.trim().split(':').collect();
        if parts.len() != 4 {
            return Err(ConfigError::InvalidVar {
                var: "RELAY_SERVERS",
                reason: format!("entry '{entry}' is not region:host:port:prefix"),
            });
        }
        let port: u16 = parts[2].parse().map_err(|_| ConfigError::InvalidVar {
            var: "RELAY_SERVERS",
            reason: format!("port '{}' is not a valid u16", parts[2]),
        })?;
        if port == 0 {
            return Err(ConfigError::InvalidVar {
                var: "RELAY_SERVERS",
                reason: "port 0 is not routable".to_string(),
            });
        }
        let region = parts[0].to_lowercase();
        servers.insert(
            region.clone(),
            RegionServer {
                region,
                host: parts[1].to_string(),
                port,
                username_prefix: parts[3].to_string(),
            },
        );
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relay_server_list() {
        let servers = parse_relay_servers("us:relay-us.example.com:1080:rp_;eu:relay-eu.example.com:1080:rp_").unwrap();
        assert_eq!(servers.len(), 2);
        let us = &servers["us"];
        assert_eq!(us.host, "relay-us.example.com");
        assert_eq!(us.port, 1080);
        assert_eq!(us.username_prefix, "rp_");
    }

    #[test]
    fn region_key_is_lowercased() {
        let servers = parse_relay_servers("EU:host:1080:p_").unwrap();
        assert!(servers.contains_key("eu"));
    }

    #[test]
    fn rejects_malformed_entry() {
        assert!(parse_relay_servers("us:host:1080").is_err());
        assert!(parse_relay_servers("us:host:notaport:p_").is_err());
        assert!(parse_relay_servers("us:host:0:p_").is_err());
    }

    #[test]
    fn empty_list_is_empty_not_error() {
        // The caller decides whether an empty table is fatal.
        assert!(parse_relay_servers("").unwrap().is_empty());
    }
}

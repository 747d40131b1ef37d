#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Relaypass shared types and configuration
//!
//! Everything here is constructed once at process start and passed by
//! reference into the service constructors. There is no global mutable state.

pub mod config;

pub use config::{
    ChainConfig, Config, ConfigError, GatewayConfig, RegionServer, WalletConfig,
};

//! Engine configuration
//!
//! Defaults match the platform policy. `EngineConfig::from_env` layers
//! `ESCROW_*` environment variables on top, e.g.
//! `ESCROW_DISPUTE_WINDOW_HOURS=48` or `ESCROW_PLATFORM_ADDRESS_BTC=bc1q...`.

use crate::{
    error::EscrowError,
    models::{
        Asset, ReleaseTiming, SpeedProfile, AUTO_RELEASE_DAYS, DISPUTE_WINDOW_HOURS,
    },
    EscrowResult,
};
use chrono::Duration;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Longest auto-release delay accepted from settings
pub const MAX_AUTO_RELEASE_DAYS: i64 = 365;
/// Longest idempotency TTL accepted from settings (30 days)
pub const MAX_IDEMPOTENCY_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Configuration for the escrow engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hours after delivery during which a dispute may be opened
    pub dispute_window_hours: i64,
    /// Days after delivery before funds are released automatically
    pub auto_release_days: i64,
    /// Lifetime of stored idempotency responses
    pub idempotency_ttl_secs: i64,
    /// Optimistic retries before a transition gives up
    pub max_transition_retries: u32,
    /// Settlement worker tick
    pub settlement_poll_interval_secs: u64,
    /// Where the BTC platform fee is paid
    pub platform_address_btc: Option<String>,
    /// Where the XMR platform fee is paid
    pub platform_address_xmr: Option<String>,
    /// Fee profile for BTC payouts when the escrow did not pick one
    pub default_btc_speed: SpeedProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispute_window_hours: DISPUTE_WINDOW_HOURS,
            auto_release_days: AUTO_RELEASE_DAYS,
            idempotency_ttl_secs: 24 * 60 * 60,
            max_transition_retries: 5,
            settlement_poll_interval_secs: 30,
            platform_address_btc: None,
            platform_address_xmr: None,
            default_btc_speed: SpeedProfile::Normal,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `ESCROW_*` environment variables
    pub fn from_env() -> EscrowResult<Self> {
        Self::load(Environment::with_prefix("ESCROW").try_parsing(true))
    }

    fn load(environment: Environment) -> EscrowResult<Self> {
        let settings = Config::builder()
            .add_source(environment)
            .build()
            .map_err(|e| EscrowError::config(format!("Failed to read settings: {}", e)))?;
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| EscrowError::config(format!("Invalid settings: {}", e)))?;
        config.validate()?;

        if config.platform_address_btc.is_none() && config.platform_address_xmr.is_none() {
            warn!("No platform payout address configured, NORMAL settlements will fail");
        }
        Ok(config)
    }

    pub fn validate(&self) -> EscrowResult<()> {
        if self.dispute_window_hours <= 0 {
            return Err(EscrowError::config("dispute_window_hours must be > 0"));
        }
        if self.auto_release_days <= 0 || self.auto_release_days > MAX_AUTO_RELEASE_DAYS {
            return Err(EscrowError::config(format!(
                "auto_release_days must be in 1..={}",
                MAX_AUTO_RELEASE_DAYS
            )));
        }
        let auto_release_hours = self
            .auto_release_days
            .checked_mul(24)
            .ok_or_else(|| EscrowError::config("auto_release_days out of range"))?;
        if self.dispute_window_hours > auto_release_hours {
            return Err(EscrowError::config(
                "dispute window must close before auto-release",
            ));
        }
        if self.idempotency_ttl_secs <= 0 || self.idempotency_ttl_secs > MAX_IDEMPOTENCY_TTL_SECS {
            return Err(EscrowError::config(format!(
                "idempotency_ttl_secs must be in 1..={}",
                MAX_IDEMPOTENCY_TTL_SECS
            )));
        }
        if Duration::try_hours(self.dispute_window_hours).is_none()
            || Duration::try_days(self.auto_release_days).is_none()
            || Duration::try_seconds(self.idempotency_ttl_secs).is_none()
        {
            return Err(EscrowError::config("durations out of range"));
        }
        if self.settlement_poll_interval_secs == 0 {
            return Err(EscrowError::config("settlement_poll_interval_secs must be > 0"));
        }
        for (name, address) in [
            ("platform_address_btc", &self.platform_address_btc),
            ("platform_address_xmr", &self.platform_address_xmr),
        ] {
            if address.as_deref().map(str::trim) == Some("") {
                return Err(EscrowError::config(format!("{} cannot be blank", name)));
            }
        }
        Ok(())
    }

    /// Values are clamped to the ranges `validate` accepts
    pub fn release_timing(&self) -> ReleaseTiming {
        let auto_release_days = self.auto_release_days.clamp(1, MAX_AUTO_RELEASE_DAYS);
        ReleaseTiming {
            dispute_window: Duration::hours(
                self.dispute_window_hours.clamp(1, auto_release_days * 24),
            ),
            auto_release_delay: Duration::days(auto_release_days),
        }
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::seconds(self.idempotency_ttl_secs.clamp(1, MAX_IDEMPOTENCY_TTL_SECS))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.settlement_poll_interval_secs)
    }

    /// Platform fee destination for an asset
    pub fn platform_address(&self, asset: Asset) -> EscrowResult<&str> {
        let address = match asset {
            Asset::Btc => self.platform_address_btc.as_deref(),
            Asset::Xmr => self.platform_address_xmr.as_deref(),
        };
        address.ok_or_else(|| {
            EscrowError::config(format!("no platform payout address configured for {}", asset))
        })
    }
}

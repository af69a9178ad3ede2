//! Core data models for the escrow system
//!
//! This module contains the enumerated states, numeric constants, pure
//! validation helpers, and the row types for every table of the escrow
//! schema. All monetary values are integer minor units (sats for BTC,
//! atomic units for XMR).

use crate::{error::EscrowError, EscrowResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Implements `as_str`, `Display` and `FromStr` over the fixed column values.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        impl $name {
            /// Column value as stored in the schema
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $value,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EscrowError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($value => Ok(Self::$variant),)+
                    other => Err(EscrowError::invalid_argument(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Supported payment rails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Xmr,
}

string_enum!(Asset { Btc => "BTC", Xmr => "XMR" });

/// Escrow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowState {
    /// Created, waiting for confirmed deposits
    Created,
    /// Deposits confirmed and held
    Funded,
    /// Seller delivered; dispute window running
    Released,
    /// Under dispute
    Disputed,
    /// Dispute decided, settlement pending
    Resolved,
    /// Settlement confirmed on chain
    Closed,
}

string_enum!(EscrowState {
    Created => "CREATED",
    Funded => "FUNDED",
    Released => "RELEASED",
    Disputed => "DISPUTED",
    Resolved => "RESOLVED",
    Closed => "CLOSED",
});

impl EscrowState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check if this state allows opening a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Funded | Self::Released)
    }
}

/// Why a payout is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutKind {
    Normal,
    Dispute,
}

string_enum!(PayoutKind { Normal => "NORMAL", Dispute => "DISPUTE" });

/// On-chain status of a payout transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Broadcast,
    Confirmed,
    Failed,
}

string_enum!(PayoutStatus {
    Broadcast => "BROADCAST",
    Confirmed => "CONFIRMED",
    Failed => "FAILED",
});

/// Trade participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Seller,
    Buyer,
    Platform,
}

string_enum!(Role {
    Seller => "SELLER",
    Buyer => "BUYER",
    Platform => "PLATFORM",
});

/// BTC fee-rate profile; Monero has no fee-speed concept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedProfile {
    Fast,
    Normal,
    Slow,
}

string_enum!(SpeedProfile {
    Fast => "fast",
    Normal => "normal",
    Slow => "slow",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    Open,
    Closed,
}

string_enum!(DisputeStatus { Open => "OPEN", Closed => "CLOSED" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    Pending,
    Confirmed,
}

string_enum!(DepositStatus {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
});

/// Ledger account bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerAccountKind {
    /// Funds held for one escrow
    Escrow,
    /// Amounts credited to the seller of one escrow
    Seller,
    /// Amounts credited to the buyer of one escrow
    Buyer,
    /// Platform revenue
    Platform,
    /// Counterparty outside the platform (chain inflows, network fees)
    External,
}

string_enum!(LedgerAccountKind {
    Escrow => "ESCROW",
    Seller => "SELLER",
    Buyer => "BUYER",
    Platform => "PLATFORM",
    External => "EXTERNAL",
});

impl From<Role> for LedgerAccountKind {
    fn from(role: Role) -> Self {
        match role {
            Role::Seller => Self::Seller,
            Role::Buyer => Self::Buyer,
            Role::Platform => Self::Platform,
        }
    }
}

/// Minimum confirmations before a BTC deposit counts
pub const BTC_CONFIRMATIONS_MIN: i32 = 10;
/// Minimum confirmations before an XMR deposit counts
pub const XMR_CONFIRMATIONS_MIN: i32 = 3;
/// BTC outputs below this many sats are not economically spendable
pub const BTC_DUST_SATS: i64 = 1_000;
/// Platform fee in basis points of the price (3%)
pub const PLATFORM_FEE_BPS: i64 = 300;
/// Window after delivery during which either party may dispute
pub const DISPUTE_WINDOW_HOURS: i64 = 72;
/// Delay after delivery before funds are released automatically
pub const AUTO_RELEASE_DAYS: i64 = 7;
/// Ledger reference id of the shared platform account
pub const PLATFORM_ACCOUNT_REF: &str = "platform";
/// Ledger reference id of the external account funding deposits come from
pub const DEPOSITS_ACCOUNT_REF: &str = "chain-deposits";
/// Ledger reference id of the external account realized network fees go to
pub const NETWORK_FEES_ACCOUNT_REF: &str = "network-fees";

/// Confirmation threshold for an asset
pub fn confirmations_min(asset: Asset) -> i32 {
    match asset {
        Asset::Btc => BTC_CONFIRMATIONS_MIN,
        Asset::Xmr => XMR_CONFIRMATIONS_MIN,
    }
}

/// BTC needs a speed profile, XMR must not have one
pub fn is_valid_speed(asset: Asset, speed: Option<SpeedProfile>) -> bool {
    match asset {
        Asset::Btc => speed.is_some(),
        Asset::Xmr => speed.is_none(),
    }
}

/// Fail with `InvalidArgument` unless `value` is a positive integer
pub fn require_positive_int(name: &str, value: i64) -> EscrowResult<()> {
    if value <= 0 {
        return Err(EscrowError::invalid_argument(format!(
            "{} must be an integer > 0, got {}",
            name, value
        )));
    }
    Ok(())
}

/// True when a deposit is too small to count towards funding
pub fn is_dust(asset: Asset, amount: i64) -> bool {
    asset == Asset::Btc && amount < BTC_DUST_SATS
}

/// Monetary breakdown of an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAmounts {
    pub price: i64,
    pub platform_fee: i64,
    pub fn_est: i64,
    pub buffer: i64,
    pub deposit_total: i64,
}

impl EscrowAmounts {
    /// Validate an explicit breakdown
    pub fn new(
        price: i64,
        platform_fee: i64,
        fn_est: i64,
        buffer: i64,
        deposit_total: i64,
    ) -> EscrowResult<Self> {
        let amounts = Self {
            price,
            platform_fee,
            fn_est,
            buffer,
            deposit_total,
        };
        amounts.validate()?;
        Ok(amounts)
    }

    /// Build the breakdown from a price: 3% platform fee, deposit total at the minimum
    pub fn quote(price: i64, fn_est: i64, buffer: i64) -> EscrowResult<Self> {
        require_positive_int("price", price)?;
        let platform_fee = price
            .checked_mul(PLATFORM_FEE_BPS)
            .map(|scaled| scaled / 10_000)
            .ok_or_else(|| EscrowError::invalid_argument("price overflows fee computation"))?;
        let amounts = Self {
            price,
            platform_fee,
            fn_est,
            buffer,
            deposit_total: 0,
        };
        let deposit_total = amounts.required_total()?;
        Self::new(price, platform_fee, fn_est, buffer, deposit_total)
    }

    /// price + platform_fee + fn_est + buffer
    pub fn required_total(&self) -> EscrowResult<i64> {
        [self.platform_fee, self.fn_est, self.buffer]
            .iter()
            .try_fold(self.price, |acc, part| acc.checked_add(*part))
            .ok_or_else(|| EscrowError::invalid_argument("escrow amounts overflow"))
    }

    /// Check non-negativity and the deposit total formula
    pub fn validate(&self) -> EscrowResult<()> {
        for (name, value) in [
            ("price", self.price),
            ("platform_fee", self.platform_fee),
            ("fn_est", self.fn_est),
            ("buffer", self.buffer),
            ("deposit_total", self.deposit_total),
        ] {
            if value < 0 {
                return Err(EscrowError::invalid_argument(format!(
                    "{} must be >= 0, got {}",
                    name, value
                )));
            }
        }

        let required = self.required_total()?;
        if self.deposit_total < required {
            return Err(EscrowError::invalid_argument(format!(
                "deposit_total {} is below price + platform_fee + fn_est + buffer = {}",
                self.deposit_total, required
            )));
        }
        Ok(())
    }
}

/// One trade between a buyer and a seller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: i64,
    pub asset: Asset,
    pub price: i64,
    pub platform_fee: i64,
    pub fn_est: i64,
    pub buffer: i64,
    pub deposit_total: i64,
    pub seller_payout_address: String,
    pub buyer_payout_address: Option<String>,
    pub payout_speed_profile: Option<SpeedProfile>,
    pub state: EscrowState,

    // Delivery timers
    pub delivered_at: Option<DateTime<Utc>>,
    pub dispute_deadline: Option<DateTime<Utc>>,
    pub auto_release_at: Option<DateTime<Utc>>,
    pub auto_released_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency version, bumped on every state write
    pub version: i64,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Escrow {
    pub fn amounts(&self) -> EscrowAmounts {
        EscrowAmounts {
            price: self.price,
            platform_fee: self.platform_fee,
            fn_est: self.fn_est,
            buffer: self.buffer,
            deposit_total: self.deposit_total,
        }
    }

    /// Kind of settlement this escrow is waiting on, if any
    pub fn awaiting_settlement(&self) -> Option<PayoutKind> {
        match self.state {
            EscrowState::Released if self.auto_released_at.is_some() => Some(PayoutKind::Normal),
            EscrowState::Resolved => Some(PayoutKind::Dispute),
            _ => None,
        }
    }
}

/// Fields supplied when creating an escrow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEscrow {
    pub asset: Asset,
    pub amounts: EscrowAmounts,
    pub seller_payout_address: String,
    pub buyer_payout_address: Option<String>,
    pub payout_speed_profile: Option<SpeedProfile>,
    /// Deposit address to assign right away
    pub destination: Option<NewDestination>,
}

/// Deposit address assigned to an escrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowDestination {
    pub id: i64,
    pub escrow_id: i64,
    pub asset: Asset,
    pub destination: String,
    /// BTC: derivation path; XMR: account/subaddress index
    pub meta: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDestination {
    pub destination: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// An observed on-chain payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: i64,
    pub escrow_id: i64,
    pub asset: Asset,
    pub txid: String,
    pub vout: Option<i32>,
    pub destination: String,
    pub amount: i64,
    pub confirmations_current: i32,
    pub confirmed_height: Option<i64>,
    pub status: DepositStatus,
    pub first_seen_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Deposit {
    /// Counts towards the funding sum
    pub fn counts_for_funding(&self) -> bool {
        self.status == DepositStatus::Confirmed && !is_dust(self.asset, self.amount)
    }
}

/// An outgoing settlement transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: i64,
    pub escrow_id: i64,
    pub asset: Asset,
    pub kind: PayoutKind,
    pub txid: Option<String>,
    pub status: PayoutStatus,
    pub feerate_profile: Option<SpeedProfile>,
    pub vbytes_est: Option<i64>,
    pub fn_est_at_send: Option<i64>,
    pub fn_real: Option<i64>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// One output of a payout transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutOutput {
    pub id: i64,
    pub payout_id: i64,
    pub role: Role,
    pub address: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayoutOutput {
    pub role: Role,
    pub address: String,
    pub amount: i64,
}

/// A contested escrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: i64,
    pub escrow_id: i64,
    pub opened_by: Role,
    pub reason: String,
    pub evidence_url: Option<String>,
    pub status: DisputeStatus,
    pub to_seller: Option<i64>,
    pub to_buyer: Option<i64>,
    pub resolved_by: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub price_at_open: i64,
}

/// A ledger participant bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: i64,
    pub asset: Asset,
    pub kind: LedgerAccountKind,
    pub ref_id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One posting; positive amounts are credits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub journal_id: Uuid,
    pub asset: Asset,
    pub account_id: i64,
    pub amount: i64,
    pub memo: Option<String>,
    pub ref_type: String,
    pub ref_id: String,
    pub created_at: DateTime<Utc>,
}

/// Dedup record for a mutating request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub id: i64,
    pub key: String,
    pub endpoint: String,
    pub request_hash: String,
    pub response_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdempotencyKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Inbound chain notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub provider: String,
    pub kind: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Escrow event for audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub event_type: String,
    pub escrow_id: Option<i64>,
    pub ref_type: Option<String>,
    pub ref_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Dispute window and auto-release delay applied on delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseTiming {
    pub dispute_window: Duration,
    pub auto_release_delay: Duration,
}

impl Default for ReleaseTiming {
    fn default() -> Self {
        Self {
            dispute_window: Duration::hours(DISPUTE_WINDOW_HOURS),
            auto_release_delay: Duration::days(AUTO_RELEASE_DAYS),
        }
    }
}

//! Error types for the escrow system
//!
//! Every failure the engine can surface maps to one of these kinds. Raw
//! storage constraint violations never leave the store: they are converted
//! into the matching public kind through `From<ConstraintViolation>`.

use crate::models::{Asset, EscrowState};
use thiserror::Error;
use uuid::Uuid;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Bad input to a validator or an operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Journal entries of one asset do not net to zero
    #[error("Unbalanced journal {journal_id}: {asset} entries sum to {imbalance}")]
    UnbalancedJournal {
        journal_id: Uuid,
        asset: Asset,
        imbalance: i64,
    },

    /// Posting referenced a ledger account that does not exist
    #[error("Unknown ledger account: {0}")]
    UnknownAccount(i64),

    /// State machine misuse; the escrow is left unchanged
    #[error("Invalid state transition from {from} on {event}")]
    InvalidStateTransition { from: String, event: String },

    /// A payout for this escrow is still live on chain
    #[error("Escrow {escrow_id} already has a broadcast payout")]
    ConcurrentBroadcastExists { escrow_id: i64 },

    /// Idempotency hit; callers answer with the stored response
    #[error("Duplicate request for key {key} on {endpoint}")]
    DuplicateRequest { key: String, endpoint: String },

    /// Row lookup failed
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Optimistic version check kept failing for an escrow
    #[error("Escrow {escrow_id} was modified concurrently")]
    ConcurrentModification { escrow_id: i64 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wallet / broadcast collaborator errors
    #[error("Wallet error: {0}")]
    Wallet(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<F: ToString, E: Into<String>>(from: F, event: E) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            event: event.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<I: ToString>(entity: &'static str, id: I) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a wallet error
    pub fn wallet<S: Into<String>>(msg: S) -> Self {
        Self::Wallet(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// True for the idempotency-hit kind, which callers treat as success
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateRequest { .. })
    }
}

/// Storage-level constraint failures, named after the schema constraints
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConstraintViolation {
    /// `uq_escrow_destinations_destination`
    DuplicateDestination(String),
    /// `uq_escrow_destination_active`
    ActiveDestinationExists { escrow_id: i64 },
    /// `uq_deposits_txid_vout`, or `uq_deposits_txid_destination_no_vout` without a vout
    DuplicateDeposit { txid: String, vout: Option<i32> },
    /// `uq_one_broadcast_payout_per_escrow`
    BroadcastPayoutExists { escrow_id: i64 },
    /// `uq_payouts_txid`
    DuplicatePayoutTxid(String),
    /// `uq_one_open_dispute_per_escrow`
    OpenDisputeExists { escrow_id: i64 },
    /// `uq_ledger_accounts`
    DuplicateAccount,
    /// `uq_idempotency`
    DuplicateIdempotencyKey { key: String, endpoint: String },
    /// `uq_webhook`
    DuplicateWebhook { key: String, kind: String },
    /// Any `ck_*` check constraint
    Check(&'static str),
    /// Foreign key target missing
    MissingParent { entity: &'static str, id: i64 },
    /// Optimistic version mismatch on an escrow row
    StaleVersion { escrow_id: i64 },
}

impl From<ConstraintViolation> for EscrowError {
    fn from(violation: ConstraintViolation) -> Self {
        match violation {
            ConstraintViolation::DuplicateDestination(destination) => EscrowError::invalid_argument(
                format!("destination {} is already assigned", destination),
            ),
            ConstraintViolation::ActiveDestinationExists { escrow_id } => {
                EscrowError::invalid_argument(format!(
                    "escrow {} already has an active destination",
                    escrow_id
                ))
            }
            ConstraintViolation::DuplicateDeposit { txid, vout } => EscrowError::invalid_argument(
                format!("deposit {}:{:?} already recorded", txid, vout),
            ),
            ConstraintViolation::BroadcastPayoutExists { escrow_id } => {
                EscrowError::ConcurrentBroadcastExists { escrow_id }
            }
            ConstraintViolation::DuplicatePayoutTxid(txid) => {
                EscrowError::invalid_argument(format!("payout txid {} already recorded", txid))
            }
            ConstraintViolation::OpenDisputeExists { .. } => {
                EscrowError::state_transition(EscrowState::Disputed, "open_dispute")
            }
            ConstraintViolation::DuplicateAccount => {
                EscrowError::invalid_argument("ledger account already exists")
            }
            ConstraintViolation::DuplicateIdempotencyKey { key, endpoint } => {
                EscrowError::DuplicateRequest { key, endpoint }
            }
            ConstraintViolation::DuplicateWebhook { key, kind } => EscrowError::DuplicateRequest {
                key,
                endpoint: kind,
            },
            ConstraintViolation::Check(name) => {
                EscrowError::invalid_argument(format!("check constraint {} violated", name))
            }
            ConstraintViolation::MissingParent { entity, id } => EscrowError::not_found(entity, id),
            ConstraintViolation::StaleVersion { escrow_id } => {
                EscrowError::ConcurrentModification { escrow_id }
            }
        }
    }
}

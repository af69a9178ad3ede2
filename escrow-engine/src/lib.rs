//! Escrow ledger and settlement engine for Bitcoin and Monero trades
//!
//! This crate implements the transactional core of a BTC/XMR escrow platform:
//! - Escrow state machine from creation through funding, delivery, disputes and closing
//! - Deposit confirmation tracking with reorg handling and dust filtering
//! - Double-entry ledger with balanced, atomic journal posting
//! - Payout creation, broadcast tracking and settlement
//! - Idempotency keys and durable webhook intake
//!
//! Wallets and chain watchers are external; they plug in through
//! [`settlement_worker::ChainWallet`] and [`webhook_intake::WebhookInbox`].

pub mod config;
pub mod deposit_tracker;
pub mod error;
pub mod escrow_machine;
pub mod escrow_manager;
pub mod idempotency;
pub mod ledger;
pub mod models;
pub mod node;
pub mod payout_engine;
pub mod settlement_worker;
pub mod store;
pub mod telemetry;
pub mod webhook_intake;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;

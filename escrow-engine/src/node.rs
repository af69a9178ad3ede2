//! Escrow Node - entry points for the escrow ledger
//!
//! This module wires every component over one shared store and exposes the
//! entry points callers use. Mutating client operations go through the
//! idempotency gate, so a retried request replays the stored response.

use crate::{
    config::EngineConfig,
    deposit_tracker::DepositTracker,
    escrow_manager::EscrowManager,
    idempotency::{IdempotencyGate, Outcome},
    ledger::LedgerStore,
    models::{AuditEvent, Dispute, Escrow, EscrowState, NewEscrow, Role},
    payout_engine::PayoutEngine,
    settlement_worker::{ChainWallet, SettlementWorker},
    store::Store,
    webhook_intake::WebhookInbox,
    EscrowResult,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::info;

/// Dispute opening request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenDisputeRequest {
    pub escrow_id: i64,
    pub opened_by: Role,
    pub reason: String,
    pub evidence_url: Option<String>,
}

/// Dispute resolution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveDisputeRequest {
    pub escrow_id: i64,
    pub to_seller: i64,
    pub to_buyer: i64,
    pub resolved_by: String,
}

/// Escrow information response
#[derive(Debug, Clone)]
pub struct EscrowInfo {
    pub escrow: Escrow,
    pub balance: i64,
    pub disputes: Vec<Dispute>,
    pub events: Vec<AuditEvent>,
}

/// Main escrow node that coordinates all components
#[derive(Clone)]
pub struct EscrowNode {
    config: EngineConfig,
    store: Store,
    manager: EscrowManager,
    ledger: LedgerStore,
    deposits: DepositTracker,
    payouts: PayoutEngine,
    idempotency: IdempotencyGate,
    webhooks: WebhookInbox,
}

impl EscrowNode {
    /// Create a new escrow node with all components initialized
    pub fn new(config: EngineConfig) -> EscrowResult<Self> {
        config.validate()?;
        info!("Initializing escrow node");

        let store = Store::new();
        let timing = config.release_timing();
        let node = Self {
            manager: EscrowManager::new(config.clone(), store.clone()),
            ledger: LedgerStore::new(store.clone()),
            deposits: DepositTracker::new(store.clone()),
            payouts: PayoutEngine::new(store.clone(), timing),
            idempotency: IdempotencyGate::new(store.clone(), config.idempotency_ttl()),
            webhooks: WebhookInbox::new(store.clone(), timing),
            store,
            config,
        };

        info!("Escrow node initialized successfully");
        Ok(node)
    }

    /// Node configured from `ESCROW_*` environment variables
    pub fn from_env() -> EscrowResult<Self> {
        Self::new(EngineConfig::from_env()?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &EscrowManager {
        &self.manager
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn deposits(&self) -> &DepositTracker {
        &self.deposits
    }

    pub fn payouts(&self) -> &PayoutEngine {
        &self.payouts
    }

    pub fn webhooks(&self) -> &WebhookInbox {
        &self.webhooks
    }

    pub fn idempotency(&self) -> &IdempotencyGate {
        &self.idempotency
    }

    /// Settlement loop bound to this node's store
    pub fn settlement_worker(&self, wallet: Arc<dyn ChainWallet>) -> SettlementWorker {
        SettlementWorker::new(
            self.config.clone(),
            self.store.clone(),
            self.manager.clone(),
            self.payouts.clone(),
            wallet,
        )
    }

    /// Create a new escrow
    pub async fn create_escrow(
        &self,
        idempotency_key: &str,
        request: NewEscrow,
    ) -> EscrowResult<Outcome<Escrow>> {
        self.idempotency
            .execute(idempotency_key, "create_escrow", &request, || {
                self.manager.create_escrow(request.clone())
            })
            .await
    }

    /// Seller confirmed delivery
    pub async fn confirm_delivery(
        &self,
        idempotency_key: &str,
        escrow_id: i64,
    ) -> EscrowResult<Outcome<Escrow>> {
        self.idempotency
            .execute(
                idempotency_key,
                "confirm_delivery",
                &serde_json::json!({ "escrow_id": escrow_id }),
                || self.manager.confirm_delivery(escrow_id),
            )
            .await
    }

    /// Open a dispute
    pub async fn open_dispute(
        &self,
        idempotency_key: &str,
        request: OpenDisputeRequest,
    ) -> EscrowResult<Outcome<Dispute>> {
        self.idempotency
            .execute(idempotency_key, "open_dispute", &request, || {
                self.manager.open_dispute(
                    request.escrow_id,
                    request.opened_by,
                    &request.reason,
                    request.evidence_url.as_deref(),
                )
            })
            .await
    }

    /// Resolve the open dispute of an escrow
    pub async fn resolve_dispute(
        &self,
        idempotency_key: &str,
        request: ResolveDisputeRequest,
    ) -> EscrowResult<Outcome<Dispute>> {
        self.idempotency
            .execute(idempotency_key, "resolve_dispute", &request, || {
                self.manager.resolve_dispute(
                    request.escrow_id,
                    request.to_seller,
                    request.to_buyer,
                    &request.resolved_by,
                )
            })
            .await
    }

    /// Get escrow information with balance, disputes and audit trail
    pub async fn get_escrow_info(&self, escrow_id: i64) -> EscrowResult<EscrowInfo> {
        let escrow = self.manager.get_escrow(escrow_id).await?;
        Ok(EscrowInfo {
            balance: self.manager.escrow_balance(escrow_id).await?,
            disputes: self.manager.disputes(escrow_id).await,
            events: self.manager.audit_trail(escrow_id).await,
            escrow,
        })
    }

    /// Escrow counts per state
    pub async fn stats(&self) -> BTreeMap<&'static str, usize> {
        self.store
            .read(|t| {
                let mut counts = BTreeMap::new();
                for state in [
                    EscrowState::Created,
                    EscrowState::Funded,
                    EscrowState::Released,
                    EscrowState::Disputed,
                    EscrowState::Resolved,
                    EscrowState::Closed,
                ] {
                    counts.insert(state.as_str(), 0);
                }
                for escrow in t.escrows.values() {
                    *counts.entry(escrow.state.as_str()).or_insert(0) += 1;
                }
                counts
            })
            .await
    }
}

//! Settlement Worker - turns released and resolved escrows into payouts
//!
//! Each tick fires due auto-releases, then settles every escrow waiting for
//! a payout: plan the outputs, quote the network fee, reserve the payout
//! slot, hand it to the wallet and record the txid. A broadcast failure
//! marks the payout FAILED so the next tick can try again.

use crate::{
    config::EngineConfig,
    error::EscrowError,
    escrow_manager::EscrowManager,
    models::{
        Asset, DisputeStatus, Escrow, NewPayoutOutput, Payout, PayoutKind, PayoutOutput,
        SpeedProfile,
    },
    payout_engine::{plan_settlement, FeeQuote, PayoutEngine, PayoutRequest},
    store::Store,
    EscrowResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::{sync::watch, time::interval};
use tracing::{debug, error, info, warn};

/// Wallet / node collaborator that signs and broadcasts payouts
#[async_trait]
pub trait ChainWallet: Send + Sync {
    /// Network fee for paying `outputs` at `speed` (None for XMR)
    async fn estimate_fee(
        &self,
        asset: Asset,
        speed: Option<SpeedProfile>,
        outputs: &[NewPayoutOutput],
    ) -> EscrowResult<FeeQuote>;

    /// Sign and broadcast; returns the txid
    async fn broadcast(&self, payout: &Payout, outputs: &[PayoutOutput]) -> EscrowResult<String>;
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementReport {
    /// Escrows whose auto-release fired
    pub auto_released: Vec<i64>,
    /// Payouts handed to the wallet
    pub broadcast: Vec<i64>,
    /// Payouts the wallet refused
    pub failed: Vec<i64>,
    /// Escrows that could not be settled this tick
    pub skipped: Vec<i64>,
}

enum Settled {
    Broadcast(i64),
    Failed(i64),
}

/// Periodic settlement loop
pub struct SettlementWorker {
    config: EngineConfig,
    store: Store,
    manager: EscrowManager,
    payouts: PayoutEngine,
    wallet: Arc<dyn ChainWallet>,
}

impl SettlementWorker {
    pub fn new(
        config: EngineConfig,
        store: Store,
        manager: EscrowManager,
        payouts: PayoutEngine,
        wallet: Arc<dyn ChainWallet>,
    ) -> Self {
        info!(
            "SettlementWorker initialized with poll_interval={}s",
            config.settlement_poll_interval_secs
        );
        Self {
            config,
            store,
            manager,
            payouts,
            wallet,
        }
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_timer = interval(self.config.poll_interval());
        info!("Starting settlement loop");

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!("Settlement tick failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Settlement loop stopped");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: auto-releases first, then payouts
    pub async fn run_once(&self, now: DateTime<Utc>) -> EscrowResult<SettlementReport> {
        let mut report = SettlementReport {
            auto_released: self
                .manager
                .fire_due_auto_releases(now)
                .await?
                .into_iter()
                .map(|escrow| escrow.id)
                .collect(),
            ..SettlementReport::default()
        };

        for escrow in self.manager.escrows_awaiting_settlement().await {
            match self.settle(&escrow).await {
                Ok(Settled::Broadcast(payout_id)) => report.broadcast.push(payout_id),
                Ok(Settled::Failed(payout_id)) => report.failed.push(payout_id),
                Err(EscrowError::ConcurrentBroadcastExists { escrow_id }) => {
                    debug!("Escrow {} already has a payout in flight", escrow_id);
                }
                Err(e) => {
                    error!("Cannot settle escrow {}: {}", escrow.id, e);
                    report.skipped.push(escrow.id);
                }
            }
        }

        if report != SettlementReport::default() {
            info!(
                "Settlement tick: {} auto-released, {} broadcast, {} failed, {} skipped",
                report.auto_released.len(),
                report.broadcast.len(),
                report.failed.len(),
                report.skipped.len()
            );
        }
        Ok(report)
    }

    async fn settle(&self, escrow: &Escrow) -> EscrowResult<Settled> {
        let kind = escrow
            .awaiting_settlement()
            .ok_or_else(|| EscrowError::state_transition(escrow.state, "settle"))?;
        let dispute = match kind {
            PayoutKind::Dispute => self
                .store
                .read(|t| {
                    t.disputes_for_escrow(escrow.id)
                        .into_iter()
                        .rev()
                        .find(|d| d.status == DisputeStatus::Closed)
                })
                .await,
            PayoutKind::Normal => None,
        };

        let platform_address = self.config.platform_address(escrow.asset)?;
        let outputs = plan_settlement(escrow, dispute.as_ref(), platform_address)?;
        let speed = match escrow.asset {
            Asset::Btc => Some(
                escrow
                    .payout_speed_profile
                    .unwrap_or(self.config.default_btc_speed),
            ),
            Asset::Xmr => None,
        };
        let fee = self
            .wallet
            .estimate_fee(escrow.asset, speed, &outputs)
            .await?;
        if fee.fee > escrow.fn_est + escrow.buffer {
            warn!(
                "Fee quote {} for escrow {} exceeds fn_est + buffer ({})",
                fee.fee,
                escrow.id,
                escrow.fn_est + escrow.buffer
            );
        }

        let created = self
            .payouts
            .create_payout(&PayoutRequest {
                escrow_id: escrow.id,
                kind,
                outputs,
                feerate_profile: speed,
                fee,
            })
            .await?;
        let payout_id = created.payout.id;

        match self.wallet.broadcast(&created.payout, &created.outputs).await {
            Ok(txid) => {
                self.payouts.record_broadcast(payout_id, &txid).await?;
                Ok(Settled::Broadcast(payout_id))
            }
            Err(e) => {
                self.payouts.fail_payout(payout_id, &e.to_string()).await?;
                Ok(Settled::Failed(payout_id))
            }
        }
    }
}

//! Payout Engine - creates and tracks settlement transactions
//!
//! A payout is created BROADCAST (the live slot for its escrow) before the
//! wallet signs anything, so a second settlement attempt for the same escrow
//! fails with `ConcurrentBroadcastExists` instead of double-spending. The
//! wallet's txid is attached afterwards. Confirmation posts the settlement
//! journal and closes the escrow in the same transaction.

use crate::{
    error::EscrowError,
    escrow_machine::{self, EscrowEvent},
    ledger::{self, EscrowAccounts, Journal},
    models::{
        is_valid_speed, Dispute, DisputeStatus, Escrow, NewPayoutOutput, Payout, PayoutKind,
        PayoutOutput, PayoutStatus, ReleaseTiming, Role, SpeedProfile,
    },
    store::{Store, Tables},
    EscrowResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const ROLES: [Role; 3] = [Role::Seller, Role::Buyer, Role::Platform];

/// Network fee estimate from the wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub fee: i64,
    pub vbytes_est: Option<i64>,
}

/// Payout creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub escrow_id: i64,
    pub kind: PayoutKind,
    pub outputs: Vec<NewPayoutOutput>,
    pub feerate_profile: Option<SpeedProfile>,
    pub fee: FeeQuote,
}

/// Payout row with its outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutWithOutputs {
    pub payout: Payout,
    pub outputs: Vec<PayoutOutput>,
}

/// Result of a confirmed payout
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutSettlement {
    pub payout: Payout,
    pub escrow: Escrow,
    pub journal_id: Uuid,
}

/// Default outputs for an escrow awaiting settlement
///
/// NORMAL pays the price to the seller; DISPUTE pays the decided split. The
/// platform fee goes to `platform_address` in both cases. Zero-amount outputs
/// are left out.
pub fn plan_settlement(
    escrow: &Escrow,
    dispute: Option<&Dispute>,
    platform_address: &str,
) -> EscrowResult<Vec<NewPayoutOutput>> {
    let (to_seller, to_buyer) = match escrow.awaiting_settlement() {
        Some(PayoutKind::Normal) => (escrow.price, 0),
        Some(PayoutKind::Dispute) => {
            let dispute = dispute
                .filter(|d| d.escrow_id == escrow.id && d.status == DisputeStatus::Closed)
                .ok_or_else(|| {
                    EscrowError::invalid_argument(format!(
                        "escrow {} has no resolved dispute",
                        escrow.id
                    ))
                })?;
            (
                dispute.to_seller.unwrap_or(0),
                dispute.to_buyer.unwrap_or(0),
            )
        }
        None => return Err(EscrowError::state_transition(escrow.state, "plan_settlement")),
    };

    let mut outputs = Vec::new();
    if to_seller > 0 {
        outputs.push(NewPayoutOutput {
            role: Role::Seller,
            address: escrow.seller_payout_address.clone(),
            amount: to_seller,
        });
    }
    if to_buyer > 0 {
        let address = escrow.buyer_payout_address.clone().ok_or_else(|| {
            EscrowError::invalid_argument(format!(
                "escrow {} has no buyer payout address for a refund",
                escrow.id
            ))
        })?;
        outputs.push(NewPayoutOutput {
            role: Role::Buyer,
            address,
            amount: to_buyer,
        });
    }
    if escrow.platform_fee > 0 {
        outputs.push(NewPayoutOutput {
            role: Role::Platform,
            address: platform_address.to_string(),
            amount: escrow.platform_fee,
        });
    }
    Ok(outputs)
}

/// Amount each role still has to be credited: outputs minus earlier allocations
fn role_deltas(
    tx: &Tables,
    accounts: &EscrowAccounts,
    outputs: &[(Role, i64)],
) -> EscrowResult<Vec<(Role, i64)>> {
    let mut deltas = Vec::with_capacity(ROLES.len());
    for role in ROLES {
        let paid = outputs
            .iter()
            .filter(|(r, _)| *r == role)
            .try_fold(0i64, |acc, (_, amount)| acc.checked_add(*amount))
            .ok_or_else(|| EscrowError::invalid_argument("payout outputs overflow"))?;
        // The platform account is shared between escrows
        let credited = match role {
            Role::Platform => 0,
            _ => ledger::balance_in(tx, accounts.for_role(role).id)?,
        };
        let delta = paid.checked_sub(credited).ok_or_else(|| {
            EscrowError::internal(format!("settlement delta overflow for {}", role))
        })?;
        deltas.push((role, delta));
    }
    Ok(deltas)
}

pub(crate) fn create_payout_in(
    tx: &mut Tables,
    request: &PayoutRequest,
    now: DateTime<Utc>,
) -> EscrowResult<PayoutWithOutputs> {
    if tx.live_payout(request.escrow_id).is_some() {
        return Err(EscrowError::ConcurrentBroadcastExists {
            escrow_id: request.escrow_id,
        });
    }
    let escrow = tx.escrow(request.escrow_id)?.clone();

    if !is_valid_speed(escrow.asset, request.feerate_profile) {
        return Err(EscrowError::invalid_argument(format!(
            "invalid fee profile {:?} for {}",
            request.feerate_profile, escrow.asset
        )));
    }
    if escrow.awaiting_settlement() != Some(request.kind) {
        return Err(EscrowError::state_transition(
            escrow.state,
            format!("create_{}_payout", request.kind.as_str().to_lowercase()),
        ));
    }
    if request.outputs.is_empty() {
        return Err(EscrowError::invalid_argument("payout needs at least one output"));
    }
    for output in &request.outputs {
        if output.address.trim().is_empty() {
            return Err(EscrowError::invalid_argument(format!(
                "{} output has no address",
                output.role
            )));
        }
        if output.amount < 0 {
            return Err(EscrowError::invalid_argument(format!(
                "{} output amount must be >= 0",
                output.role
            )));
        }
    }
    if request.fee.fee < 0 {
        return Err(EscrowError::invalid_argument("network fee must be >= 0"));
    }

    let accounts = ledger::escrow_accounts_in(tx, &escrow, now)?;
    let amounts: Vec<(Role, i64)> = request
        .outputs
        .iter()
        .map(|o| (o.role, o.amount))
        .collect();
    let required = role_deltas(tx, &accounts, &amounts)?
        .into_iter()
        .try_fold(request.fee.fee, |acc, (_, delta)| acc.checked_add(delta))
        .ok_or_else(|| EscrowError::invalid_argument("payout total overflows"))?;
    let available = ledger::balance_in(tx, accounts.escrow.id)?;
    if required > available {
        return Err(EscrowError::invalid_argument(format!(
            "payout needs {} but escrow {} holds {}",
            required, escrow.id, available
        )));
    }

    let payout = tx.insert_payout(|id| Payout {
        id,
        escrow_id: escrow.id,
        asset: escrow.asset,
        kind: request.kind,
        txid: None,
        status: PayoutStatus::Broadcast,
        feerate_profile: request.feerate_profile,
        vbytes_est: request.fee.vbytes_est,
        fn_est_at_send: Some(request.fee.fee),
        fn_real: None,
        failure_reason: None,
        created_at: now,
        broadcast_at: None,
        confirmed_at: None,
    })?;

    let mut outputs = Vec::with_capacity(request.outputs.len());
    for output in &request.outputs {
        outputs.push(tx.insert_payout_output(|id| PayoutOutput {
            id,
            payout_id: payout.id,
            role: output.role,
            address: output.address.clone(),
            amount: output.amount,
        })?);
    }

    tx.record_audit(
        "payout.created",
        Some(escrow.id),
        Some(("payout", payout.id.to_string())),
        serde_json::json!({
            "kind": payout.kind,
            "outputs": outputs.len(),
            "fn_est": request.fee.fee,
        }),
        now,
    );
    Ok(PayoutWithOutputs { payout, outputs })
}

pub(crate) fn record_broadcast_in(
    tx: &mut Tables,
    payout_id: i64,
    txid: &str,
    now: DateTime<Utc>,
) -> EscrowResult<Payout> {
    if txid.trim().is_empty() {
        return Err(EscrowError::invalid_argument("txid cannot be empty"));
    }
    let mut payout = tx.payout(payout_id)?.clone();
    if payout.status != PayoutStatus::Broadcast {
        return Err(EscrowError::state_transition(payout.status, "record_broadcast"));
    }
    match payout.txid.as_deref() {
        Some(existing) if existing == txid => return Ok(payout),
        Some(existing) => {
            return Err(EscrowError::invalid_argument(format!(
                "payout {} already broadcast as {}",
                payout_id, existing
            )))
        }
        None => {}
    }

    payout.txid = Some(txid.to_string());
    payout.broadcast_at = Some(now);
    let payout = tx.update_payout(payout)?;
    tx.record_audit(
        "payout.broadcast",
        Some(payout.escrow_id),
        Some(("payout", payout.id.to_string())),
        serde_json::json!({ "txid": txid }),
        now,
    );
    Ok(payout)
}

pub(crate) fn confirm_payout_in(
    tx: &mut Tables,
    payout_id: i64,
    fn_real: Option<i64>,
    now: DateTime<Utc>,
    timing: &ReleaseTiming,
) -> EscrowResult<PayoutSettlement> {
    if fn_real.map(|fee| fee < 0).unwrap_or(false) {
        return Err(EscrowError::invalid_argument("realized fee must be >= 0"));
    }
    let mut payout = tx.payout(payout_id)?.clone();
    if payout.status != PayoutStatus::Broadcast {
        return Err(EscrowError::state_transition(payout.status, "confirm_payout"));
    }
    let escrow = tx.escrow(payout.escrow_id)?.clone();
    let transition = escrow_machine::apply(
        &escrow,
        &EscrowEvent::SettlementConfirmed { payout_id },
        now,
        timing,
    )?;

    let realized_fee = fn_real.or(payout.fn_est_at_send).unwrap_or(0);
    if let (Some(real), Some(estimate)) = (fn_real, payout.fn_est_at_send) {
        if real > estimate {
            warn!(
                "Payout {} paid {} in fees, {} over the estimate",
                payout_id,
                real,
                real - estimate
            );
        }
    }

    payout.status = PayoutStatus::Confirmed;
    payout.fn_real = fn_real;
    payout.confirmed_at = Some(now);
    let payout = tx.update_payout(payout)?;

    let accounts = ledger::escrow_accounts_in(tx, &escrow, now)?;
    let outputs: Vec<(Role, i64)> = tx
        .outputs_for_payout(payout_id)
        .into_iter()
        .map(|o| (o.role, o.amount))
        .collect();
    let reference = || ("payout", payout_id.to_string());

    let mut journal = Journal::new();
    for (role, delta) in role_deltas(tx, &accounts, &outputs)? {
        let memo = format!("settlement to {}", role.as_str().to_lowercase());
        journal = journal
            .line(&accounts.escrow, -delta, &memo, reference())
            .line(accounts.for_role(role), delta, &memo, reference());
    }
    journal = journal
        .line(&accounts.escrow, -realized_fee, "network fee", reference())
        .line(&accounts.network_fees, realized_fee, "network fee", reference());
    if !journal.lines.is_empty() {
        ledger::post_in(tx, &journal, now)?;
    }

    let closed = tx.compare_and_swap_escrow(escrow.version, transition.escrow)?;
    tx.record_audit(
        "payout.confirmed",
        Some(closed.id),
        Some(("payout", payout_id.to_string())),
        serde_json::json!({ "fn_real": realized_fee, "journal_id": journal.id }),
        now,
    );
    tx.record_audit(
        "escrow.closed",
        Some(closed.id),
        Some(("payout", payout_id.to_string())),
        serde_json::json!({ "from": transition.from }),
        now,
    );

    Ok(PayoutSettlement {
        payout,
        escrow: closed,
        journal_id: journal.id,
    })
}

pub(crate) fn fail_payout_in(
    tx: &mut Tables,
    payout_id: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> EscrowResult<Payout> {
    let mut payout = tx.payout(payout_id)?.clone();
    if payout.status != PayoutStatus::Broadcast {
        return Err(EscrowError::state_transition(payout.status, "fail_payout"));
    }
    payout.status = PayoutStatus::Failed;
    payout.failure_reason = Some(reason.to_string());
    let payout = tx.update_payout(payout)?;
    tx.record_audit(
        "payout.failed",
        Some(payout.escrow_id),
        Some(("payout", payout.id.to_string())),
        serde_json::json!({ "reason": reason }),
        now,
    );
    Ok(payout)
}

/// Public handle for payout operations
#[derive(Debug, Clone)]
pub struct PayoutEngine {
    store: Store,
    timing: ReleaseTiming,
}

impl PayoutEngine {
    pub fn new(store: Store, timing: ReleaseTiming) -> Self {
        Self { store, timing }
    }

    /// Persist a payout and its outputs in the live BROADCAST slot
    pub async fn create_payout(&self, request: &PayoutRequest) -> EscrowResult<PayoutWithOutputs> {
        info!(
            "Creating {} payout for escrow {}",
            request.kind, request.escrow_id
        );
        let created = self
            .store
            .transaction(|tx| create_payout_in(tx, request, Utc::now()))
            .await?;
        info!(
            "Payout {} created for escrow {} ({} outputs)",
            created.payout.id,
            request.escrow_id,
            created.outputs.len()
        );
        Ok(created)
    }

    pub async fn record_broadcast(&self, payout_id: i64, txid: &str) -> EscrowResult<Payout> {
        let payout = self
            .store
            .transaction(|tx| record_broadcast_in(tx, payout_id, txid, Utc::now()))
            .await?;
        info!("Payout {} broadcast as {}", payout_id, txid);
        Ok(payout)
    }

    /// Confirm, post the settlement journal and close the escrow atomically
    pub async fn confirm_payout(
        &self,
        payout_id: i64,
        fn_real: Option<i64>,
    ) -> EscrowResult<PayoutSettlement> {
        let timing = self.timing;
        let settlement = self
            .store
            .transaction(|tx| confirm_payout_in(tx, payout_id, fn_real, Utc::now(), &timing))
            .await?;
        info!(
            "Payout {} confirmed, escrow {} closed",
            payout_id, settlement.escrow.id
        );
        Ok(settlement)
    }

    /// Mark a payout failed; the escrow becomes eligible for a new attempt
    pub async fn fail_payout(&self, payout_id: i64, reason: &str) -> EscrowResult<Payout> {
        let payout = self
            .store
            .transaction(|tx| fail_payout_in(tx, payout_id, reason, Utc::now()))
            .await?;
        warn!("Payout {} failed: {}", payout_id, reason);
        Ok(payout)
    }

    pub async fn payout(&self, payout_id: i64) -> EscrowResult<PayoutWithOutputs> {
        self.store
            .read(|t| {
                Ok(PayoutWithOutputs {
                    payout: t.payout(payout_id)?.clone(),
                    outputs: t.outputs_for_payout(payout_id),
                })
            })
            .await
    }

    pub async fn payouts_for_escrow(&self, escrow_id: i64) -> Vec<Payout> {
        self.store.read(|t| t.payouts_for_escrow(escrow_id)).await
    }
}

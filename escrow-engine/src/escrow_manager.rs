//! Escrow Manager - coordinates escrow lifecycle and state transitions
//!
//! This module drives an escrow from creation through funding, delivery,
//! disputes and auto-release. Transitions triggered by users or timers read
//! a snapshot, compute the next row with the pure state machine, and commit
//! it with a compare-and-swap on the escrow version together with the
//! transition's side effects. A lost race is retried on a fresh snapshot.

use crate::{
    config::EngineConfig,
    deposit_tracker::{self, Sighting, SightingOutcome},
    error::EscrowError,
    escrow_machine::{self, Effect, EscrowEvent, Transition},
    ledger::{self, Journal},
    models::{
        is_valid_speed, require_positive_int, AuditEvent, Dispute, DisputeStatus, Escrow,
        EscrowDestination, EscrowState, LedgerAccountKind, NewDestination, NewEscrow,
        ReleaseTiming, Role,
    },
    store::{Store, Tables},
    EscrowResult,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Outcome of a sighting routed through the manager
#[derive(Debug, Clone, PartialEq)]
pub struct SightingReport {
    pub outcome: SightingOutcome,
    /// Set when this sighting completed the escrow's funding
    pub funded: Option<Escrow>,
}

/// Fund the escrow if its confirmed deposits now cover `deposit_total`
pub(crate) fn fund_if_covered_in(
    tx: &mut Tables,
    escrow_id: i64,
    now: DateTime<Utc>,
    timing: &ReleaseTiming,
) -> EscrowResult<Option<Escrow>> {
    let escrow = tx.escrow(escrow_id)?.clone();
    if escrow.state != EscrowState::Created {
        return Ok(None);
    }
    let funded_amount = deposit_tracker::funded_amount_in(tx, escrow_id)?;
    if funded_amount < escrow.deposit_total {
        debug!(
            "Escrow {} funded {} of {}",
            escrow_id, funded_amount, escrow.deposit_total
        );
        return Ok(None);
    }

    let transition = escrow_machine::apply(
        &escrow,
        &EscrowEvent::FundingConfirmed { funded_amount },
        now,
        timing,
    )?;
    let funded = tx.compare_and_swap_escrow(escrow.version, transition.escrow.clone())?;

    for effect in &transition.effects {
        if let Effect::PostFunding { amount } = effect {
            let accounts = ledger::escrow_accounts_in(tx, &funded, now)?;
            let reference = || ("escrow", funded.id.to_string());
            let journal = Journal::new()
                .line(&accounts.deposits, -amount, "escrow funding", reference())
                .line(&accounts.escrow, *amount, "escrow funding", reference());
            ledger::post_in(tx, &journal, now)?;
        }
    }
    tx.record_audit(
        "escrow.funded",
        Some(funded.id),
        None,
        serde_json::json!({ "funded_amount": funded_amount }),
        now,
    );
    info!(
        "Escrow {} funded with {} {}",
        funded.id, funded_amount, funded.asset
    );
    Ok(Some(funded))
}

/// Record a sighting and re-evaluate funding in the same transaction
pub(crate) fn record_sighting_in(
    tx: &mut Tables,
    sighting: &Sighting,
    now: DateTime<Utc>,
    timing: &ReleaseTiming,
) -> EscrowResult<SightingReport> {
    let outcome = deposit_tracker::record_sighting_in(tx, sighting, now)?;
    let mut funded = None;
    if outcome.affects_funding() {
        let escrow_id = outcome.deposit.escrow_id;
        funded = fund_if_covered_in(tx, escrow_id, now, timing)?;

        let escrow = tx.escrow(escrow_id)?.clone();
        if escrow.state != EscrowState::Created {
            let covered = deposit_tracker::funded_amount_in(tx, escrow_id)?;
            if covered < escrow.deposit_total {
                warn!(
                    "Escrow {} in {} is now covered by only {} of {} after a reorg",
                    escrow_id, escrow.state, covered, escrow.deposit_total
                );
            }
        }
    }
    Ok(SightingReport { outcome, funded })
}

/// Main escrow manager
#[derive(Debug, Clone)]
pub struct EscrowManager {
    /// Configuration
    config: EngineConfig,
    /// Shared relational store
    store: Store,
}

impl EscrowManager {
    pub fn new(config: EngineConfig, store: Store) -> Self {
        Self { config, store }
    }

    /// Create a new escrow in CREATED, optionally with its deposit destination
    pub async fn create_escrow(&self, request: NewEscrow) -> EscrowResult<Escrow> {
        info!(
            "Creating {} escrow: price {}, deposit_total {}",
            request.asset, request.amounts.price, request.amounts.deposit_total
        );

        require_positive_int("price", request.amounts.price)?;
        request.amounts.validate()?;
        if !is_valid_speed(request.asset, request.payout_speed_profile) {
            return Err(EscrowError::invalid_argument(format!(
                "payout speed profile {:?} is not valid for {}",
                request.payout_speed_profile, request.asset
            )));
        }
        if request.seller_payout_address.trim().is_empty() {
            return Err(EscrowError::invalid_argument(
                "seller payout address cannot be empty",
            ));
        }
        if request
            .buyer_payout_address
            .as_deref()
            .map(|address| address.trim().is_empty())
            .unwrap_or(false)
        {
            return Err(EscrowError::invalid_argument(
                "buyer payout address cannot be blank",
            ));
        }

        let escrow = self
            .store
            .transaction(|tx| {
                let now = Utc::now();
                let amounts = request.amounts;
                let escrow = tx.insert_escrow(|id| Escrow {
                    id,
                    asset: request.asset,
                    price: amounts.price,
                    platform_fee: amounts.platform_fee,
                    fn_est: amounts.fn_est,
                    buffer: amounts.buffer,
                    deposit_total: amounts.deposit_total,
                    seller_payout_address: request.seller_payout_address.clone(),
                    buyer_payout_address: request.buyer_payout_address.clone(),
                    payout_speed_profile: request.payout_speed_profile,
                    state: EscrowState::Created,
                    delivered_at: None,
                    dispute_deadline: None,
                    auto_release_at: None,
                    auto_released_at: None,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                })?;
                ledger::escrow_accounts_in(tx, &escrow, now)?;
                if let Some(destination) = &request.destination {
                    Self::assign_destination_in(tx, &escrow, destination, now)?;
                }
                tx.record_audit(
                    "escrow.created",
                    Some(escrow.id),
                    None,
                    serde_json::json!({
                        "asset": escrow.asset,
                        "price": escrow.price,
                        "deposit_total": escrow.deposit_total,
                    }),
                    now,
                );
                Ok(escrow)
            })
            .await?;

        info!("Escrow created: {}", escrow.id);
        Ok(escrow)
    }

    fn assign_destination_in(
        tx: &mut Tables,
        escrow: &Escrow,
        destination: &NewDestination,
        now: DateTime<Utc>,
    ) -> EscrowResult<EscrowDestination> {
        if destination.destination.trim().is_empty() {
            return Err(EscrowError::invalid_argument("destination cannot be empty"));
        }
        let retired = tx.deactivate_destinations(escrow.id);
        let assigned = tx.insert_destination(
            escrow.id,
            escrow.asset,
            &destination.destination,
            destination.meta.clone(),
            now,
        )?;
        tx.record_audit(
            "destination.assigned",
            Some(escrow.id),
            Some(("destination", assigned.id.to_string())),
            serde_json::json!({ "retired": retired }),
            now,
        );
        Ok(assigned)
    }

    /// Assign (or rotate) the deposit destination of a CREATED escrow
    pub async fn assign_destination(
        &self,
        escrow_id: i64,
        destination: NewDestination,
    ) -> EscrowResult<EscrowDestination> {
        let assigned = self
            .store
            .transaction(|tx| {
                let escrow = tx.escrow(escrow_id)?.clone();
                if escrow.state != EscrowState::Created {
                    return Err(EscrowError::state_transition(
                        escrow.state,
                        "assign_destination",
                    ));
                }
                Self::assign_destination_in(tx, &escrow, &destination, Utc::now())
            })
            .await?;
        info!(
            "Escrow {} now receives deposits at {}",
            escrow_id, assigned.destination
        );
        Ok(assigned)
    }

    /// Record a chain sighting; funds the escrow once deposits cover it
    pub async fn record_sighting(&self, sighting: &Sighting) -> EscrowResult<SightingReport> {
        let timing = self.config.release_timing();
        self.store
            .transaction(|tx| record_sighting_in(tx, sighting, Utc::now(), &timing))
            .await
    }

    /// Re-evaluate funding from the deposits already on record
    pub async fn try_fund(&self, escrow_id: i64) -> EscrowResult<Option<Escrow>> {
        let timing = self.config.release_timing();
        self.store
            .transaction(|tx| fund_if_covered_in(tx, escrow_id, Utc::now(), &timing))
            .await
    }

    /// Seller delivered: start the dispute window and the auto-release timer
    pub async fn confirm_delivery(&self, escrow_id: i64) -> EscrowResult<Escrow> {
        info!("Confirming delivery for escrow {}", escrow_id);
        let (escrow, _) = self
            .transition(escrow_id, EscrowEvent::DeliveryConfirmed, Utc::now(), |tx, t, escrow| {
                tx.record_audit(
                    "escrow.released",
                    Some(escrow.id),
                    None,
                    serde_json::json!({
                        "from": t.from,
                        "dispute_deadline": escrow.dispute_deadline,
                        "auto_release_at": escrow.auto_release_at,
                    }),
                    escrow.updated_at,
                );
                Ok(())
            })
            .await?;
        info!(
            "Escrow {} released, auto-release at {:?}",
            escrow.id, escrow.auto_release_at
        );
        Ok(escrow)
    }

    /// Open a dispute on a FUNDED or RELEASED escrow
    pub async fn open_dispute(
        &self,
        escrow_id: i64,
        opened_by: Role,
        reason: &str,
        evidence_url: Option<&str>,
    ) -> EscrowResult<Dispute> {
        if opened_by == Role::Platform {
            return Err(EscrowError::invalid_argument(
                "disputes are opened by the seller or the buyer",
            ));
        }
        if reason.trim().is_empty() {
            return Err(EscrowError::invalid_argument("dispute reason cannot be empty"));
        }

        info!("Opening dispute on escrow {} by {}", escrow_id, opened_by);
        let event = EscrowEvent::DisputeOpened { opened_by };
        let (_, dispute) = self
            .transition(escrow_id, event, Utc::now(), |tx, t, escrow| {
                let dispute = tx.insert_dispute(|id| Dispute {
                    id,
                    escrow_id: escrow.id,
                    opened_by,
                    reason: reason.to_string(),
                    evidence_url: evidence_url.map(str::to_string),
                    status: DisputeStatus::Open,
                    to_seller: None,
                    to_buyer: None,
                    resolved_by: None,
                    opened_at: escrow.updated_at,
                    resolved_at: None,
                    price_at_open: escrow.price,
                })?;
                tx.record_audit(
                    "dispute.opened",
                    Some(escrow.id),
                    Some(("dispute", dispute.id.to_string())),
                    serde_json::json!({ "from": t.from, "opened_by": opened_by }),
                    escrow.updated_at,
                );
                Ok(dispute)
            })
            .await?;

        warn!("Dispute {} opened on escrow {}", dispute.id, escrow_id);
        Ok(dispute)
    }

    /// Decide the open dispute and allocate the split
    pub async fn resolve_dispute(
        &self,
        escrow_id: i64,
        to_seller: i64,
        to_buyer: i64,
        resolved_by: &str,
    ) -> EscrowResult<Dispute> {
        if resolved_by.trim().is_empty() {
            return Err(EscrowError::invalid_argument("resolved_by cannot be empty"));
        }
        let open = self
            .store
            .read(|t| t.open_dispute(escrow_id).cloned())
            .await
            .ok_or_else(|| EscrowError::not_found("Open dispute for escrow", escrow_id))?;
        escrow_machine::validate_split(to_seller, to_buyer, open.price_at_open)?;

        info!(
            "Resolving dispute {} on escrow {}: seller {}, buyer {}",
            open.id, escrow_id, to_seller, to_buyer
        );
        let event = EscrowEvent::DisputeResolved {
            to_seller,
            to_buyer,
            price_at_open: open.price_at_open,
        };
        let (_, dispute) = self
            .transition(escrow_id, event, Utc::now(), |tx, t, escrow| {
                let mut dispute = tx
                    .open_dispute(escrow.id)
                    .cloned()
                    .ok_or_else(|| EscrowError::not_found("Open dispute for escrow", escrow.id))?;
                let now = escrow.updated_at;
                dispute.status = DisputeStatus::Closed;
                dispute.to_seller = Some(to_seller);
                dispute.to_buyer = Some(to_buyer);
                dispute.resolved_by = Some(resolved_by.to_string());
                dispute.resolved_at = Some(now);
                let dispute = tx.update_dispute(dispute)?;

                for effect in &t.effects {
                    if let Effect::PostDisputeAllocation {
                        to_seller,
                        to_buyer,
                    } = effect
                    {
                        let accounts = ledger::escrow_accounts_in(tx, escrow, now)?;
                        let reference = || ("dispute", dispute.id.to_string());
                        let journal = Journal::new()
                            .line(&accounts.escrow, -to_seller, "dispute award", reference())
                            .line(&accounts.seller, *to_seller, "dispute award", reference())
                            .line(&accounts.escrow, -to_buyer, "dispute refund", reference())
                            .line(&accounts.buyer, *to_buyer, "dispute refund", reference());
                        if !journal.lines.is_empty() {
                            ledger::post_in(tx, &journal, now)?;
                        }
                    }
                }
                tx.record_audit(
                    "dispute.resolved",
                    Some(escrow.id),
                    Some(("dispute", dispute.id.to_string())),
                    serde_json::json!({
                        "to_seller": to_seller,
                        "to_buyer": to_buyer,
                        "resolved_by": resolved_by,
                    }),
                    now,
                );
                Ok(dispute)
            })
            .await?;

        info!("Dispute {} resolved", dispute.id);
        Ok(dispute)
    }

    /// Fire every auto-release due at `now`; returns the escrows released
    ///
    /// Each release is claimed through the version check, so overlapping
    /// scans fire an escrow exactly once.
    pub async fn fire_due_auto_releases(&self, now: DateTime<Utc>) -> EscrowResult<Vec<Escrow>> {
        let due: Vec<i64> = self
            .store
            .read(|t| {
                t.escrows
                    .values()
                    .filter(|e| e.state == EscrowState::Released && e.auto_released_at.is_none())
                    .filter(|e| e.auto_release_at.map(|at| at <= now).unwrap_or(false))
                    .map(|e| e.id)
                    .collect()
            })
            .await;

        let mut released = Vec::new();
        for escrow_id in due {
            let result = self
                .transition(escrow_id, EscrowEvent::AutoReleaseDue, now, |tx, _, escrow| {
                    tx.record_audit(
                        "escrow.auto_released",
                        Some(escrow.id),
                        None,
                        serde_json::json!({ "auto_release_at": escrow.auto_release_at }),
                        now,
                    );
                    Ok(())
                })
                .await;
            match result {
                Ok((escrow, _)) => {
                    info!("Auto-released escrow {}", escrow.id);
                    released.push(escrow);
                }
                // Disputed or fired by another scanner in the meantime
                Err(EscrowError::InvalidStateTransition { from, .. }) => {
                    debug!("Skipping auto-release of escrow {} ({})", escrow_id, from);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(released)
    }

    /// Escrows waiting for a settlement payout with no payout in flight
    pub async fn escrows_awaiting_settlement(&self) -> Vec<Escrow> {
        self.store
            .read(|t| {
                t.escrows
                    .values()
                    .filter(|e| e.awaiting_settlement().is_some())
                    .filter(|e| t.live_payout(e.id).is_none())
                    .cloned()
                    .collect()
            })
            .await
    }

    pub async fn get_escrow(&self, escrow_id: i64) -> EscrowResult<Escrow> {
        self.store.read(|t| t.escrow(escrow_id).cloned()).await
    }

    pub async fn list_escrows_by_state(&self, state: EscrowState) -> Vec<Escrow> {
        self.store
            .read(|t| t.escrows.values().filter(|e| e.state == state).cloned().collect())
            .await
    }

    pub async fn active_destination(&self, escrow_id: i64) -> Option<EscrowDestination> {
        self.store
            .read(|t| t.active_destination(escrow_id).cloned())
            .await
    }

    pub async fn disputes(&self, escrow_id: i64) -> Vec<Dispute> {
        self.store.read(|t| t.disputes_for_escrow(escrow_id)).await
    }

    /// Funds still held in the escrow's ledger account
    pub async fn escrow_balance(&self, escrow_id: i64) -> EscrowResult<i64> {
        self.store
            .read(|t| {
                let escrow = t.escrow(escrow_id)?;
                let account = t
                    .ledger_account_by_key(
                        escrow.asset,
                        LedgerAccountKind::Escrow,
                        &escrow_id.to_string(),
                    )
                    .ok_or_else(|| EscrowError::not_found("Escrow account", escrow_id))?;
                ledger::balance_in(t, account.id)
            })
            .await
    }

    pub async fn audit_trail(&self, escrow_id: i64) -> Vec<AuditEvent> {
        self.store.read(|t| t.audit_events_for_escrow(escrow_id)).await
    }

    /// Apply `event` with optimistic concurrency
    ///
    /// `effects` runs inside the transaction that writes the new row and sees
    /// the committed escrow (version already bumped).
    async fn transition<T, F>(
        &self,
        escrow_id: i64,
        event: EscrowEvent,
        now: DateTime<Utc>,
        effects: F,
    ) -> EscrowResult<(Escrow, T)>
    where
        F: Fn(&mut Tables, &Transition, &Escrow) -> EscrowResult<T>,
    {
        let timing = self.config.release_timing();
        for attempt in 0..=self.config.max_transition_retries {
            let snapshot = self.get_escrow(escrow_id).await?;
            let transition = escrow_machine::apply(&snapshot, &event, now, &timing)?;

            let result = self
                .store
                .transaction(|tx| {
                    let escrow =
                        tx.compare_and_swap_escrow(snapshot.version, transition.escrow.clone())?;
                    let output = effects(tx, &transition, &escrow)?;
                    Ok((escrow, output))
                })
                .await;

            match result {
                Err(EscrowError::ConcurrentModification { .. }) => {
                    warn!(
                        "Escrow {} changed during {} (attempt {}), retrying",
                        escrow_id,
                        event.name(),
                        attempt + 1
                    );
                }
                Ok((escrow, output)) => {
                    debug!(
                        "Escrow {}: {} -> {} on {}",
                        escrow_id,
                        transition.from,
                        escrow.state,
                        event.name()
                    );
                    return Ok((escrow, output));
                }
                Err(e) => return Err(e),
            }
        }
        Err(EscrowError::ConcurrentModification { escrow_id })
    }
}

//! Deposit Tracker - reconciles chain sightings with escrow funding
//!
//! A sighting upserts the deposit keyed by `(txid, vout)`. Confirmation counts
//! move freely while a deposit is PENDING; it flips to CONFIRMED exactly once
//! when the count reaches the asset's threshold. Replaying a confirmed
//! sighting changes nothing. A confirmed deposit sighted again below the
//! threshold was reorganised out of its block: it goes back to PENDING and the
//! change is reported as [`DepositChange::Reverted`] so callers can recompute
//! escrow funding.

use crate::{
    error::EscrowError,
    models::{confirmations_min, Asset, Deposit, DepositStatus},
    store::{Store, Tables},
    EscrowResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One observation of an output paying an escrow destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    pub asset: Asset,
    pub txid: String,
    pub vout: Option<i32>,
    pub destination: String,
    pub amount: i64,
    /// Blocks mined on top of (and including) the transaction's block; 0 in mempool
    pub confirmations: i32,
    /// Height of the block that included the transaction
    pub height_observed: Option<i64>,
}

/// What a sighting did to the deposit row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositChange {
    /// First sighting, still pending
    Created,
    /// Pending deposit got a new confirmation count
    Updated,
    /// Deposit reached the threshold (on first sighting or later)
    Confirmed,
    /// Replay with nothing new
    Unchanged,
    /// Confirmed deposit dropped below the threshold after a reorg
    Reverted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SightingOutcome {
    pub deposit: Deposit,
    pub change: DepositChange,
}

impl SightingOutcome {
    /// Funding of the owning escrow may have changed
    pub fn affects_funding(&self) -> bool {
        matches!(
            self.change,
            DepositChange::Confirmed | DepositChange::Reverted
        )
    }
}

fn validate_sighting(sighting: &Sighting) -> EscrowResult<()> {
    if sighting.txid.trim().is_empty() {
        return Err(EscrowError::invalid_argument("txid cannot be empty"));
    }
    if sighting.destination.trim().is_empty() {
        return Err(EscrowError::invalid_argument("destination cannot be empty"));
    }
    if sighting.amount < 0 {
        return Err(EscrowError::invalid_argument(format!(
            "deposit amount must be >= 0, got {}",
            sighting.amount
        )));
    }
    if sighting.confirmations < 0 {
        return Err(EscrowError::invalid_argument(format!(
            "confirmations must be >= 0, got {}",
            sighting.confirmations
        )));
    }
    if sighting.vout.map(|vout| vout < 0).unwrap_or(false) {
        return Err(EscrowError::invalid_argument("vout must be >= 0"));
    }
    Ok(())
}

/// Upsert the deposit for a sighting inside an open transaction
pub(crate) fn record_sighting_in(
    tx: &mut Tables,
    sighting: &Sighting,
    now: DateTime<Utc>,
) -> EscrowResult<SightingOutcome> {
    validate_sighting(sighting)?;

    let destination = tx
        .destination_by_address(&sighting.destination)
        .cloned()
        .ok_or_else(|| {
            EscrowError::invalid_argument(format!(
                "destination {} is not assigned to any escrow",
                sighting.destination
            ))
        })?;
    if destination.asset != sighting.asset {
        return Err(EscrowError::invalid_argument(format!(
            "destination {} expects {}, sighting is {}",
            destination.destination, destination.asset, sighting.asset
        )));
    }

    let threshold = confirmations_min(sighting.asset);
    let reached = sighting.confirmations >= threshold;
    let outpoint = format!("{}:{:?}", sighting.txid, sighting.vout);

    let existing = tx
        .deposit_by_outpoint(&sighting.txid, sighting.vout, &sighting.destination)
        .cloned();

    let Some(mut deposit) = existing else {
        let deposit = tx.insert_deposit(|id| Deposit {
            id,
            escrow_id: destination.escrow_id,
            asset: sighting.asset,
            txid: sighting.txid.clone(),
            vout: sighting.vout,
            destination: sighting.destination.clone(),
            amount: sighting.amount,
            confirmations_current: sighting.confirmations,
            confirmed_height: sighting.height_observed,
            status: if reached {
                DepositStatus::Confirmed
            } else {
                DepositStatus::Pending
            },
            first_seen_at: now,
            confirmed_at: reached.then_some(now),
        })?;
        let event_type = if reached {
            "deposit.confirmed"
        } else {
            "deposit.seen"
        };
        tx.record_audit(
            event_type,
            Some(deposit.escrow_id),
            Some(("deposit", deposit.id.to_string())),
            serde_json::json!({
                "outpoint": outpoint,
                "amount": deposit.amount,
                "confirmations": deposit.confirmations_current,
            }),
            now,
        );
        info!(
            "Recorded deposit {} for escrow {} ({} confirmations)",
            outpoint, deposit.escrow_id, deposit.confirmations_current
        );
        let change = if reached {
            DepositChange::Confirmed
        } else {
            DepositChange::Created
        };
        return Ok(SightingOutcome { deposit, change });
    };

    if deposit.asset != sighting.asset
        || deposit.destination != sighting.destination
        || deposit.amount != sighting.amount
    {
        return Err(EscrowError::invalid_argument(format!(
            "sighting of {} does not match the recorded deposit",
            outpoint
        )));
    }

    let change = match (deposit.status, reached) {
        (DepositStatus::Confirmed, true) => {
            debug!("Deposit {} already confirmed, ignoring replay", outpoint);
            return Ok(SightingOutcome {
                deposit,
                change: DepositChange::Unchanged,
            });
        }
        (DepositStatus::Confirmed, false) => {
            warn!(
                "Deposit {} fell to {} confirmations after a reorg, reverting to pending",
                outpoint, sighting.confirmations
            );
            deposit.status = DepositStatus::Pending;
            deposit.confirmed_at = None;
            DepositChange::Reverted
        }
        (DepositStatus::Pending, true) => {
            deposit.status = DepositStatus::Confirmed;
            deposit.confirmed_at = Some(now);
            DepositChange::Confirmed
        }
        (DepositStatus::Pending, false) => {
            if deposit.confirmations_current == sighting.confirmations
                && deposit.confirmed_height == sighting.height_observed
            {
                return Ok(SightingOutcome {
                    deposit,
                    change: DepositChange::Unchanged,
                });
            }
            DepositChange::Updated
        }
    };

    deposit.confirmations_current = sighting.confirmations;
    deposit.confirmed_height = sighting.height_observed;
    let deposit = tx.update_deposit(deposit)?;

    match change {
        DepositChange::Confirmed => {
            tx.record_audit(
                "deposit.confirmed",
                Some(deposit.escrow_id),
                Some(("deposit", deposit.id.to_string())),
                serde_json::json!({
                    "outpoint": outpoint,
                    "confirmations": deposit.confirmations_current,
                }),
                now,
            );
            info!(
                "Deposit {} confirmed for escrow {}",
                outpoint, deposit.escrow_id
            );
        }
        DepositChange::Reverted => {
            tx.record_audit(
                "deposit.reorged",
                Some(deposit.escrow_id),
                Some(("deposit", deposit.id.to_string())),
                serde_json::json!({
                    "outpoint": outpoint,
                    "confirmations": deposit.confirmations_current,
                }),
                now,
            );
        }
        _ => {}
    }

    Ok(SightingOutcome { deposit, change })
}

/// Sum of confirmed, non-dust deposits paid to the escrow's active destination
pub(crate) fn funded_amount_in(tables: &Tables, escrow_id: i64) -> EscrowResult<i64> {
    tables.escrow(escrow_id)?;
    let Some(active) = tables.active_destination(escrow_id) else {
        return Ok(0);
    };
    tables
        .deposits_for_escrow(escrow_id)
        .iter()
        .filter(|deposit| deposit.destination == active.destination && deposit.counts_for_funding())
        .try_fold(0i64, |acc, deposit| acc.checked_add(deposit.amount))
        .ok_or_else(|| EscrowError::internal(format!("funding sum overflow on escrow {}", escrow_id)))
}

/// Public handle for chain watchers
#[derive(Debug, Clone)]
pub struct DepositTracker {
    store: Store,
}

impl DepositTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record one sighting; funding is not re-evaluated here
    pub async fn record_sighting(&self, sighting: &Sighting) -> EscrowResult<SightingOutcome> {
        self.store
            .transaction(|tx| record_sighting_in(tx, sighting, Utc::now()))
            .await
    }

    pub async fn funded_amount(&self, escrow_id: i64) -> EscrowResult<i64> {
        self.store.read(|t| funded_amount_in(t, escrow_id)).await
    }

    pub async fn deposits_for_escrow(&self, escrow_id: i64) -> Vec<Deposit> {
        self.store.read(|t| t.deposits_for_escrow(escrow_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Escrow, EscrowState, BTC_DUST_SATS};

    async fn store_with_destination(asset: Asset, destination: &str) -> Store {
        let store = Store::new();
        let destination = destination.to_string();
        store
            .transaction(move |tx| {
                let now = Utc::now();
                tx.insert_escrow(|id| Escrow {
                    id,
                    asset,
                    price: 100_000,
                    platform_fee: 3_000,
                    fn_est: 500,
                    buffer: 500,
                    deposit_total: 104_000,
                    seller_payout_address: "seller".to_string(),
                    buyer_payout_address: None,
                    payout_speed_profile: None,
                    state: EscrowState::Created,
                    delivered_at: None,
                    dispute_deadline: None,
                    auto_release_at: None,
                    auto_released_at: None,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                })?;
                tx.insert_destination(1, asset, &destination, serde_json::json!({}), now)?;
                Ok(())
            })
            .await
            .unwrap();
        store
    }

    fn sighting(confirmations: i32) -> Sighting {
        Sighting {
            asset: Asset::Btc,
            txid: "aa11".to_string(),
            vout: Some(0),
            destination: "bc1qdest".to_string(),
            amount: 104_000,
            confirmations,
            height_observed: Some(850_000),
        }
    }

    #[tokio::test]
    async fn test_first_sighting_is_pending() {
        let tracker = DepositTracker::new(store_with_destination(Asset::Btc, "bc1qdest").await);
        let outcome = tracker.record_sighting(&sighting(0)).await.unwrap();

        assert_eq!(outcome.change, DepositChange::Created);
        assert_eq!(outcome.deposit.status, DepositStatus::Pending);
        assert_eq!(outcome.deposit.confirmations_current, 0);
        assert!(outcome.deposit.confirmed_at.is_none());
        assert_eq!(tracker.funded_amount(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_confirmation_is_stamped_once() {
        let tracker = DepositTracker::new(store_with_destination(Asset::Btc, "bc1qdest").await);
        tracker.record_sighting(&sighting(3)).await.unwrap();

        let updated = tracker.record_sighting(&sighting(9)).await.unwrap();
        assert_eq!(updated.change, DepositChange::Updated);

        let confirmed = tracker.record_sighting(&sighting(10)).await.unwrap();
        assert_eq!(confirmed.change, DepositChange::Confirmed);
        assert_eq!(confirmed.deposit.status, DepositStatus::Confirmed);
        let confirmed_at = confirmed.deposit.confirmed_at.expect("confirmed_at set");

        let replay = tracker.record_sighting(&sighting(12)).await.unwrap();
        assert_eq!(replay.change, DepositChange::Unchanged);
        assert_eq!(replay.deposit.confirmed_at, Some(confirmed_at));
        assert_eq!(replay.deposit.confirmations_current, 10);

        assert_eq!(tracker.funded_amount(1).await.unwrap(), 104_000);
    }

    #[tokio::test]
    async fn test_xmr_threshold_is_three() {
        let tracker = DepositTracker::new(store_with_destination(Asset::Xmr, "8AxmrSub").await);
        let outcome = tracker
            .record_sighting(&Sighting {
                asset: Asset::Xmr,
                txid: "ff00".to_string(),
                vout: None,
                destination: "8AxmrSub".to_string(),
                amount: 104_000,
                confirmations: 3,
                height_observed: Some(3_100_000),
            })
            .await
            .unwrap();
        assert_eq!(outcome.change, DepositChange::Confirmed);
    }

    #[tokio::test]
    async fn test_one_xmr_transfer_funds_two_subaddresses() {
        let store = store_with_destination(Asset::Xmr, "8subA").await;
        store
            .transaction(|tx| {
                let mut second = tx.escrow(1)?.clone();
                tx.insert_escrow(move |id| {
                    second.id = id;
                    second
                })?;
                tx.insert_destination(2, Asset::Xmr, "8subB", serde_json::json!({}), Utc::now())?;
                Ok(())
            })
            .await
            .unwrap();
        let tracker = DepositTracker::new(store);

        let transfer = |destination: &str| Sighting {
            asset: Asset::Xmr,
            txid: "batchtx".to_string(),
            vout: None,
            destination: destination.to_string(),
            amount: 104_000,
            confirmations: 3,
            height_observed: Some(3_100_000),
        };
        let a = tracker.record_sighting(&transfer("8subA")).await.unwrap();
        let b = tracker.record_sighting(&transfer("8subB")).await.unwrap();
        assert_eq!(a.change, DepositChange::Confirmed);
        assert_eq!(b.change, DepositChange::Confirmed);
        assert_ne!(a.deposit.id, b.deposit.id);
        assert_eq!(b.deposit.escrow_id, 2);
        assert_eq!(tracker.funded_amount(1).await.unwrap(), 104_000);
        assert_eq!(tracker.funded_amount(2).await.unwrap(), 104_000);

        // Redelivery for the same subaddress still lands on its own row
        let replay = tracker.record_sighting(&transfer("8subB")).await.unwrap();
        assert_eq!(replay.change, DepositChange::Unchanged);
        assert_eq!(replay.deposit.id, b.deposit.id);
    }

    #[tokio::test]
    async fn test_reorg_reverts_confirmed_deposit() {
        let store = store_with_destination(Asset::Btc, "bc1qdest").await;
        let tracker = DepositTracker::new(store.clone());
        tracker.record_sighting(&sighting(10)).await.unwrap();

        let reverted = tracker.record_sighting(&sighting(4)).await.unwrap();
        assert_eq!(reverted.change, DepositChange::Reverted);
        assert!(reverted.affects_funding());
        assert_eq!(reverted.deposit.status, DepositStatus::Pending);
        assert!(reverted.deposit.confirmed_at.is_none());
        assert_eq!(tracker.funded_amount(1).await.unwrap(), 0);

        let audit = store.read(|t| t.audit_events_for_escrow(1)).await;
        assert!(audit.iter().any(|event| event.event_type == "deposit.reorged"));
    }

    #[tokio::test]
    async fn test_dust_is_recorded_but_not_counted() {
        let tracker = DepositTracker::new(store_with_destination(Asset::Btc, "bc1qdest").await);
        let mut dust = sighting(10);
        dust.amount = BTC_DUST_SATS - 1;
        let outcome = tracker.record_sighting(&dust).await.unwrap();

        assert_eq!(outcome.deposit.status, DepositStatus::Confirmed);
        assert_eq!(tracker.deposits_for_escrow(1).await.len(), 1);
        assert_eq!(tracker.funded_amount(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_unknown_destination_and_conflicts() {
        let tracker = DepositTracker::new(store_with_destination(Asset::Btc, "bc1qdest").await);

        let mut stray = sighting(1);
        stray.destination = "bc1qnobody".to_string();
        assert!(matches!(
            tracker.record_sighting(&stray).await,
            Err(EscrowError::InvalidArgument(_))
        ));

        let mut wrong_asset = sighting(1);
        wrong_asset.asset = Asset::Xmr;
        assert!(tracker.record_sighting(&wrong_asset).await.is_err());

        tracker.record_sighting(&sighting(1)).await.unwrap();
        let mut changed = sighting(2);
        changed.amount = 1;
        assert!(tracker.record_sighting(&changed).await.is_err());

        let mut negative = sighting(1);
        negative.txid = "bb22".to_string();
        negative.amount = -5;
        assert!(tracker.record_sighting(&negative).await.is_err());
    }
}

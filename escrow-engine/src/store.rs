//! Relational store for the escrow schema
//!
//! Tables live in memory behind a single `RwLock`. Every mutation happens
//! inside [`Store::transaction`], which holds the write lock for the whole
//! closure and undoes every row change when the closure fails, so a
//! transaction is atomic and serialisable. Unique, partial-unique and check
//! constraints from `migrations/0001_init.sql` are enforced here and surface
//! as [`ConstraintViolation`]s, converted to public error kinds on the way out.

use crate::{
    error::{ConstraintViolation, EscrowError},
    models::{
        Asset, AuditEvent, Deposit, Dispute, DisputeStatus, Escrow, EscrowDestination,
        IdempotencyKey, LedgerAccount, LedgerAccountKind, LedgerEntry, Payout, PayoutOutput,
        PayoutStatus, WebhookEvent,
    },
    EscrowResult,
};
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use uuid::Uuid;

type Constrained<T> = Result<T, ConstraintViolation>;

/// One table: rows keyed by an auto-incremented id, plus an undo log
#[derive(Debug)]
pub struct Table<R> {
    rows: BTreeMap<i64, R>,
    next_id: i64,
    undo: Vec<(i64, Option<R>)>,
}

impl<R> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
            undo: Vec::new(),
        }
    }
}

impl<R: Clone> Table<R> {
    pub fn get(&self, id: i64) -> Option<&R> {
        self.rows.get(&id)
    }

    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn insert_with(&mut self, build: impl FnOnce(i64) -> R) -> R {
        let id = self.next_id;
        self.next_id += 1;
        let row = build(id);
        self.undo.push((id, None));
        self.rows.insert(id, row.clone());
        row
    }

    fn replace(&mut self, id: i64, row: R) {
        let previous = self.rows.insert(id, row);
        self.undo.push((id, previous));
    }

    fn remove(&mut self, id: i64) -> Option<R> {
        let previous = self.rows.remove(&id);
        if previous.is_some() {
            self.undo.push((id, previous.clone()));
        }
        previous
    }

    fn commit(&mut self) {
        self.undo.clear();
    }

    // Ids are not handed back, same as a database sequence.
    fn rollback(&mut self) {
        while let Some((id, previous)) = self.undo.pop() {
            match previous {
                Some(row) => {
                    self.rows.insert(id, row);
                }
                None => {
                    self.rows.remove(&id);
                }
            }
        }
    }
}

/// All tables of the schema
#[derive(Debug, Default)]
pub struct Tables {
    pub escrows: Table<Escrow>,
    pub destinations: Table<EscrowDestination>,
    pub deposits: Table<Deposit>,
    pub payouts: Table<Payout>,
    pub payout_outputs: Table<PayoutOutput>,
    pub disputes: Table<Dispute>,
    pub ledger_accounts: Table<LedgerAccount>,
    pub ledger_entries: Table<LedgerEntry>,
    pub idempotency_keys: Table<IdempotencyKey>,
    pub webhook_events: Table<WebhookEvent>,
    pub audit_events: Table<AuditEvent>,
}

impl Tables {
    fn commit(&mut self) {
        self.escrows.commit();
        self.destinations.commit();
        self.deposits.commit();
        self.payouts.commit();
        self.payout_outputs.commit();
        self.disputes.commit();
        self.ledger_accounts.commit();
        self.ledger_entries.commit();
        self.idempotency_keys.commit();
        self.webhook_events.commit();
        self.audit_events.commit();
    }

    fn rollback(&mut self) {
        self.escrows.rollback();
        self.destinations.rollback();
        self.deposits.rollback();
        self.payouts.rollback();
        self.payout_outputs.rollback();
        self.disputes.rollback();
        self.ledger_accounts.rollback();
        self.ledger_entries.rollback();
        self.idempotency_keys.rollback();
        self.webhook_events.rollback();
        self.audit_events.rollback();
    }

    // ----- escrows -----

    pub fn escrow(&self, id: i64) -> EscrowResult<&Escrow> {
        self.escrows
            .get(id)
            .ok_or_else(|| EscrowError::not_found("Escrow", id))
    }

    pub(crate) fn insert_escrow(&mut self, build: impl FnOnce(i64) -> Escrow) -> Constrained<Escrow> {
        let id = self.escrows.next_id;
        let escrow = build(id);
        escrow
            .amounts()
            .validate()
            .map_err(|_| ConstraintViolation::Check("ck_escrows_deposit_total_formula"))?;
        Ok(self.escrows.insert_with(|_| escrow))
    }

    /// Write `next` only if the stored row is still at `expected_version`
    pub(crate) fn compare_and_swap_escrow(
        &mut self,
        expected_version: i64,
        mut next: Escrow,
    ) -> Constrained<Escrow> {
        let current = self
            .escrows
            .get(next.id)
            .ok_or(ConstraintViolation::MissingParent {
                entity: "Escrow",
                id: next.id,
            })?;
        if current.version != expected_version {
            return Err(ConstraintViolation::StaleVersion { escrow_id: next.id });
        }
        next.version = expected_version + 1;
        self.escrows.replace(next.id, next.clone());
        Ok(next)
    }

    // ----- destinations -----

    pub fn destination_by_address(&self, destination: &str) -> Option<&EscrowDestination> {
        self.destinations
            .values()
            .find(|row| row.destination == destination)
    }

    pub fn active_destination(&self, escrow_id: i64) -> Option<&EscrowDestination> {
        self.destinations
            .values()
            .find(|row| row.escrow_id == escrow_id && row.active)
    }

    pub fn destinations_for_escrow(&self, escrow_id: i64) -> Vec<EscrowDestination> {
        self.destinations
            .values()
            .filter(|row| row.escrow_id == escrow_id)
            .cloned()
            .collect()
    }

    pub(crate) fn insert_destination(
        &mut self,
        escrow_id: i64,
        asset: Asset,
        destination: &str,
        meta: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Constrained<EscrowDestination> {
        self.require_escrow(escrow_id)?;
        if self.destination_by_address(destination).is_some() {
            return Err(ConstraintViolation::DuplicateDestination(destination.to_string()));
        }
        if self.active_destination(escrow_id).is_some() {
            return Err(ConstraintViolation::ActiveDestinationExists { escrow_id });
        }
        Ok(self.destinations.insert_with(|id| EscrowDestination {
            id,
            escrow_id,
            asset,
            destination: destination.to_string(),
            meta,
            active: true,
            created_at: now,
        }))
    }

    pub(crate) fn deactivate_destinations(&mut self, escrow_id: i64) -> usize {
        let active: Vec<EscrowDestination> = self
            .destinations
            .values()
            .filter(|row| row.escrow_id == escrow_id && row.active)
            .cloned()
            .collect();
        for mut row in active.iter().cloned() {
            row.active = false;
            self.destinations.replace(row.id, row);
        }
        active.len()
    }

    // ----- deposits -----

    /// Deposits without an output index (XMR) are keyed by destination instead
    pub fn deposit_by_outpoint(
        &self,
        txid: &str,
        vout: Option<i32>,
        destination: &str,
    ) -> Option<&Deposit> {
        self.deposits.values().find(|row| {
            row.txid == txid
                && row.vout == vout
                && (vout.is_some() || row.destination == destination)
        })
    }

    pub fn deposits_for_escrow(&self, escrow_id: i64) -> Vec<Deposit> {
        self.deposits
            .values()
            .filter(|row| row.escrow_id == escrow_id)
            .cloned()
            .collect()
    }

    pub(crate) fn insert_deposit(&mut self, build: impl FnOnce(i64) -> Deposit) -> Constrained<Deposit> {
        let candidate = build(self.deposits.next_id);
        self.require_escrow(candidate.escrow_id)?;
        Self::check_deposit(&candidate)?;
        if self
            .deposit_by_outpoint(&candidate.txid, candidate.vout, &candidate.destination)
            .is_some()
        {
            return Err(ConstraintViolation::DuplicateDeposit {
                txid: candidate.txid,
                vout: candidate.vout,
            });
        }
        Ok(self.deposits.insert_with(|_| candidate))
    }

    pub(crate) fn update_deposit(&mut self, deposit: Deposit) -> Constrained<Deposit> {
        Self::check_deposit(&deposit)?;
        self.deposits.replace(deposit.id, deposit.clone());
        Ok(deposit)
    }

    fn check_deposit(deposit: &Deposit) -> Constrained<()> {
        if deposit.amount < 0 {
            return Err(ConstraintViolation::Check("ck_deposits_amount_nonneg"));
        }
        if deposit.confirmations_current < 0 {
            return Err(ConstraintViolation::Check("ck_deposits_confs_nonneg"));
        }
        Ok(())
    }

    // ----- payouts -----

    pub fn payout(&self, id: i64) -> EscrowResult<&Payout> {
        self.payouts
            .get(id)
            .ok_or_else(|| EscrowError::not_found("Payout", id))
    }

    pub fn payouts_for_escrow(&self, escrow_id: i64) -> Vec<Payout> {
        self.payouts
            .values()
            .filter(|row| row.escrow_id == escrow_id)
            .cloned()
            .collect()
    }

    pub fn live_payout(&self, escrow_id: i64) -> Option<&Payout> {
        self.payouts
            .values()
            .find(|row| row.escrow_id == escrow_id && row.status == PayoutStatus::Broadcast)
    }

    pub fn outputs_for_payout(&self, payout_id: i64) -> Vec<PayoutOutput> {
        self.payout_outputs
            .values()
            .filter(|row| row.payout_id == payout_id)
            .cloned()
            .collect()
    }

    pub(crate) fn insert_payout(&mut self, build: impl FnOnce(i64) -> Payout) -> Constrained<Payout> {
        let candidate = build(self.payouts.next_id);
        self.require_escrow(candidate.escrow_id)?;
        self.check_payout(&candidate)?;
        Ok(self.payouts.insert_with(|_| candidate))
    }

    pub(crate) fn update_payout(&mut self, payout: Payout) -> Constrained<Payout> {
        self.check_payout(&payout)?;
        self.payouts.replace(payout.id, payout.clone());
        Ok(payout)
    }

    fn check_payout(&self, payout: &Payout) -> Constrained<()> {
        let nonneg = |value: Option<i64>| value.map(|v| v >= 0).unwrap_or(true);
        if !nonneg(payout.fn_est_at_send) {
            return Err(ConstraintViolation::Check("ck_payouts_fn_est_nonneg"));
        }
        if !nonneg(payout.fn_real) {
            return Err(ConstraintViolation::Check("ck_payouts_fn_real_nonneg"));
        }
        if !nonneg(payout.vbytes_est) {
            return Err(ConstraintViolation::Check("ck_payouts_vbytes_nonneg"));
        }
        if payout.status == PayoutStatus::Broadcast {
            if let Some(live) = self.live_payout(payout.escrow_id) {
                if live.id != payout.id {
                    return Err(ConstraintViolation::BroadcastPayoutExists {
                        escrow_id: payout.escrow_id,
                    });
                }
            }
        }
        if let Some(txid) = &payout.txid {
            let taken = self
                .payouts
                .values()
                .any(|row| row.id != payout.id && row.txid.as_deref() == Some(txid.as_str()));
            if taken {
                return Err(ConstraintViolation::DuplicatePayoutTxid(txid.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn insert_payout_output(
        &mut self,
        build: impl FnOnce(i64) -> PayoutOutput,
    ) -> Constrained<PayoutOutput> {
        let candidate = build(self.payout_outputs.next_id);
        if self.payouts.get(candidate.payout_id).is_none() {
            return Err(ConstraintViolation::MissingParent {
                entity: "Payout",
                id: candidate.payout_id,
            });
        }
        if candidate.amount < 0 {
            return Err(ConstraintViolation::Check("ck_payout_outputs_amount_nonneg"));
        }
        Ok(self.payout_outputs.insert_with(|_| candidate))
    }

    // ----- disputes -----

    pub fn dispute(&self, id: i64) -> EscrowResult<&Dispute> {
        self.disputes
            .get(id)
            .ok_or_else(|| EscrowError::not_found("Dispute", id))
    }

    pub fn open_dispute(&self, escrow_id: i64) -> Option<&Dispute> {
        self.disputes
            .values()
            .find(|row| row.escrow_id == escrow_id && row.status == DisputeStatus::Open)
    }

    pub fn disputes_for_escrow(&self, escrow_id: i64) -> Vec<Dispute> {
        self.disputes
            .values()
            .filter(|row| row.escrow_id == escrow_id)
            .cloned()
            .collect()
    }

    pub(crate) fn insert_dispute(&mut self, build: impl FnOnce(i64) -> Dispute) -> Constrained<Dispute> {
        let candidate = build(self.disputes.next_id);
        self.require_escrow(candidate.escrow_id)?;
        Self::check_dispute(&candidate)?;
        if candidate.status == DisputeStatus::Open && self.open_dispute(candidate.escrow_id).is_some()
        {
            return Err(ConstraintViolation::OpenDisputeExists {
                escrow_id: candidate.escrow_id,
            });
        }
        Ok(self.disputes.insert_with(|_| candidate))
    }

    pub(crate) fn update_dispute(&mut self, dispute: Dispute) -> Constrained<Dispute> {
        if let Some(current) = self.disputes.get(dispute.id) {
            if current.status == DisputeStatus::Closed {
                return Err(ConstraintViolation::Check("ck_disputes_closed_immutable"));
            }
        }
        Self::check_dispute(&dispute)?;
        self.disputes.replace(dispute.id, dispute.clone());
        Ok(dispute)
    }

    fn check_dispute(dispute: &Dispute) -> Constrained<()> {
        if dispute.to_seller.map(|v| v < 0).unwrap_or(false) {
            return Err(ConstraintViolation::Check("ck_disputes_to_seller_nonneg"));
        }
        if dispute.to_buyer.map(|v| v < 0).unwrap_or(false) {
            return Err(ConstraintViolation::Check("ck_disputes_to_buyer_nonneg"));
        }
        if dispute.price_at_open < 0 {
            return Err(ConstraintViolation::Check("ck_disputes_price_at_open_nonneg"));
        }
        Ok(())
    }

    // ----- ledger -----

    pub fn ledger_account(&self, id: i64) -> Option<&LedgerAccount> {
        self.ledger_accounts.get(id)
    }

    pub fn ledger_account_by_key(
        &self,
        asset: Asset,
        kind: LedgerAccountKind,
        ref_id: &str,
    ) -> Option<&LedgerAccount> {
        self.ledger_accounts
            .values()
            .find(|row| row.asset == asset && row.kind == kind && row.ref_id == ref_id)
    }

    pub(crate) fn insert_ledger_account(
        &mut self,
        build: impl FnOnce(i64) -> LedgerAccount,
    ) -> Constrained<LedgerAccount> {
        let candidate = build(self.ledger_accounts.next_id);
        if self
            .ledger_account_by_key(candidate.asset, candidate.kind, &candidate.ref_id)
            .is_some()
        {
            return Err(ConstraintViolation::DuplicateAccount);
        }
        Ok(self.ledger_accounts.insert_with(|_| candidate))
    }

    pub fn entries_for_account(&self, account_id: i64) -> impl Iterator<Item = &LedgerEntry> {
        self.ledger_entries
            .values()
            .filter(move |row| row.account_id == account_id)
    }

    pub fn entries_for_journal(&self, journal_id: Uuid) -> Vec<LedgerEntry> {
        self.ledger_entries
            .values()
            .filter(|row| row.journal_id == journal_id)
            .cloned()
            .collect()
    }

    pub(crate) fn insert_ledger_entry(
        &mut self,
        build: impl FnOnce(i64) -> LedgerEntry,
    ) -> Constrained<LedgerEntry> {
        let candidate = build(self.ledger_entries.next_id);
        if candidate.amount == 0 {
            return Err(ConstraintViolation::Check("ck_ledger_entries_amount_nonzero"));
        }
        if self.ledger_accounts.get(candidate.account_id).is_none() {
            return Err(ConstraintViolation::MissingParent {
                entity: "LedgerAccount",
                id: candidate.account_id,
            });
        }
        Ok(self.ledger_entries.insert_with(|_| candidate))
    }

    // ----- idempotency keys -----

    pub fn idempotency_key(&self, key: &str, endpoint: &str) -> Option<&IdempotencyKey> {
        self.idempotency_keys
            .values()
            .find(|row| row.key == key && row.endpoint == endpoint)
    }

    pub(crate) fn insert_idempotency_key(
        &mut self,
        build: impl FnOnce(i64) -> IdempotencyKey,
    ) -> Constrained<IdempotencyKey> {
        let candidate = build(self.idempotency_keys.next_id);
        if self
            .idempotency_key(&candidate.key, &candidate.endpoint)
            .is_some()
        {
            return Err(ConstraintViolation::DuplicateIdempotencyKey {
                key: candidate.key,
                endpoint: candidate.endpoint,
            });
        }
        Ok(self.idempotency_keys.insert_with(|_| candidate))
    }

    pub(crate) fn remove_idempotency_key(&mut self, id: i64) -> Option<IdempotencyKey> {
        self.idempotency_keys.remove(id)
    }

    // ----- webhooks -----

    pub fn webhook_event(&self, id: i64) -> EscrowResult<&WebhookEvent> {
        self.webhook_events
            .get(id)
            .ok_or_else(|| EscrowError::not_found("WebhookEvent", id))
    }

    pub fn webhook_by_key(&self, idempotency_key: &str, kind: &str) -> Option<&WebhookEvent> {
        self.webhook_events
            .values()
            .find(|row| row.idempotency_key == idempotency_key && row.kind == kind)
    }

    pub(crate) fn insert_webhook_event(
        &mut self,
        build: impl FnOnce(i64) -> WebhookEvent,
    ) -> Constrained<WebhookEvent> {
        let candidate = build(self.webhook_events.next_id);
        if self
            .webhook_by_key(&candidate.idempotency_key, &candidate.kind)
            .is_some()
        {
            return Err(ConstraintViolation::DuplicateWebhook {
                key: candidate.idempotency_key,
                kind: candidate.kind,
            });
        }
        Ok(self.webhook_events.insert_with(|_| candidate))
    }

    pub(crate) fn update_webhook_event(&mut self, event: WebhookEvent) -> WebhookEvent {
        self.webhook_events.replace(event.id, event.clone());
        event
    }

    // ----- audit trail -----

    pub fn audit_events_for_escrow(&self, escrow_id: i64) -> Vec<AuditEvent> {
        self.audit_events
            .values()
            .filter(|row| row.escrow_id == Some(escrow_id))
            .cloned()
            .collect()
    }

    pub(crate) fn record_audit(
        &mut self,
        event_type: &str,
        escrow_id: Option<i64>,
        reference: Option<(&str, String)>,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> AuditEvent {
        let (ref_type, ref_id) = match reference {
            Some((ref_type, ref_id)) => (Some(ref_type.to_string()), Some(ref_id)),
            None => (None, None),
        };
        self.audit_events.insert_with(|id| AuditEvent {
            id,
            event_type: event_type.to_string(),
            escrow_id,
            ref_type,
            ref_id,
            metadata,
            created_at: now,
        })
    }

    fn require_escrow(&self, escrow_id: i64) -> Constrained<()> {
        if self.escrows.get(escrow_id).is_none() {
            return Err(ConstraintViolation::MissingParent {
                entity: "Escrow",
                id: escrow_id,
            });
        }
        Ok(())
    }
}

/// Shared handle to the tables
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Tables>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a read-only query against a consistent snapshot
    pub async fn read<T, F>(&self, query: F) -> T
    where
        F: FnOnce(&Tables) -> T,
    {
        let tables = self.inner.read().await;
        query(&tables)
    }

    /// Run `work` atomically; any error rolls back every row it touched
    pub async fn transaction<T, F>(&self, work: F) -> EscrowResult<T>
    where
        F: FnOnce(&mut Tables) -> EscrowResult<T>,
    {
        let mut tables = self.inner.write().await;
        // A closure that panicked leaves its undo log behind.
        tables.rollback();

        match work(&mut tables) {
            Ok(value) => {
                tables.commit();
                Ok(value)
            }
            Err(err) => {
                tables.rollback();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EscrowState, PayoutKind, Role};

    fn sample_escrow(id: i64) -> Escrow {
        let now = Utc::now();
        Escrow {
            id,
            asset: Asset::Btc,
            price: 100_000,
            platform_fee: 3_000,
            fn_est: 500,
            buffer: 500,
            deposit_total: 104_000,
            seller_payout_address: "bc1qseller".to_string(),
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
        }
    }

    fn sample_payout(id: i64, escrow_id: i64) -> Payout {
        Payout {
            id,
            escrow_id,
            asset: Asset::Btc,
            kind: PayoutKind::Normal,
            txid: None,
            status: PayoutStatus::Broadcast,
            feerate_profile: None,
            vbytes_est: None,
            fn_est_at_send: Some(500),
            fn_real: None,
            failure_reason: None,
            created_at: Utc::now(),
            broadcast_at: None,
            confirmed_at: None,
        }
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let store = Store::new();
        store
            .transaction(|tx| Ok(tx.insert_escrow(sample_escrow)?))
            .await
            .unwrap();

        let result: EscrowResult<()> = store
            .transaction(|tx| {
                tx.insert_destination(1, Asset::Btc, "bc1qdest", serde_json::json!({}), Utc::now())?;
                tx.record_audit("test", Some(1), None, serde_json::json!({}), Utc::now());
                Err(EscrowError::internal("boom"))
            })
            .await;
        assert!(result.is_err());

        let (destinations, audits) = store
            .read(|t| (t.destinations.len(), t.audit_events.len()))
            .await;
        assert_eq!(destinations, 0);
        assert_eq!(audits, 0);
    }

    #[tokio::test]
    async fn test_rollback_restores_updated_rows() {
        let store = Store::new();
        store
            .transaction(|tx| Ok(tx.insert_escrow(sample_escrow)?))
            .await
            .unwrap();

        let _ = store
            .transaction(|tx| -> EscrowResult<()> {
                let mut escrow = tx.escrow(1)?.clone();
                escrow.state = EscrowState::Funded;
                tx.compare_and_swap_escrow(0, escrow)?;
                Err(EscrowError::internal("abort"))
            })
            .await;

        let escrow = store.read(|t| t.escrow(1).cloned()).await.unwrap();
        assert_eq!(escrow.state, EscrowState::Created);
        assert_eq!(escrow.version, 0);
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_version() {
        let store = Store::new();
        store
            .transaction(|tx| Ok(tx.insert_escrow(sample_escrow)?))
            .await
            .unwrap();

        let snapshot = store.read(|t| t.escrow(1).cloned()).await.unwrap();
        store
            .transaction(|tx| Ok(tx.compare_and_swap_escrow(0, snapshot.clone())?))
            .await
            .unwrap();

        let err = store
            .transaction(|tx| Ok(tx.compare_and_swap_escrow(0, snapshot.clone())?))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::ConcurrentModification { escrow_id: 1 }
        ));
    }

    #[tokio::test]
    async fn test_unique_destination_and_single_active() {
        let store = Store::new();
        store
            .transaction(|tx| {
                tx.insert_escrow(sample_escrow)?;
                tx.insert_escrow(sample_escrow)?;
                tx.insert_destination(1, Asset::Btc, "bc1qa", serde_json::json!({}), Utc::now())?;
                Ok(())
            })
            .await
            .unwrap();

        let taken = store
            .transaction(|tx| {
                Ok(tx.insert_destination(2, Asset::Btc, "bc1qa", serde_json::json!({}), Utc::now())?)
            })
            .await;
        assert!(matches!(taken, Err(EscrowError::InvalidArgument(_))));

        let second_active = store
            .transaction(|tx| {
                Ok(tx.insert_destination(1, Asset::Btc, "bc1qb", serde_json::json!({}), Utc::now())?)
            })
            .await;
        assert!(matches!(second_active, Err(EscrowError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_single_broadcast_payout_per_escrow() {
        let store = Store::new();
        store
            .transaction(|tx| {
                tx.insert_escrow(sample_escrow)?;
                tx.insert_payout(|id| sample_payout(id, 1))?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store
            .transaction(|tx| Ok(tx.insert_payout(|id| sample_payout(id, 1))?))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::ConcurrentBroadcastExists { escrow_id: 1 }
        ));
    }

    #[tokio::test]
    async fn test_zero_ledger_entry_rejected() {
        let store = Store::new();
        let err = store
            .transaction(|tx| {
                let account = tx.insert_ledger_account(|id| LedgerAccount {
                    id,
                    asset: Asset::Btc,
                    kind: LedgerAccountKind::Platform,
                    ref_id: "platform".to_string(),
                    name: None,
                    created_at: Utc::now(),
                })?;
                Ok(tx.insert_ledger_entry(|id| LedgerEntry {
                    id,
                    journal_id: Uuid::new_v4(),
                    asset: Asset::Btc,
                    account_id: account.id,
                    amount: 0,
                    memo: None,
                    ref_type: "test".to_string(),
                    ref_id: "0".to_string(),
                    created_at: Utc::now(),
                })?)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidArgument(_)));
        assert!(store.read(|t| t.ledger_accounts.is_empty()).await);
    }

    fn sample_dispute(id: i64) -> Dispute {
        Dispute {
            id,
            escrow_id: 1,
            opened_by: Role::Buyer,
            reason: "item not received".to_string(),
            evidence_url: None,
            status: DisputeStatus::Open,
            to_seller: None,
            to_buyer: None,
            resolved_by: None,
            opened_at: Utc::now(),
            resolved_at: None,
            price_at_open: 100_000,
        }
    }

    #[tokio::test]
    async fn test_single_open_dispute_per_escrow() {
        let store = Store::new();
        store
            .transaction(|tx| {
                tx.insert_escrow(sample_escrow)?;
                tx.insert_dispute(sample_dispute)?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store
            .transaction(|tx| {
                tx.record_audit("dispute.opened", Some(1), None, serde_json::json!({}), Utc::now());
                Ok(tx.insert_dispute(sample_dispute)?)
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::InvalidStateTransition { ref from, .. } if from == "DISPUTED"
        ));

        let (disputes, audits) = store
            .read(|t| (t.disputes_for_escrow(1), t.audit_events.len()))
            .await;
        assert_eq!(disputes.len(), 1);
        assert_eq!(disputes[0].id, 1);
        assert_eq!(audits, 0);

        // Once the first is closed another may be opened
        store
            .transaction(|tx| {
                let mut closed = tx
                    .open_dispute(1)
                    .cloned()
                    .ok_or_else(|| EscrowError::not_found("dispute", 1))?;
                closed.status = DisputeStatus::Closed;
                closed.to_seller = Some(0);
                closed.to_buyer = Some(100_000);
                tx.update_dispute(closed)?;
                Ok(tx.insert_dispute(sample_dispute)?)
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_constraints_match_migration() {
        let schema = include_str!("../migrations/0001_init.sql");
        for name in [
            "uq_escrow_destinations_destination",
            "uq_escrow_destination_active",
            "uq_deposits_txid_vout",
            "uq_deposits_txid_destination_no_vout",
            "uq_one_broadcast_payout_per_escrow",
            "uq_payouts_txid",
            "uq_one_open_dispute_per_escrow",
            "uq_ledger_accounts",
            "uq_idempotency",
            "uq_webhook",
            "ck_escrows_deposit_total_formula",
            "ck_deposits_amount_nonneg",
            "ck_deposits_confs_nonneg",
            "ck_payouts_fn_est_nonneg",
            "ck_payouts_fn_real_nonneg",
            "ck_payouts_vbytes_nonneg",
            "ck_payout_outputs_amount_nonneg",
            "ck_disputes_to_seller_nonneg",
            "ck_disputes_to_buyer_nonneg",
            "ck_disputes_price_at_open_nonneg",
            "ck_ledger_entries_amount_nonzero",
        ] {
            assert!(schema.contains(name), "{} missing from schema", name);
        }
    }
}

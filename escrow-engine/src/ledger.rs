//! Ledger Store - append-only double-entry accounting
//!
//! Accounts are keyed by `(asset, kind, ref_id)` and created through an
//! idempotent upsert. A journal groups entries that must net to zero per
//! asset; posting validates the whole journal before writing any row, and
//! runs inside a store transaction so it is all-or-nothing.

use crate::{
    error::EscrowError,
    models::{
        Asset, Escrow, LedgerAccount, LedgerAccountKind, LedgerEntry, DEPOSITS_ACCOUNT_REF,
        NETWORK_FEES_ACCOUNT_REF, PLATFORM_ACCOUNT_REF, Role,
    },
    store::{Store, Tables},
    EscrowResult,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

/// One line of a journal before it is posted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalLine {
    pub account_id: i64,
    pub asset: Asset,
    /// Signed amount, credit positive
    pub amount: i64,
    pub memo: Option<String>,
    pub ref_type: String,
    pub ref_id: String,
}

/// A balanced group of entries describing one economic event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    pub id: Uuid,
    pub lines: Vec<JournalLine>,
}

impl Journal {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            lines: Vec::new(),
        }
    }

    /// Append a line; zero amounts are skipped so callers can post optional legs
    pub fn line(
        mut self,
        account: &LedgerAccount,
        amount: i64,
        memo: &str,
        reference: (&str, String),
    ) -> Self {
        if amount != 0 {
            self.lines.push(JournalLine {
                account_id: account.id,
                asset: account.asset,
                amount,
                memo: Some(memo.to_string()),
                ref_type: reference.0.to_string(),
                ref_id: reference.1,
            });
        }
        self
    }

    /// Per-asset sums of the lines
    pub fn totals(&self) -> EscrowResult<BTreeMap<Asset, i64>> {
        let mut totals = BTreeMap::new();
        for line in &self.lines {
            let total = totals.entry(line.asset).or_insert(0i64);
            *total = total
                .checked_add(line.amount)
                .ok_or_else(|| EscrowError::invalid_argument("journal amount overflow"))?;
        }
        Ok(totals)
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

/// Ledger accounts touched by one escrow's postings
#[derive(Debug, Clone)]
pub struct EscrowAccounts {
    pub escrow: LedgerAccount,
    pub seller: LedgerAccount,
    pub buyer: LedgerAccount,
    pub platform: LedgerAccount,
    pub deposits: LedgerAccount,
    pub network_fees: LedgerAccount,
}

impl EscrowAccounts {
    /// Account credited for a payout role
    pub fn for_role(&self, role: Role) -> &LedgerAccount {
        match role {
            Role::Seller => &self.seller,
            Role::Buyer => &self.buyer,
            Role::Platform => &self.platform,
        }
    }
}

/// Idempotent upsert keyed by the unique `(asset, kind, ref_id)` triple
pub(crate) fn ensure_account_in(
    tx: &mut Tables,
    asset: Asset,
    kind: LedgerAccountKind,
    ref_id: &str,
    now: DateTime<Utc>,
) -> EscrowResult<LedgerAccount> {
    if let Some(existing) = tx.ledger_account_by_key(asset, kind, ref_id) {
        return Ok(existing.clone());
    }
    let account = tx.insert_ledger_account(|id| LedgerAccount {
        id,
        asset,
        kind,
        ref_id: ref_id.to_string(),
        name: Some(format!("{} {} {}", asset, kind, ref_id)),
        created_at: now,
    })?;
    debug!(account_id = account.id, %asset, %kind, ref_id, "Created ledger account");
    Ok(account)
}

/// Accounts for an escrow, created on first use
pub(crate) fn escrow_accounts_in(
    tx: &mut Tables,
    escrow: &Escrow,
    now: DateTime<Utc>,
) -> EscrowResult<EscrowAccounts> {
    let escrow_ref = escrow.id.to_string();
    Ok(EscrowAccounts {
        escrow: ensure_account_in(tx, escrow.asset, LedgerAccountKind::Escrow, &escrow_ref, now)?,
        seller: ensure_account_in(tx, escrow.asset, LedgerAccountKind::Seller, &escrow_ref, now)?,
        buyer: ensure_account_in(tx, escrow.asset, LedgerAccountKind::Buyer, &escrow_ref, now)?,
        platform: ensure_account_in(
            tx,
            escrow.asset,
            LedgerAccountKind::Platform,
            PLATFORM_ACCOUNT_REF,
            now,
        )?,
        deposits: ensure_account_in(
            tx,
            escrow.asset,
            LedgerAccountKind::External,
            DEPOSITS_ACCOUNT_REF,
            now,
        )?,
        network_fees: ensure_account_in(
            tx,
            escrow.asset,
            LedgerAccountKind::External,
            NETWORK_FEES_ACCOUNT_REF,
            now,
        )?,
    })
}

/// Validate and write a journal inside an open transaction
pub(crate) fn post_in(
    tx: &mut Tables,
    journal: &Journal,
    now: DateTime<Utc>,
) -> EscrowResult<Vec<LedgerEntry>> {
    if journal.lines.is_empty() {
        return Err(EscrowError::invalid_argument("journal has no entries"));
    }
    if !tx.entries_for_journal(journal.id).is_empty() {
        return Err(EscrowError::invalid_argument(format!(
            "journal {} was already posted",
            journal.id
        )));
    }

    for line in &journal.lines {
        if line.amount == 0 {
            return Err(EscrowError::invalid_argument("ledger entry amount must be non-zero"));
        }
        let account = tx
            .ledger_account(line.account_id)
            .ok_or(EscrowError::UnknownAccount(line.account_id))?;
        if account.asset != line.asset {
            return Err(EscrowError::invalid_argument(format!(
                "entry asset {} does not match account {} asset {}",
                line.asset, account.id, account.asset
            )));
        }
    }

    for (asset, imbalance) in journal.totals()? {
        if imbalance != 0 {
            return Err(EscrowError::UnbalancedJournal {
                journal_id: journal.id,
                asset,
                imbalance,
            });
        }
    }

    let mut entries = Vec::with_capacity(journal.lines.len());
    for line in &journal.lines {
        let entry = tx.insert_ledger_entry(|id| LedgerEntry {
            id,
            journal_id: journal.id,
            asset: line.asset,
            account_id: line.account_id,
            amount: line.amount,
            memo: line.memo.clone(),
            ref_type: line.ref_type.clone(),
            ref_id: line.ref_id.clone(),
            created_at: now,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Sum of every entry posted to an account
pub(crate) fn balance_in(tables: &Tables, account_id: i64) -> EscrowResult<i64> {
    if tables.ledger_account(account_id).is_none() {
        return Err(EscrowError::UnknownAccount(account_id));
    }
    tables
        .entries_for_account(account_id)
        .try_fold(0i64, |acc, entry| acc.checked_add(entry.amount))
        .ok_or_else(|| EscrowError::internal(format!("balance overflow on account {}", account_id)))
}

/// Public handle over the ledger tables
#[derive(Debug, Clone)]
pub struct LedgerStore {
    store: Store,
}

impl LedgerStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Get or create the account for `(asset, kind, ref_id)`
    pub async fn ensure_account(
        &self,
        asset: Asset,
        kind: LedgerAccountKind,
        ref_id: &str,
    ) -> EscrowResult<LedgerAccount> {
        self.store
            .transaction(|tx| ensure_account_in(tx, asset, kind, ref_id, Utc::now()))
            .await
    }

    /// Post a balanced journal atomically
    pub async fn post(&self, journal: &Journal) -> EscrowResult<Vec<LedgerEntry>> {
        let entries = self
            .store
            .transaction(|tx| post_in(tx, journal, Utc::now()))
            .await?;
        info!(
            "Posted journal {} with {} entries",
            journal.id,
            entries.len()
        );
        Ok(entries)
    }

    pub async fn balance_of(&self, account_id: i64) -> EscrowResult<i64> {
        self.store.read(|t| balance_in(t, account_id)).await
    }

    pub async fn journal_entries(&self, journal_id: Uuid) -> Vec<LedgerEntry> {
        self.store.read(|t| t.entries_for_journal(journal_id)).await
    }

    pub async fn account(
        &self,
        asset: Asset,
        kind: LedgerAccountKind,
        ref_id: &str,
    ) -> Option<LedgerAccount> {
        self.store
            .read(|t| t.ledger_account_by_key(asset, kind, ref_id).cloned())
            .await
    }
}

//! Webhook Intake - durable inbox for chain notifications
//!
//! Every notification is written to `webhook_events` before it has any
//! effect. Processing a stored event applies its effect and flips
//! `processed` in one transaction, so a crash in between leaves an
//! unprocessed event that the next delivery of the same key picks up again.
//! A key that was already processed is answered with the stored event and
//! [`WebhookEffect::AlreadyProcessed`], without applying anything twice.

use crate::{
    deposit_tracker::Sighting,
    error::EscrowError,
    escrow_manager::{self, SightingReport},
    models::{Payout, ReleaseTiming, WebhookEvent},
    payout_engine::{self, PayoutSettlement},
    store::{Store, Tables},
    EscrowResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing::{debug, info, warn};

/// Notification kinds accepted by the inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookKind {
    /// A watcher saw an output paying an escrow destination
    Deposit,
    /// A payout transaction reached its confirmations
    PayoutConfirmed,
    /// A payout transaction was dropped or rejected
    PayoutFailed,
}

impl WebhookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::PayoutConfirmed => "PAYOUT_CONFIRMED",
            Self::PayoutFailed => "PAYOUT_FAILED",
        }
    }
}

impl fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookKind {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(Self::Deposit),
            "PAYOUT_CONFIRMED" => Ok(Self::PayoutConfirmed),
            "PAYOUT_FAILED" => Ok(Self::PayoutFailed),
            other => Err(EscrowError::invalid_argument(format!(
                "unknown webhook kind: {}",
                other
            ))),
        }
    }
}

/// Body of a PAYOUT_CONFIRMED notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutConfirmedPayload {
    pub payout_id: i64,
    /// Txid seen on chain; attached first if the wallet never reported it
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub fn_real: Option<i64>,
}

/// Body of a PAYOUT_FAILED notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutFailedPayload {
    pub payout_id: i64,
    pub reason: String,
}

/// What processing an event did
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEffect {
    Deposit(SightingReport),
    PayoutConfirmed(PayoutSettlement),
    PayoutFailed(Payout),
    /// An earlier delivery of the same key was applied; nothing changed
    AlreadyProcessed,
}

/// Stored event together with its effect
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookReceipt {
    pub event: WebhookEvent,
    pub effect: WebhookEffect,
}

impl WebhookReceipt {
    pub fn is_replay(&self) -> bool {
        matches!(self.effect, WebhookEffect::AlreadyProcessed)
    }
}

fn decode<P: for<'de> Deserialize<'de>>(event: &WebhookEvent) -> EscrowResult<P> {
    serde_json::from_value(event.payload.clone()).map_err(|e| {
        EscrowError::invalid_argument(format!(
            "malformed {} payload in webhook {}: {}",
            event.kind, event.id, e
        ))
    })
}

/// Apply a stored event and mark it processed
pub(crate) fn process_in(
    tx: &mut Tables,
    event_id: i64,
    now: DateTime<Utc>,
    timing: &ReleaseTiming,
) -> EscrowResult<WebhookReceipt> {
    let mut event = tx.webhook_event(event_id)?.clone();
    if event.processed {
        return Ok(WebhookReceipt {
            event,
            effect: WebhookEffect::AlreadyProcessed,
        });
    }

    let effect = match event.kind.parse::<WebhookKind>()? {
        WebhookKind::Deposit => {
            let sighting: Sighting = decode(&event)?;
            WebhookEffect::Deposit(escrow_manager::record_sighting_in(
                tx, &sighting, now, timing,
            )?)
        }
        WebhookKind::PayoutConfirmed => {
            let payload: PayoutConfirmedPayload = decode(&event)?;
            if let Some(txid) = &payload.txid {
                payout_engine::record_broadcast_in(tx, payload.payout_id, txid, now)?;
            }
            WebhookEffect::PayoutConfirmed(payout_engine::confirm_payout_in(
                tx,
                payload.payout_id,
                payload.fn_real,
                now,
                timing,
            )?)
        }
        WebhookKind::PayoutFailed => {
            let payload: PayoutFailedPayload = decode(&event)?;
            WebhookEffect::PayoutFailed(payout_engine::fail_payout_in(
                tx,
                payload.payout_id,
                &payload.reason,
                now,
            )?)
        }
    };

    event.processed = true;
    event.processed_at = Some(now);
    let event = tx.update_webhook_event(event);
    Ok(WebhookReceipt { event, effect })
}

/// Inbox for provider notifications
#[derive(Debug, Clone)]
pub struct WebhookInbox {
    store: Store,
    timing: ReleaseTiming,
}

impl WebhookInbox {
    pub fn new(store: Store, timing: ReleaseTiming) -> Self {
        Self { store, timing }
    }

    /// Persist a notification before acting on it
    ///
    /// A duplicate key returns the stored row; `process` retries it if it
    /// is still unprocessed.
    pub async fn receive(
        &self,
        provider: &str,
        kind: WebhookKind,
        idempotency_key: &str,
        payload: serde_json::Value,
    ) -> EscrowResult<WebhookEvent> {
        if provider.trim().is_empty() {
            return Err(EscrowError::invalid_argument("webhook provider cannot be empty"));
        }
        if idempotency_key.trim().is_empty() {
            return Err(EscrowError::invalid_argument(
                "webhook idempotency key cannot be empty",
            ));
        }

        self.store
            .transaction(|tx| {
                if let Some(existing) = tx.webhook_by_key(idempotency_key, kind.as_str()) {
                    if existing.processed {
                        debug!("Webhook {} {} already processed", kind, idempotency_key);
                    } else {
                        warn!(
                            "Webhook {} {} redelivered before it was processed",
                            kind, idempotency_key
                        );
                    }
                    return Ok(existing.clone());
                }
                Ok(tx.insert_webhook_event(|id| WebhookEvent {
                    id,
                    provider: provider.to_string(),
                    kind: kind.as_str().to_string(),
                    idempotency_key: idempotency_key.to_string(),
                    payload,
                    processed: false,
                    received_at: Utc::now(),
                    processed_at: None,
                })?)
            })
            .await
    }

    /// Apply a stored event; `processed` flips only if the effect commits
    pub async fn process(&self, event_id: i64) -> EscrowResult<WebhookReceipt> {
        let timing = self.timing;
        let receipt = self
            .store
            .transaction(|tx| process_in(tx, event_id, Utc::now(), &timing))
            .await?;
        if !receipt.is_replay() {
            info!(
                "Processed webhook {} ({} {})",
                receipt.event.id, receipt.event.kind, receipt.event.idempotency_key
            );
        }
        Ok(receipt)
    }

    /// Receive and process in one call
    pub async fn handle(
        &self,
        provider: &str,
        kind: WebhookKind,
        idempotency_key: &str,
        payload: serde_json::Value,
    ) -> EscrowResult<WebhookReceipt> {
        let event = self
            .receive(provider, kind, idempotency_key, payload)
            .await?;
        self.process(event.id).await.map_err(|e| {
            warn!("Webhook {} left unprocessed: {}", event.id, e);
            e
        })
    }

    /// Events stored but not yet applied, oldest first
    pub async fn pending(&self) -> Vec<WebhookEvent> {
        self.store
            .read(|t| {
                t.webhook_events
                    .values()
                    .filter(|event| !event.processed)
                    .cloned()
                    .collect()
            })
            .await
    }
}

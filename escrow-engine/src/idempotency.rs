//! Idempotency keys for mutating operations
//!
//! A client retrying a request with the same key gets the stored response
//! instead of a second execution. Records are scoped by `(key, endpoint)`
//! and carry a SHA-256 hash of the request so a key reused for a different
//! request is rejected. Keys expire after the configured TTL (24 hours by
//! default) and may then be reused.

use crate::{error::EscrowError, models::IdempotencyKey, store::Store, EscrowResult};
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex},
};
use tracing::{debug, info};

/// Default TTL for idempotency keys (24 hours)
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: i64 = 86_400;

/// Whether the operation ran or the stored response was replayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Executed(T),
    Replayed(T),
}

impl<T> Outcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Executed(value) | Self::Replayed(value) => value,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }
}

/// Accept UUIDs or any alphanumeric token up to 255 chars
pub fn validate_idempotency_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 255
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// Hash of the endpoint and the canonical JSON body
pub fn request_hash<R: Serialize>(endpoint: &str, request: &R) -> EscrowResult<String> {
    let body = serde_json::to_vec(request)?;
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update(b"|");
    hasher.update(&body);
    Ok(format!("{:x}", hasher.finalize()))
}

type Slot = (String, String);

/// Removes the in-flight claim when the operation finishes or unwinds
struct InFlight {
    claims: Arc<Mutex<HashSet<Slot>>>,
    slot: Slot,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.remove(&self.slot);
        }
    }
}

/// Gate running each `(key, endpoint)` at most once per TTL
#[derive(Debug, Clone)]
pub struct IdempotencyGate {
    store: Store,
    ttl: Duration,
    in_flight: Arc<Mutex<HashSet<Slot>>>,
}

impl IdempotencyGate {
    pub fn new(store: Store, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run `op` unless a live record for `(key, endpoint)` already answers it
    pub async fn execute<R, T, F, Fut>(
        &self,
        key: &str,
        endpoint: &str,
        request: &R,
        op: F,
    ) -> EscrowResult<Outcome<T>>
    where
        R: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = EscrowResult<T>>,
    {
        if !validate_idempotency_key(key) {
            return Err(EscrowError::invalid_argument(format!(
                "invalid idempotency key: {:?}",
                key
            )));
        }
        if endpoint.trim().is_empty() {
            return Err(EscrowError::invalid_argument("endpoint cannot be empty"));
        }
        let hash = request_hash(endpoint, request)?;

        if let Some(replayed) = self.lookup(key, endpoint, &hash, Utc::now()).await? {
            info!("Replaying stored response for {} on {}", key, endpoint);
            return Ok(Outcome::Replayed(serde_json::from_value(replayed)?));
        }

        let _claim = self.claim(key, endpoint)?;
        // A concurrent holder may have stored its response between lookup and claim
        if let Some(replayed) = self.lookup(key, endpoint, &hash, Utc::now()).await? {
            return Ok(Outcome::Replayed(serde_json::from_value(replayed)?));
        }
        let value = op().await?;
        let snapshot = serde_json::to_value(&value)?;
        self.remember(key, endpoint, &hash, snapshot, Utc::now())
            .await?;
        Ok(Outcome::Executed(value))
    }

    /// Stored response for a live record with the same hash
    async fn lookup(
        &self,
        key: &str,
        endpoint: &str,
        hash: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<Option<serde_json::Value>> {
        let existing = self
            .store
            .read(|t| t.idempotency_key(key, endpoint).cloned())
            .await;
        match existing {
            Some(record) if record.is_expired(now) => {
                debug!("Idempotency key {} on {} expired", key, endpoint);
                Ok(None)
            }
            Some(record) if record.request_hash == hash => Ok(Some(record.response_snapshot)),
            Some(_) => Err(EscrowError::invalid_argument(format!(
                "idempotency key {} was used for a different {} request",
                key, endpoint
            ))),
            None => Ok(None),
        }
    }

    fn claim(&self, key: &str, endpoint: &str) -> EscrowResult<InFlight> {
        let slot = (key.to_string(), endpoint.to_string());
        let mut claims = self
            .in_flight
            .lock()
            .map_err(|_| EscrowError::internal("idempotency claim set poisoned"))?;
        if !claims.insert(slot.clone()) {
            return Err(EscrowError::DuplicateRequest {
                key: slot.0,
                endpoint: slot.1,
            });
        }
        Ok(InFlight {
            claims: self.in_flight.clone(),
            slot,
        })
    }

    async fn remember(
        &self,
        key: &str,
        endpoint: &str,
        hash: &str,
        snapshot: serde_json::Value,
        now: DateTime<Utc>,
    ) -> EscrowResult<IdempotencyKey> {
        let expires_at = now + self.ttl;
        self.store
            .transaction(|tx| {
                if let Some(expired) = tx
                    .idempotency_key(key, endpoint)
                    .filter(|record| record.is_expired(now))
                    .map(|record| record.id)
                {
                    tx.remove_idempotency_key(expired);
                }
                Ok(tx.insert_idempotency_key(|id| IdempotencyKey {
                    id,
                    key: key.to_string(),
                    endpoint: endpoint.to_string(),
                    request_hash: hash.to_string(),
                    response_snapshot: snapshot,
                    created_at: now,
                    expires_at: Some(expires_at),
                })?)
            })
            .await
    }

    /// Drop expired records; returns how many were removed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> EscrowResult<usize> {
        let purged = self
            .store
            .transaction(|tx| {
                let expired: Vec<i64> = tx
                    .idempotency_keys
                    .values()
                    .filter(|record| record.is_expired(now))
                    .map(|record| record.id)
                    .collect();
                for id in &expired {
                    tx.remove_idempotency_key(*id);
                }
                Ok(expired.len())
            })
            .await?;
        if purged > 0 {
            info!("Purged {} expired idempotency keys", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Created {
        escrow_id: i64,
    }

    fn gate() -> IdempotencyGate {
        IdempotencyGate::new(Store::new(), Duration::seconds(DEFAULT_IDEMPOTENCY_TTL_SECS))
    }

    #[test]
    fn test_validate_idempotency_key() {
        assert!(validate_idempotency_key("550e8400-e29b-41d4-a716-446655440000"));
        assert!(validate_idempotency_key("order_42"));
        assert!(!validate_idempotency_key(""));
        assert!(!validate_idempotency_key("has space"));
        assert!(!validate_idempotency_key(&"a".repeat(256)));
    }

    #[test]
    fn test_request_hash_depends_on_endpoint_and_body() {
        let body = serde_json::json!({ "price": 100 });
        let hash = request_hash("create_escrow", &body).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, request_hash("create_escrow", &body).unwrap());
        assert_ne!(hash, request_hash("resolve_dispute", &body).unwrap());
        assert_ne!(
            hash,
            request_hash("create_escrow", &serde_json::json!({ "price": 101 })).unwrap()
        );
    }

    #[tokio::test]
    async fn test_same_key_replays_stored_response() {
        let gate = gate();
        let calls = AtomicUsize::new(0);
        let request = serde_json::json!({ "price": 100 });

        for expected_replay in [false, true, true] {
            let outcome = gate
                .execute("key-1", "create_escrow", &request, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Created { escrow_id: 7 })
                })
                .await
                .unwrap();
            assert_eq!(outcome.is_replay(), expected_replay);
            assert_eq!(outcome.into_inner(), Created { escrow_id: 7 });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_key_reused_for_different_request_rejected() {
        let gate = gate();
        gate.execute("key-1", "create_escrow", &1, || async { Ok(1) })
            .await
            .unwrap();

        let err = gate
            .execute("key-1", "create_escrow", &2, || async { Ok(2) })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidArgument(_)));

        // Same key on another endpoint is independent
        let other = gate
            .execute("key-1", "confirm_delivery", &2, || async { Ok(2) })
            .await
            .unwrap();
        assert!(!other.is_replay());
    }

    #[tokio::test]
    async fn test_failed_operation_is_not_stored() {
        let gate = gate();
        let failed: EscrowResult<Outcome<i64>> = gate
            .execute("key-2", "resolve_dispute", &0, || async {
                Err(EscrowError::internal("wallet offline"))
            })
            .await;
        assert!(failed.is_err());

        let retried = gate
            .execute("key-2", "resolve_dispute", &0, || async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(retried, Outcome::Executed(5));
    }

    #[tokio::test]
    async fn test_in_flight_duplicate_is_rejected() {
        let gate = gate();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.execute("key-3", "open_dispute", &0, || async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(1)
                })
                .await
            })
        };

        started_rx.await.unwrap();
        let second = gate
            .execute("key-3", "open_dispute", &0, || async { Ok(2) })
            .await;
        assert!(matches!(second, Err(EscrowError::DuplicateRequest { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Outcome::Executed(1));
    }

    #[tokio::test]
    async fn test_expired_record_is_replaced() {
        let gate = IdempotencyGate::new(Store::new(), Duration::seconds(-1));
        gate.execute("key-4", "create_escrow", &1, || async { Ok(1) })
            .await
            .unwrap();

        // Expired: a different request may reuse the key
        let outcome = gate
            .execute("key-4", "create_escrow", &2, || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Executed(2));

        assert_eq!(gate.purge_expired(Utc::now()).await.unwrap(), 1);
    }
}

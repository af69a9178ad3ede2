use async_trait::async_trait;
use chrono::{Duration, Utc};
use escrow_engine::{
    config::EngineConfig,
    deposit_tracker::{DepositChange, Sighting},
    error::EscrowError,
    models::{
        Asset, DepositStatus, EscrowAmounts, EscrowState, LedgerAccountKind, NewDestination,
        NewEscrow, NewPayoutOutput, Payout, PayoutKind, PayoutOutput, PayoutStatus, Role,
        SpeedProfile, DEPOSITS_ACCOUNT_REF, NETWORK_FEES_ACCOUNT_REF, PLATFORM_ACCOUNT_REF,
    },
    node::{EscrowNode, OpenDisputeRequest, ResolveDisputeRequest},
    payout_engine::{FeeQuote, PayoutRequest},
    settlement_worker::ChainWallet,
    webhook_intake::{WebhookEffect, WebhookKind},
    EscrowResult,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

const NETWORK_FEE: i64 = 420;

#[derive(Default)]
struct StubWallet {
    broadcasts: AtomicUsize,
}

#[async_trait]
impl ChainWallet for StubWallet {
    async fn estimate_fee(
        &self,
        _asset: Asset,
        _speed: Option<SpeedProfile>,
        _outputs: &[NewPayoutOutput],
    ) -> EscrowResult<FeeQuote> {
        Ok(FeeQuote {
            fee: NETWORK_FEE,
            vbytes_est: Some(210),
        })
    }

    async fn broadcast(&self, payout: &Payout, _outputs: &[PayoutOutput]) -> EscrowResult<String> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{:064x}", payout.id))
    }
}

fn node() -> EscrowNode {
    let config = EngineConfig {
        platform_address_btc: Some("bc1qplatform".to_string()),
        platform_address_xmr: Some("4platform".to_string()),
        ..EngineConfig::default()
    };
    EscrowNode::new(config).unwrap()
}

/// price 100_000, fee 3_000, fn_est 500, buffer 500
fn btc_escrow(deposit_address: &str) -> NewEscrow {
    NewEscrow {
        asset: Asset::Btc,
        amounts: EscrowAmounts::quote(100_000, 500, 500).unwrap(),
        seller_payout_address: "bc1qseller".to_string(),
        buyer_payout_address: Some("bc1qbuyer".to_string()),
        payout_speed_profile: Some(SpeedProfile::Fast),
        destination: Some(NewDestination {
            destination: deposit_address.to_string(),
            meta: serde_json::json!({ "path": "m/84'/0'/0'/0/7" }),
        }),
    }
}

fn sighting(destination: &str, confirmations: i32) -> Sighting {
    Sighting {
        asset: Asset::Btc,
        txid: format!("tx-{}", destination),
        vout: Some(0),
        destination: destination.to_string(),
        amount: 104_000,
        confirmations,
        height_observed: Some(840_000),
    }
}

async fn funded_escrow(node: &EscrowNode, deposit_address: &str) -> i64 {
    let escrow = node
        .create_escrow(&format!("create-{}", deposit_address), btc_escrow(deposit_address))
        .await
        .unwrap()
        .into_inner();
    let receipt = node
        .webhooks()
        .handle(
            "btc-watcher",
            WebhookKind::Deposit,
            &format!("deposit-{}", deposit_address),
            serde_json::to_value(sighting(deposit_address, 10)).unwrap(),
        )
        .await
        .unwrap();
    match receipt.effect {
        WebhookEffect::Deposit(report) => {
            assert_eq!(report.outcome.change, DepositChange::Confirmed);
            assert_eq!(report.funded.map(|e| e.state), Some(EscrowState::Funded));
        }
        other => panic!("unexpected effect {:?}", other),
    }
    escrow.id
}

async fn balance(node: &EscrowNode, kind: LedgerAccountKind, ref_id: &str) -> i64 {
    let account = node.ledger().account(Asset::Btc, kind, ref_id).await.unwrap();
    node.ledger().balance_of(account.id).await.unwrap()
}

async fn confirm_payout(node: &EscrowNode, payout_id: i64) -> EscrowState {
    let receipt = node
        .webhooks()
        .handle(
            "btc-watcher",
            WebhookKind::PayoutConfirmed,
            &format!("payout-{}", payout_id),
            serde_json::json!({ "payout_id": payout_id, "fn_real": NETWORK_FEE }),
        )
        .await
        .unwrap();
    match receipt.effect {
        WebhookEffect::PayoutConfirmed(settlement) => settlement.escrow.state,
        other => panic!("unexpected effect {:?}", other),
    }
}

#[tokio::test]
async fn test_delivery_auto_release_and_settlement() {
    let node = node();
    let wallet = Arc::new(StubWallet::default());
    let worker = node.settlement_worker(wallet.clone());
    let escrow_id = funded_escrow(&node, "bc1qdeposit1").await;
    assert_eq!(node.manager().escrow_balance(escrow_id).await.unwrap(), 104_000);

    let released = node
        .confirm_delivery("deliver-1", escrow_id)
        .await
        .unwrap()
        .into_inner();
    assert_eq!(released.state, EscrowState::Released);
    let auto_release_at = released.auto_release_at.unwrap();

    // Nothing is due inside the window
    let early = worker.run_once(Utc::now()).await.unwrap();
    assert!(early.auto_released.is_empty());
    assert!(early.broadcast.is_empty());

    let report = worker
        .run_once(auto_release_at + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.auto_released, vec![escrow_id]);
    assert_eq!(report.broadcast.len(), 1);
    assert_eq!(wallet.broadcasts.load(Ordering::SeqCst), 1);

    let payout = node.payouts().payout(report.broadcast[0]).await.unwrap();
    assert_eq!(payout.payout.kind, PayoutKind::Normal);
    assert_eq!(payout.payout.feerate_profile, Some(SpeedProfile::Fast));
    assert!(payout.payout.txid.is_some());
    let roles: Vec<(Role, i64)> = payout.outputs.iter().map(|o| (o.role, o.amount)).collect();
    assert_eq!(roles, vec![(Role::Seller, 100_000), (Role::Platform, 3_000)]);

    assert_eq!(confirm_payout(&node, payout.payout.id).await, EscrowState::Closed);

    let escrow_ref = escrow_id.to_string();
    assert_eq!(balance(&node, LedgerAccountKind::Seller, &escrow_ref).await, 100_000);
    assert_eq!(balance(&node, LedgerAccountKind::Platform, PLATFORM_ACCOUNT_REF).await, 3_000);
    assert_eq!(
        balance(&node, LedgerAccountKind::External, NETWORK_FEES_ACCOUNT_REF).await,
        NETWORK_FEE
    );
    assert_eq!(
        balance(&node, LedgerAccountKind::External, DEPOSITS_ACCOUNT_REF).await,
        -104_000
    );
    // fn_est + buffer - fn_real stays behind
    assert_eq!(node.manager().escrow_balance(escrow_id).await.unwrap(), 580);

    let events: Vec<String> = node
        .get_escrow_info(escrow_id)
        .await
        .unwrap()
        .events
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    for expected in [
        "escrow.funded",
        "escrow.released",
        "escrow.auto_released",
        "payout.created",
        "payout.broadcast",
        "payout.confirmed",
        "escrow.closed",
    ] {
        assert!(events.iter().any(|e| e == expected), "missing {}", expected);
    }

    // Settled escrows are not picked up again
    let idle = worker
        .run_once(auto_release_at + Duration::days(1))
        .await
        .unwrap();
    assert!(idle.broadcast.is_empty());
}

#[tokio::test]
async fn test_dispute_refund_to_buyer() {
    let node = node();
    let worker = node.settlement_worker(Arc::new(StubWallet::default()));
    let escrow_id = funded_escrow(&node, "bc1qdeposit2").await;

    let dispute = node
        .open_dispute(
            "dispute-1",
            OpenDisputeRequest {
                escrow_id,
                opened_by: Role::Buyer,
                reason: "item never arrived".to_string(),
                evidence_url: None,
            },
        )
        .await
        .unwrap()
        .into_inner();
    assert_eq!(dispute.price_at_open, 100_000);

    // Delivery cannot be confirmed while disputed
    assert!(matches!(
        node.confirm_delivery("deliver-2", escrow_id).await,
        Err(EscrowError::InvalidStateTransition { .. })
    ));

    let overpaid = node
        .resolve_dispute(
            "resolve-bad",
            ResolveDisputeRequest {
                escrow_id,
                to_seller: 1,
                to_buyer: 100_000,
                resolved_by: "arbiter-7".to_string(),
            },
        )
        .await;
    assert!(matches!(overpaid, Err(EscrowError::InvalidArgument(_))));

    node.resolve_dispute(
        "resolve-1",
        ResolveDisputeRequest {
            escrow_id,
            to_seller: 0,
            to_buyer: 100_000,
            resolved_by: "arbiter-7".to_string(),
        },
    )
    .await
    .unwrap();

    let escrow_ref = escrow_id.to_string();
    assert_eq!(balance(&node, LedgerAccountKind::Buyer, &escrow_ref).await, 100_000);
    assert_eq!(node.manager().escrow_balance(escrow_id).await.unwrap(), 4_000);

    let report = worker.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.broadcast.len(), 1);
    let payout = node.payouts().payout(report.broadcast[0]).await.unwrap();
    assert_eq!(payout.payout.kind, PayoutKind::Dispute);
    let roles: Vec<(Role, i64)> = payout.outputs.iter().map(|o| (o.role, o.amount)).collect();
    assert_eq!(roles, vec![(Role::Buyer, 100_000), (Role::Platform, 3_000)]);

    assert_eq!(confirm_payout(&node, payout.payout.id).await, EscrowState::Closed);
    // The refund was allocated at resolution and is not credited twice
    assert_eq!(balance(&node, LedgerAccountKind::Buyer, &escrow_ref).await, 100_000);
    assert_eq!(balance(&node, LedgerAccountKind::Seller, &escrow_ref).await, 0);
    assert_eq!(node.manager().escrow_balance(escrow_id).await.unwrap(), 580);
}

#[tokio::test]
async fn test_reorg_reverts_deposit() {
    let node = node();
    let escrow = node
        .create_escrow("create-reorg", btc_escrow("bc1qdeposit3"))
        .await
        .unwrap()
        .into_inner();

    let pending = node
        .manager()
        .record_sighting(&sighting("bc1qdeposit3", 4))
        .await
        .unwrap();
    assert_eq!(pending.outcome.change, DepositChange::Created);
    assert!(pending.funded.is_none());

    let confirmed = node
        .manager()
        .record_sighting(&sighting("bc1qdeposit3", 10))
        .await
        .unwrap();
    assert_eq!(confirmed.outcome.change, DepositChange::Confirmed);
    assert!(confirmed.funded.is_some());

    let reorged = node
        .manager()
        .record_sighting(&sighting("bc1qdeposit3", 2))
        .await
        .unwrap();
    assert_eq!(reorged.outcome.change, DepositChange::Reverted);
    assert_eq!(reorged.outcome.deposit.status, DepositStatus::Pending);
    assert_eq!(node.deposits().funded_amount(escrow.id).await.unwrap(), 0);

    // Funding already posted stays; the escrow is not rolled back
    let escrow = node.manager().get_escrow(escrow.id).await.unwrap();
    assert_eq!(escrow.state, EscrowState::Funded);
    assert_eq!(node.deposits().deposits_for_escrow(escrow.id).await.len(), 1);
    assert!(node
        .manager()
        .audit_trail(escrow.id)
        .await
        .iter()
        .any(|e| e.event_type == "deposit.reorged"));
}

#[tokio::test]
async fn test_webhook_redelivery_replays_once_processed() {
    let node = node();
    let escrow_id = funded_escrow(&node, "bc1qdeposit4").await;

    let again = node
        .webhooks()
        .handle(
            "btc-watcher",
            WebhookKind::Deposit,
            "deposit-bc1qdeposit4",
            serde_json::to_value(sighting("bc1qdeposit4", 11)).unwrap(),
        )
        .await
        .unwrap();
    assert!(again.is_replay());
    assert!(again.event.processed);
    assert!(node.webhooks().pending().await.is_empty());
    assert_eq!(node.manager().escrow_balance(escrow_id).await.unwrap(), 104_000);

    let first = node.confirm_delivery("deliver-4", escrow_id).await.unwrap();
    let replay = node.confirm_delivery("deliver-4", escrow_id).await.unwrap();
    assert!(replay.is_replay());
    assert_eq!(first.into_inner(), replay.into_inner());
}

#[tokio::test]
async fn test_concurrent_payouts_single_broadcast() {
    let node = node();
    let escrow_id = funded_escrow(&node, "bc1qdeposit5").await;
    node.confirm_delivery("deliver-5", escrow_id).await.unwrap();
    let due = node
        .manager()
        .get_escrow(escrow_id)
        .await
        .unwrap()
        .auto_release_at
        .unwrap();
    node.manager().fire_due_auto_releases(due).await.unwrap();

    let request = PayoutRequest {
        escrow_id,
        kind: PayoutKind::Normal,
        outputs: vec![NewPayoutOutput {
            role: Role::Seller,
            address: "bc1qseller".to_string(),
            amount: 100_000,
        }],
        feerate_profile: Some(SpeedProfile::Fast),
        fee: FeeQuote {
            fee: NETWORK_FEE,
            vbytes_est: None,
        },
    };

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let node = node.clone();
            let request = request.clone();
            tokio::spawn(async move { node.payouts().create_payout(&request).await })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(EscrowError::ConcurrentBroadcastExists { escrow_id: id }) => {
                assert_eq!(id, escrow_id)
            }
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert_eq!(created, 1);

    let payouts = node.payouts().payouts_for_escrow(escrow_id).await;
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].status, PayoutStatus::Broadcast);

    // Workers running side by side leave the live payout alone
    let wallet = Arc::new(StubWallet::default());
    let worker = Arc::new(node.settlement_worker(wallet.clone()));
    let ticks: Vec<_> = (0..4)
        .map(|_| {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run_once(Utc::now()).await })
        })
        .collect();
    for tick in ticks {
        assert!(tick.await.unwrap().unwrap().broadcast.is_empty());
    }
    assert_eq!(wallet.broadcasts.load(Ordering::SeqCst), 0);
}

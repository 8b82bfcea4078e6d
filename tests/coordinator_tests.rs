mod common;

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::{json, Value};

use copybot::exchange::auth::canonical_json;
use copybot::execution::{run_copy_engine, CopyEngineConfig, MasterWorkers, ReplicationOutcome, SkipReason};
use copybot::models::{SizingRule, TradeSide};

use common::*;

fn market_order_bodies(transport: &ScriptedTransport) -> Vec<Value> {
    transport
        .requests_to("/orders/create_market")
        .into_iter()
        .filter_map(|r| r.body)
        .collect()
}

// ---------------------------------------------------------------------------
// Sizing scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_half_multiplier_opens_one_lot_long() {
    let transport = exchange_with_balance("1000");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("0.5")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel.clone()], CopyEngineConfig::default());

    let reports = engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.002", "50000"))
        .await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].relationship_id, rel.id);
    match &reports[0].outcome {
        ReplicationOutcome::Submitted { order, order_id } => {
            assert_eq!(order.amount, dec("0.001"));
            assert_eq!(*order_id, Some(42));
        }
        other => panic!("expected submission, got {other:?}"),
    }

    let bodies = market_order_bodies(&transport);
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["account"], "Copier1");
    assert_eq!(bodies[0]["symbol"], "BTC");
    assert_eq!(bodies[0]["amount"], "0.001");
    assert_eq!(bodies[0]["side"], "bid");
    assert_eq!(bodies[0]["reduce_only"], false);
    assert_eq!(bodies[0]["slippage_percent"], "0.5");
}

#[tokio::test]
async fn test_fixed_usd_divides_by_fill_price() {
    let transport = exchange_with_balance("1000");
    let rel = relationship("Copier1", "Master1", SizingRule::FixedUsd(dec("100")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.002", "50000"))
        .await;

    let bodies = market_order_bodies(&transport);
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["amount"], "0.002");
}

#[tokio::test]
async fn test_close_long_sells_reduce_only() {
    let transport = exchange_with_balance("1000");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::CloseLong, "0.001", "51000"))
        .await;

    let bodies = market_order_bodies(&transport);
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["side"], "ask");
    assert_eq!(bodies[0]["reduce_only"], true);
}

#[tokio::test]
async fn test_position_cap_below_one_lot_never_reaches_exchange() {
    let transport = exchange_with_balance("1000");
    let mut rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    rel.max_position_usd = Some(dec("40"));
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    let reports = engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.002", "50000"))
        .await;

    assert_eq!(reports[0].outcome, ReplicationOutcome::Skipped(SkipReason::ZeroAmount));
    assert!(market_order_bodies(&transport).is_empty());
}

#[tokio::test]
async fn test_insufficient_balance_skips_without_ordering() {
    let transport = exchange_with_balance("10");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    // 0.02 ETH × 3100 = 62 USD notional against 10 available.
    let reports = engine
        .handle_fill(&fill("Master1", "ETH", TradeSide::OpenShort, "0.02", "3100"))
        .await;

    assert_eq!(
        reports[0].outcome,
        ReplicationOutcome::Skipped(SkipReason::InsufficientBalance)
    );
    assert!(market_order_bodies(&transport).is_empty());
}

// ---------------------------------------------------------------------------
// Filters and risk limits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_allow_list_blocks_other_symbols() {
    let transport = exchange_with_balance("1000");
    let mut rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    rel.symbol_filter = vec!["ETH".into()];
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    let reports = engine
        .handle_fill(&fill("Master1", "btc", TradeSide::OpenLong, "0.002", "50000"))
        .await;

    assert_eq!(reports[0].outcome, ReplicationOutcome::Skipped(SkipReason::SymbolFiltered));
    assert!(transport.requests_to("/account").is_empty());
    assert!(market_order_bodies(&transport).is_empty());
}

#[tokio::test]
async fn test_exposure_limit_counts_open_positions() {
    let transport = exchange_with_balance("1000");
    transport.respond(
        "/positions",
        200,
        ok_body(json!([{"symbol": "ETH", "side": "bid", "amount": "0.03", "entry_price": "3000"}])),
    );
    let mut rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    rel.max_total_exposure = Some(dec("100"));
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    // 90 open + 50 new > 100
    let reports = engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.001", "50000"))
        .await;

    assert_eq!(reports[0].outcome, ReplicationOutcome::Skipped(SkipReason::ExposureExceeded));
    assert!(market_order_bodies(&transport).is_empty());
}

#[tokio::test]
async fn test_leverage_cap_within_balance_keeps_amount() {
    let transport = exchange_with_balance("100");
    let mut rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    rel.max_leverage = Some(3);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.001", "50000"))
        .await;

    let bodies = market_order_bodies(&transport);
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["amount"], "0.001");
}

// ---------------------------------------------------------------------------
// Isolation and fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bad_credential_only_skips_its_own_relationship() {
    let transport = exchange_with_balance("1000");
    let good = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let mut bad = relationship("Copier2", "Master1", SizingRule::Multiplier(dec("1")), 2);
    bad.encrypted_credential = "aes:deadbeef".into();
    let (engine, _task) = engine(transport.clone(), vec![good.clone(), bad.clone()], CopyEngineConfig::default());

    let reports = engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.002", "50000"))
        .await;

    assert_eq!(reports.len(), 2);
    for report in &reports {
        if report.relationship_id == bad.id {
            assert_eq!(report.outcome, ReplicationOutcome::Skipped(SkipReason::DecryptionFailed));
        } else {
            assert_eq!(report.relationship_id, good.id);
            assert!(matches!(report.outcome, ReplicationOutcome::Submitted { .. }));
        }
    }
    let bodies = market_order_bodies(&transport);
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["account"], "Copier1");
}

#[tokio::test]
async fn test_every_follower_gets_its_own_order() {
    let transport = exchange_with_balance("1000");
    let rels = vec![
        relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1),
        relationship("Copier2", "Master1", SizingRule::Multiplier(dec("2")), 2),
        relationship("Copier3", "Master2", SizingRule::Multiplier(dec("1")), 3),
    ];
    let (engine, _task) = engine(transport.clone(), rels, CopyEngineConfig::default());

    engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.002", "50000"))
        .await;

    let mut orders: Vec<(String, String)> = market_order_bodies(&transport)
        .iter()
        .map(|b| (b["account"].as_str().unwrap().to_string(), b["amount"].as_str().unwrap().to_string()))
        .collect();
    orders.sort();
    assert_eq!(
        orders,
        vec![
            ("Copier1".to_string(), "0.002".to_string()),
            ("Copier2".to_string(), "0.004".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_unknown_master_is_a_no_op() {
    let transport = exchange_with_balance("1000");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    let reports = engine
        .handle_fill(&fill("Stranger", "BTC", TradeSide::OpenLong, "1", "50000"))
        .await;

    assert!(reports.is_empty());
    assert!(transport.requests_to("/account").is_empty());
}

#[tokio::test]
async fn test_market_lookup_failure_falls_back_to_default_lot() {
    let transport = exchange_with_balance("1000");
    transport.respond("/info", 503, "unavailable");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("0.5")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.0025", "50000"))
        .await;

    let bodies = market_order_bodies(&transport);
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["amount"], "0.001");
}

#[tokio::test]
async fn test_dry_run_submits_nothing() {
    let transport = exchange_with_balance("1000");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let config = CopyEngineConfig {
        dry_run: true,
        ..CopyEngineConfig::default()
    };
    let (engine, _task) = engine(transport.clone(), vec![rel], config);

    let reports = engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.002", "50000"))
        .await;

    assert!(matches!(&reports[0].outcome, ReplicationOutcome::DryRun { order } if order.amount == dec("0.002")));
    assert!(market_order_bodies(&transport).is_empty());
}

#[tokio::test]
async fn test_consecutive_failures_are_counted_and_reset() {
    let transport = exchange_with_balance("1000");
    transport.respond("/orders/create_market", 500, "boom");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel.clone()], CopyEngineConfig::default());
    let f = fill("Master1", "BTC", TradeSide::OpenLong, "0.001", "50000");

    for _ in 0..5 {
        let reports = engine.handle_fill(&f).await;
        assert!(matches!(reports[0].outcome, ReplicationOutcome::Failed { .. }));
    }
    assert_eq!(engine.consecutive_failures(rel.id), 5);

    transport.respond("/orders/create_market", 200, order_ack_body(7));
    engine.handle_fill(&f).await;
    assert_eq!(engine.consecutive_failures(rel.id), 0);
}

#[tokio::test]
async fn test_exchange_rejection_is_a_failure_not_a_panic() {
    let transport = exchange_with_balance("1000");
    transport.respond(
        "/orders/create_market",
        200,
        r#"{"success":false,"data":null,"error":"Agent not authorized","code":403}"#,
    );
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    let reports = engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.001", "50000"))
        .await;

    match &reports[0].outcome {
        ReplicationOutcome::Failed { error } => assert!(error.contains("Agent not authorized")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_balance_percent_reads_the_balance_once() {
    let transport = exchange_with_balance("5000");
    let rel = relationship("Copier1", "Master1", SizingRule::BalancePercent(dec("10")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    let reports = engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.5", "50000"))
        .await;

    assert!(matches!(reports[0].outcome, ReplicationOutcome::Submitted { .. }));
    let bodies = market_order_bodies(&transport);
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["amount"], "0.01");
    assert_eq!(transport.requests_to("/account").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_copier_does_not_delay_other_followers() {
    let transport = exchange_with_balance("1000");
    transport.stall("Copier1", Duration::from_secs(8));
    let slow = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let quick = relationship("Copier2", "Master1", SizingRule::Multiplier(dec("1")), 2);
    let (engine, _task) = engine(transport.clone(), vec![slow, quick], CopyEngineConfig::default());

    let start = tokio::time::Instant::now();
    let reports = engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.001", "50000"))
        .await;
    assert!(reports
        .iter()
        .all(|r| matches!(r.outcome, ReplicationOutcome::Submitted { .. })));

    let submitted_at = |copier: &str| {
        transport
            .timed_requests()
            .into_iter()
            .find(|(_, r)| r.path == "/orders/create_market" && request_account(r).as_deref() == Some(copier))
            .map(|(at, _)| at.duration_since(start))
            .unwrap()
    };
    assert!(submitted_at("Copier2") < Duration::from_secs(1));
    assert!(submitted_at("Copier1") >= Duration::from_secs(8));
}

// ---------------------------------------------------------------------------
// Signing and ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_order_signature_verifies_against_agent_key() {
    let transport = exchange_with_balance("1000");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 9);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    engine
        .handle_fill(&fill("Master1", "BTC", TradeSide::OpenLong, "0.001", "50000"))
        .await;

    let body = market_order_bodies(&transport).remove(0);
    let expected_agent = bs58::encode(agent_key(9).verifying_key().to_bytes()).into_string();
    assert_eq!(body["agent_wallet"], expected_agent.as_str());

    let message = json!({
        "timestamp": body["timestamp"],
        "expiry_window": body["expiry_window"],
        "type": "create_market_order",
        "data": order_data(&body),
    });
    let signed = canonical_json(&message).unwrap();

    let sig_bytes: [u8; 64] = bs58::decode(body["signature"].as_str().unwrap())
        .into_vec()
        .unwrap()
        .try_into()
        .unwrap();
    let key_bytes: [u8; 32] = bs58::decode(&expected_agent).into_vec().unwrap().try_into().unwrap();
    let key = VerifyingKey::from_bytes(&key_bytes).unwrap();
    assert!(key.verify(signed.as_bytes(), &Signature::from_bytes(&sig_bytes)).is_ok());
}

#[tokio::test]
async fn test_fills_of_one_master_replicate_in_order() {
    let transport = exchange_with_balance("1000");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());

    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let runner = tokio::spawn(run_copy_engine(Arc::new(engine), rx));
    for amount in ["0.001", "0.002", "0.003", "0.004"] {
        tx.send(fill("Master1", "BTC", TradeSide::OpenLong, amount, "50000"))
            .await
            .unwrap();
    }
    drop(tx);
    runner.await.unwrap();

    let amounts: Vec<String> = market_order_bodies(&transport)
        .iter()
        .map(|b| b["amount"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(amounts, vec!["0.001", "0.002", "0.003", "0.004"]);
}

#[tokio::test]
async fn test_idle_master_workers_are_retired_and_respawned() {
    let transport = exchange_with_balance("1000");
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());
    let mut workers = MasterWorkers::new(Arc::new(engine));

    workers.dispatch(fill("Master1", "BTC", TradeSide::OpenLong, "0.001", "50000"));
    workers.dispatch(fill("Master2", "BTC", TradeSide::OpenLong, "0.001", "50000"));
    assert_eq!(workers.len(), 2);

    let mut retired = 0;
    tokio::time::timeout(Duration::from_secs(5), async {
        while retired < 2 {
            retired += workers.retire_idle();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(workers.is_empty());
    assert_eq!(market_order_bodies(&transport).len(), 1);

    // A later fill for the same master gets a fresh worker.
    workers.dispatch(fill("Master1", "BTC", TradeSide::OpenLong, "0.002", "50000"));
    assert_eq!(workers.len(), 1);
    workers.drain().await;

    let amounts: Vec<String> = market_order_bodies(&transport)
        .iter()
        .map(|b| b["amount"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(amounts, vec!["0.001", "0.002"]);
}

#[tokio::test(start_paused = true)]
async fn test_busy_master_worker_is_kept() {
    let transport = exchange_with_balance("1000");
    transport.stall("Copier1", Duration::from_secs(8));
    let rel = relationship("Copier1", "Master1", SizingRule::Multiplier(dec("1")), 1);
    let (engine, _task) = engine(transport.clone(), vec![rel], CopyEngineConfig::default());
    let mut workers = MasterWorkers::new(Arc::new(engine));

    workers.dispatch(fill("Master1", "BTC", TradeSide::OpenLong, "0.001", "50000"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(workers.retire_idle(), 0);
    assert_eq!(workers.len(), 1);

    workers.drain().await;
    assert_eq!(market_order_bodies(&transport).len(), 1);
}

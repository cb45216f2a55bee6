//! End-to-end lifecycle tests: real signatures, in-memory ledger, full
//! hook pipeline from price quote through settlement reconciliation.

use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use rust_decimal::Decimal;

use debt_gateway::verify;
use debt_gateway::{
    address_key, DebtGateway, GatewayConfig, GatewayError, HookDecision, HookPhase,
    LifecycleOutcome, PaymentEnvelope, PaymentRequirements, RoutePricing, SettleResult,
};
use debt_gateway::payload::SchemeExtra;

fn money(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn gateway() -> DebtGateway {
    let config = GatewayConfig {
        db_path: ":memory:".into(),
        payment_threshold: money("1.00"),
        ..GatewayConfig::default()
    };
    DebtGateway::new(config).unwrap()
}

fn requirements(amount: &str) -> PaymentRequirements {
    PaymentRequirements {
        scheme: "exact".into(),
        network: "eip155:8453".into(),
        asset: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
            .parse()
            .unwrap(),
        amount: amount.into(),
        pay_to: "0x2222222222222222222222222222222222222222"
            .parse()
            .unwrap(),
        extra: Some(SchemeExtra {
            name: "USD Coin".into(),
            version: "2".into(),
        }),
    }
}

/// `amount` is the decimal quote ("0.033"); `value` is the same amount in
/// the asset's atomic units ("33000").
fn signed_envelope(
    signer: &PrivateKeySigner,
    amount: &str,
    value: &str,
    nonce: u8,
) -> PaymentEnvelope {
    let reqs = requirements(amount);
    let mut auth = debt_gateway::DirectAuthorization {
        from: signer.address(),
        to: reqs.pay_to,
        value: value.into(),
        valid_after: "0".into(),
        valid_before: "99999999999".into(),
        nonce: B256::with_last_byte(nonce),
        signature: String::new(),
    };
    let hash = verify::direct_signing_hash(&auth, &reqs).unwrap();
    let sig = signer.sign_hash_sync(&hash).unwrap();
    auth.signature = format!("0x{}", alloy::hex::encode(sig.as_bytes()));

    PaymentEnvelope {
        payload: serde_json::to_value(&auth).unwrap(),
        accepted: reqs,
    }
}

#[test]
fn quote_then_accrue_then_requote() {
    let gateway = gateway();
    let signer = PrivateKeySigner::random();
    let payer = address_key(&signer.address());

    // Fresh payer: flat routes price independently of (zero) debt
    let flat = RoutePricing::Flat(money("0.01"));
    assert_eq!(
        gateway.quote(&flat, &payer).unwrap().parse::<Decimal>().unwrap(),
        money("0.01")
    );
    assert_eq!(
        gateway
            .quote(&RoutePricing::UsageMetered, &payer)
            .unwrap()
            .parse::<Decimal>()
            .unwrap(),
        Decimal::ZERO
    );

    // Accrue usage totalling 0.015 (base 0.010 + 0.005 commission at 50%)
    let config = GatewayConfig {
        db_path: ":memory:".into(),
        commission_rate: money("0.5"),
        ..GatewayConfig::default()
    };
    let gateway = DebtGateway::new(config).unwrap();
    gateway
        .meter_usage(&signer.address(), "gpt-4o", 120, 40, money("0.010"))
        .unwrap();

    assert_eq!(gateway.ledger().get_debt(&payer).unwrap(), money("0.015"));
    assert_eq!(
        gateway
            .quote(&RoutePricing::UsageMetered, &payer)
            .unwrap()
            .parse::<Decimal>()
            .unwrap(),
        money("0.015")
    );
    // Flat quote still ignores debt
    assert_eq!(
        gateway.quote(&flat, &payer).unwrap().parse::<Decimal>().unwrap(),
        money("0.01")
    );
}

#[test]
fn full_lifecycle_settles_and_reconciles() {
    let gateway = gateway();
    let signer = PrivateKeySigner::random();
    let payer = address_key(&signer.address());

    gateway
        .meter_usage(&signer.address(), "gpt-4o", 100, 50, money("0.010"))
        .unwrap();
    gateway
        .meter_usage(&signer.address(), "gpt-4o", 200, 80, money("0.020"))
        .unwrap();
    let debt = gateway.ledger().get_debt(&payer).unwrap();
    assert_eq!(debt, money("0.033")); // 10% commission on each record

    let envelope = signed_envelope(&signer, &debt.to_string(), "33000", 1);
    let outcome = gateway
        .process(&envelope, None, |p| {
            Ok(SettleResult {
                payer: Some(p),
                transaction: Some("0xaaa111".into()),
            })
        })
        .unwrap();

    match outcome {
        LifecycleOutcome::Settled(result) => {
            assert_eq!(result.payer, Some(signer.address()));
        }
        other => panic!("expected settled outcome, got {other:?}"),
    }

    assert_eq!(gateway.ledger().get_debt(&payer).unwrap(), Decimal::ZERO);
    assert!(gateway.ledger().unpaid_usage(&payer).unwrap().is_empty());

    let payment = gateway
        .ledger()
        .payment_by_tx_hash("0xaaa111")
        .unwrap()
        .unwrap();
    assert_eq!(payment.amount, money("0.033"));
}

#[test]
fn duplicate_settlement_notification_is_not_double_credited() {
    let gateway = gateway();
    let signer = PrivateKeySigner::random();
    let payer = address_key(&signer.address());

    gateway
        .meter_usage(&signer.address(), "gpt-4o", 10, 10, money("0.010"))
        .unwrap();
    let debt = gateway.ledger().get_debt(&payer).unwrap();

    // The same settlement confirmation arrives twice (retried webhook)
    for _ in 0..2 {
        let envelope = signed_envelope(&signer, &debt.to_string(), "11000", 2);
        gateway
            .process(&envelope, None, |p| {
                Ok(SettleResult {
                    payer: Some(p),
                    transaction: Some("0xdup".into()),
                })
            })
            .unwrap();
    }

    assert_eq!(gateway.ledger().get_debt(&payer).unwrap(), Decimal::ZERO);
    // Exactly one payment exists for the hash
    let payment = gateway.ledger().payment_by_tx_hash("0xdup").unwrap().unwrap();
    assert_eq!(payment.amount, debt);
}

#[test]
fn recovery_after_settlement_failure_still_reconciles() {
    let mut gateway = gateway();
    let signer = PrivateKeySigner::random();
    let payer = address_key(&signer.address());
    let payer_addr = signer.address();

    gateway
        .meter_usage(&signer.address(), "gpt-4o", 10, 10, money("0.010"))
        .unwrap();
    let debt = gateway.ledger().get_debt(&payer).unwrap();

    // Host policy: a confirmation-timeout is known-transient; the chain
    // watcher already saw the transaction, so substitute a success.
    gateway
        .pipeline_mut()
        .register(HookPhase::SettleFailure, move |_ctx| {
            Ok(HookDecision::Recover(SettleResult {
                payer: Some(payer_addr),
                transaction: Some("0xlate".into()),
            }))
        });

    let envelope = signed_envelope(&signer, &debt.to_string(), "11000", 3);
    let outcome = gateway
        .process(&envelope, None, |_| {
            Err(GatewayError::Settlement("confirmation timeout".into()))
        })
        .unwrap();

    assert!(matches!(outcome, LifecycleOutcome::Settled(_)));
    // Recovery reached after-settle, which reconciled the debt
    assert_eq!(gateway.ledger().get_debt(&payer).unwrap(), Decimal::ZERO);
    assert!(gateway.ledger().payment_by_tx_hash("0xlate").unwrap().is_some());
}

#[test]
fn indebted_payer_is_rejected_before_any_crypto() {
    let config = GatewayConfig {
        db_path: ":memory:".into(),
        payment_threshold: money("0.01"),
        ..GatewayConfig::default()
    };
    let gateway = DebtGateway::new(config).unwrap();
    let signer = PrivateKeySigner::random();

    gateway
        .meter_usage(&signer.address(), "gpt-4o", 10, 10, money("0.02"))
        .unwrap();

    // Deliberately garbage signature: it must never be inspected, because
    // the threshold gate aborts first.
    let reqs = requirements("0.022");
    let envelope = PaymentEnvelope {
        payload: serde_json::json!({
            "from": signer.address(),
            "to": reqs.pay_to,
            "value": "0.022",
            "validAfter": "0",
            "validBefore": "99999999999",
            "nonce": "0x0000000000000000000000000000000000000000000000000000000000000009",
            "signature": "0x00"
        }),
        accepted: reqs,
    };

    let outcome = gateway
        .process(&envelope, None, |p| {
            Ok(SettleResult {
                payer: Some(p),
                transaction: None,
            })
        })
        .unwrap();

    match outcome {
        LifecycleOutcome::Rejected { reason } => {
            assert!(reason.contains("payment threshold"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn ledger_survives_interleaved_payers() {
    let gateway = gateway();
    let alice = PrivateKeySigner::random();
    let bob = PrivateKeySigner::random();

    gateway
        .meter_usage(&alice.address(), "gpt-4o", 1, 1, money("0.010"))
        .unwrap();
    gateway
        .meter_usage(&bob.address(), "gpt-4o", 1, 1, money("0.020"))
        .unwrap();
    gateway
        .meter_usage(&alice.address(), "gpt-4o", 1, 1, money("0.030"))
        .unwrap();

    let alice_key = address_key(&alice.address());
    let bob_key = address_key(&bob.address());

    assert_eq!(gateway.ledger().get_debt(&alice_key).unwrap(), money("0.044"));
    assert_eq!(gateway.ledger().get_debt(&bob_key).unwrap(), money("0.022"));

    // Settling Alice leaves Bob untouched
    gateway
        .ledger()
        .apply_payment(&alice_key, money("0.044"), Some("0xalice"))
        .unwrap();
    assert_eq!(gateway.ledger().get_debt(&alice_key).unwrap(), Decimal::ZERO);
    assert_eq!(gateway.ledger().get_debt(&bob_key).unwrap(), money("0.022"));
}

//! Reconciler contract: matching, posting, replay idempotence and
//! post-settlement returns.

use std::sync::Arc;

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;

use payrail_funding::FundingGate;
use payrail_funding::FundingPolicy;
use payrail_funding::PayGateInput;
use payrail_ledger::CreateReservationRequest;
use payrail_ledger::LedgerEngine;
use payrail_ledger::PostEntryRequest;
use payrail_ledger::ReservationManager;
use payrail_liability::LiabilityAttributor;
use payrail_payments::CreateInstructionRequest;
use payrail_payments::OrchestratorConfig;
use payrail_payments::PaymentOrchestrator;
use payrail_providers::MockRailProvider;
use payrail_providers::RailProvider;
use payrail_providers::SettlementRecord;
use payrail_settlement::MatchConfig;
use payrail_settlement::SettlementReconciler;
use payrail_store::Direction;
use payrail_store::EntryType;
use payrail_store::EventFilter;
use payrail_store::EventType;
use payrail_store::InstructionStatus;
use payrail_store::MemoryStore;
use payrail_store::PayeeType;
use payrail_store::PaymentPurpose;
use payrail_store::Rail;
use payrail_store::ReservationStatus;
use payrail_store::ReserveType;
use payrail_store::SettlementStatus;
use payrail_store::SourceType;
use payrail_store::SubLedgerStore;

const TENANT: &str = "tenant-1";
const ENTITY: &str = "le-1";
const BATCH: &str = "batch-1";
const BANK: &str = "ba-1";

struct Harness {
    store: Arc<MemoryStore>,
    ledger: LedgerEngine,
    reconciler: SettlementReconciler,
    orchestrator: PaymentOrchestrator,
    funding_account: String,
}

async fn harness() -> Harness {
    let store = MemoryStore::shared();
    let ledger = LedgerEngine::new(store.clone());
    let chart = ledger
        .seed_chart(&TENANT.to_string(), &ENTITY.to_string(), "USD")
        .await
        .expect("chart");
    ledger
        .post_entry(PostEntryRequest {
            tenant_id: TENANT.into(),
            legal_entity_id: ENTITY.into(),
            debit_account_id: chart[4].id.clone(),
            credit_account_id: chart[0].id.clone(),
            amount_minor: 1_500_000,
            currency: "USD".into(),
            entry_type: EntryType::FundingSettlement,
            source_type: SourceType::Manual,
            source_id: "seed".into(),
            correlation_id: "corr-seed".into(),
            causation_id: None,
            idempotency_key: "seed".into(),
            metadata: json!({}),
        })
        .await
        .expect("fund");

    let gate = FundingGate::new(store.clone(), FundingPolicy::default());
    gate.evaluate_pay(PayGateInput {
        tenant_id: TENANT.into(),
        legal_entity_id: ENTITY.into(),
        batch_id: BATCH.into(),
        account_id: chart[0].id.clone(),
        required_minor: 420_000,
        correlation_id: "corr-1".into(),
        causation_id: None,
    })
    .await
    .expect("pay gate");

    let attributor = LiabilityAttributor::new(store.clone());
    attributor.seed().await.expect("seed return codes");

    let provider: Arc<dyn RailProvider> = Arc::new(MockRailProvider::new("mock-ach"));
    let orchestrator = PaymentOrchestrator::new(
        store.clone(),
        vec![provider],
        OrchestratorConfig::default(),
    );
    let reconciler = SettlementReconciler::new(store.clone(), MatchConfig::default());
    Harness {
        store,
        ledger,
        reconciler,
        orchestrator,
        funding_account: chart[0].id.clone(),
    }
}

async fn submitted_instruction(harness: &Harness, key: &str, payee: &str) -> (String, String) {
    let tenant = TENANT.to_string();
    let instruction = harness
        .orchestrator
        .create_instruction(CreateInstructionRequest {
            tenant_id: TENANT.into(),
            legal_entity_id: ENTITY.into(),
            purpose: PaymentPurpose::NetPay,
            direction: Direction::Outbound,
            amount_minor: 420_000,
            currency: "USD".into(),
            payee_type: PayeeType::Employee,
            payee_ref: payee.into(),
            preferred_rail: Some(Rail::Ach),
            requested_settlement_date: Utc::now().date_naive(),
            source_type: SourceType::PayrollBatch,
            source_id: BATCH.into(),
            idempotency_key: key.into(),
            correlation_id: "corr-1".into(),
            causation_id: None,
            metadata: json!({}),
        })
        .await
        .expect("create")
        .record;
    let outcome = harness
        .orchestrator
        .submit(&tenant, &instruction.id, "corr-1")
        .await
        .expect("submit");
    (instruction.id, outcome.attempt.provider_request_id)
}

fn record(trace: &str, provider_request_id: &str, status: SettlementStatus) -> SettlementRecord {
    SettlementRecord {
        bank_account_id: BANK.into(),
        rail: Rail::Ach,
        direction: Direction::Outbound,
        amount_minor: 420_000,
        currency: "USD".into(),
        status,
        external_trace_id: trace.into(),
        provider: "mock-ach".into(),
        provider_request_id: Some(provider_request_id.into()),
        payee_ref: Some("emp-bob".into()),
        return_code: None,
        return_reason: None,
        effective_date: Utc::now().date_naive(),
        raw_payload: json!({}),
    }
}

#[tokio::test]
async fn settled_record_posts_once_and_links() {
    let harness = harness().await;
    let tenant = TENANT.to_string();
    let (instruction_id, provider_request_id) =
        submitted_instruction(&harness, "pi-bob", "emp-bob").await;

    let summary = harness
        .reconciler
        .ingest(
            &tenant,
            vec![record("trace-1", &provider_request_id, SettlementStatus::Settled)],
            "corr-recon",
        )
        .await
        .expect("ingest");
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.unmatched, 0);

    let instruction = harness
        .store
        .instruction(&tenant, &instruction_id)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(instruction.status, InstructionStatus::Settled);

    let balance = harness
        .ledger
        .balance(&tenant, &harness.funding_account, None)
        .await
        .expect("balance");
    assert_eq!(balance, 1_500_000 - 420_000);

    let event = harness
        .store
        .settlement_event_by_trace(&tenant, &BANK.to_string(), Rail::Ach, "trace-1")
        .await
        .expect("lookup")
        .expect("exists");
    let links = harness
        .store
        .links_for_settlement(&tenant, &event.id)
        .await
        .expect("links");
    assert_eq!(links.len(), 1);
}

#[tokio::test]
async fn replaying_the_feed_changes_nothing() {
    let harness = harness().await;
    let tenant = TENANT.to_string();
    let (_, provider_request_id) = submitted_instruction(&harness, "pi-bob", "emp-bob").await;

    let feed = vec![
        record("trace-1", &provider_request_id, SettlementStatus::Accepted),
        record("trace-1", &provider_request_id, SettlementStatus::Settled),
    ];

    harness
        .reconciler
        .ingest(&tenant, feed.clone(), "corr-recon")
        .await
        .expect("first ingest");
    let balance_after_first = harness
        .ledger
        .balance(&tenant, &harness.funding_account, None)
        .await
        .expect("balance");

    let replay = harness
        .reconciler
        .ingest(&tenant, feed, "corr-recon")
        .await
        .expect("replay");
    assert_eq!(replay.duplicates, 2);
    assert_eq!(replay.applied, 0);

    let balance_after_replay = harness
        .ledger
        .balance(&tenant, &harness.funding_account, None)
        .await
        .expect("balance");
    assert_eq!(balance_after_first, balance_after_replay);

    let settled_events = harness
        .store
        .domain_events(
            Some(&tenant),
            &EventFilter {
                types: Some(vec![EventType::PaymentSettled]),
                ..EventFilter::default()
            },
        )
        .await
        .expect("events");
    assert_eq!(settled_events.len(), 1);
}

#[tokio::test]
async fn post_settlement_return_reverses_and_classifies() {
    let harness = harness().await;
    let tenant = TENANT.to_string();
    let (instruction_id, provider_request_id) =
        submitted_instruction(&harness, "pi-bob", "emp-bob").await;

    harness
        .reconciler
        .ingest(
            &tenant,
            vec![record("trace-1", &provider_request_id, SettlementStatus::Settled)],
            "corr-recon",
        )
        .await
        .expect("settle");

    let mut returned = record("trace-1", &provider_request_id, SettlementStatus::Returned);
    returned.return_code = Some("R01".into());
    returned.return_reason = Some("Insufficient funds".into());
    let summary = harness
        .reconciler
        .ingest(&tenant, vec![returned], "corr-recon")
        .await
        .expect("return");
    assert_eq!(summary.returns, 1);

    let instruction = harness
        .store
        .instruction(&tenant, &instruction_id)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(instruction.status, InstructionStatus::Returned);

    // The reversal restored the funding balance in full.
    let balance = harness
        .ledger
        .balance(&tenant, &harness.funding_account, None)
        .await
        .expect("balance");
    assert_eq!(balance, 1_500_000);

    let liabilities = harness
        .store
        .liability_events(&tenant)
        .await
        .expect("liabilities");
    assert_eq!(liabilities.len(), 1);
    assert_eq!(liabilities[0].return_code.as_deref(), Some("R01"));

    let reversed_events = harness
        .store
        .domain_events(
            Some(&tenant),
            &EventFilter {
                types: Some(vec![EventType::LedgerEntryReversed, EventType::PaymentReturned]),
                ..EventFilter::default()
            },
        )
        .await
        .expect("events");
    assert_eq!(reversed_events.len(), 2);
}

#[tokio::test]
async fn unmatched_records_are_parked_not_credited() {
    let harness = harness().await;
    let tenant = TENANT.to_string();

    let mut stray = record("trace-stray", "unknown-req", SettlementStatus::Settled);
    stray.provider_request_id = None;
    stray.payee_ref = Some("nobody".into());

    let summary = harness
        .reconciler
        .ingest(&tenant, vec![stray], "corr-recon")
        .await
        .expect("ingest");
    assert_eq!(summary.unmatched, 1);

    let balance = harness
        .ledger
        .balance(&tenant, &harness.funding_account, None)
        .await
        .expect("balance");
    assert_eq!(balance, 1_500_000);

    let unmatched_events = harness
        .store
        .domain_events(
            Some(&tenant),
            &EventFilter {
                types: Some(vec![EventType::SettlementUnmatched]),
                ..EventFilter::default()
            },
        )
        .await
        .expect("events");
    assert_eq!(unmatched_events.len(), 1);
}

#[tokio::test]
async fn batch_reservation_is_consumed_when_all_instructions_settle() {
    let harness = harness().await;
    let tenant = TENANT.to_string();
    let reservations = ReservationManager::new(harness.store.clone());
    let reservation = reservations
        .create(CreateReservationRequest {
            tenant_id: TENANT.into(),
            account_id: harness.funding_account.clone(),
            reserve_type: ReserveType::NetPay,
            amount_minor: 420_000,
            source_ref: BATCH.into(),
            correlation_id: "corr-1".into(),
            causation_id: None,
        })
        .await
        .expect("reserve")
        .record;

    let (_, provider_request_id) = submitted_instruction(&harness, "pi-bob", "emp-bob").await;
    harness
        .reconciler
        .ingest(
            &tenant,
            vec![record("trace-1", &provider_request_id, SettlementStatus::Settled)],
            "corr-recon",
        )
        .await
        .expect("settle");

    let reservation = harness
        .store
        .reservation(&tenant, &reservation.id)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(reservation.status, ReservationStatus::Consumed);

    let consumed_events = harness
        .store
        .domain_events(
            Some(&tenant),
            &EventFilter {
                types: Some(vec![EventType::ReservationConsumed]),
                ..EventFilter::default()
            },
        )
        .await
        .expect("events");
    assert_eq!(consumed_events.len(), 1);
}

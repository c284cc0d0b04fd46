//! Contract tests for the payment orchestrator: gate precondition,
//! idempotent submission, retry classification and rail selection.

use std::sync::Arc;

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;

use payrail_funding::FundingGate;
use payrail_funding::FundingPolicy;
use payrail_funding::PayGateInput;
use payrail_ledger::LedgerEngine;
use payrail_ledger::PostEntryRequest;
use payrail_payments::CreateInstructionRequest;
use payrail_payments::OrchestratorConfig;
use payrail_payments::PaymentOrchestrator;
use payrail_payments::PaymentsError;
use payrail_payments::default_rail;
use payrail_payments::select_provider;
use payrail_providers::MockRailProvider;
use payrail_providers::ProviderError;
use payrail_providers::RailProvider;
use payrail_store::AttemptStatus;
use payrail_store::Direction;
use payrail_store::EntryType;
use payrail_store::EventFilter;
use payrail_store::EventType;
use payrail_store::InstructionStatus;
use payrail_store::MemoryStore;
use payrail_store::PayeeType;
use payrail_store::PaymentPurpose;
use payrail_store::Rail;
use payrail_store::SourceType;
use payrail_store::SubLedgerStore;

const TENANT: &str = "tenant-1";
const ENTITY: &str = "le-1";
const BATCH: &str = "batch-1";

struct Fixture {
    store: Arc<MemoryStore>,
    orchestrator: PaymentOrchestrator,
    provider: Arc<MockRailProvider>,
}

async fn fixture() -> Fixture {
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
            correlation_id: "corr-1".into(),
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
        required_minor: 1_260_000,
        correlation_id: "corr-1".into(),
        causation_id: None,
    })
    .await
    .expect("pay gate");

    let provider = Arc::new(MockRailProvider::new("mock-ach"));
    let providers: Vec<Arc<dyn RailProvider>> = vec![provider.clone()];
    let orchestrator =
        PaymentOrchestrator::new(store.clone(), providers, OrchestratorConfig::default());
    Fixture {
        store,
        orchestrator,
        provider,
    }
}

fn instruction_request(key: &str, batch: &str) -> CreateInstructionRequest {
    CreateInstructionRequest {
        tenant_id: TENANT.into(),
        legal_entity_id: ENTITY.into(),
        purpose: PaymentPurpose::NetPay,
        direction: Direction::Outbound,
        amount_minor: 350_000,
        currency: "USD".into(),
        payee_type: PayeeType::Employee,
        payee_ref: "emp-alice".into(),
        preferred_rail: None,
        requested_settlement_date: Utc::now().date_naive(),
        source_type: SourceType::PayrollBatch,
        source_id: batch.into(),
        idempotency_key: key.into(),
        correlation_id: "corr-1".into(),
        causation_id: None,
        metadata: json!({}),
    }
}

#[tokio::test]
async fn create_instruction_is_idempotent() {
    let fixture = fixture().await;
    let first = fixture
        .orchestrator
        .create_instruction(instruction_request("pi-key", BATCH))
        .await
        .expect("create");
    let replay = fixture
        .orchestrator
        .create_instruction(instruction_request("pi-key", BATCH))
        .await
        .expect("replay");

    assert!(first.is_new);
    assert!(!replay.is_new);
    assert_eq!(first.record.id, replay.record.id);

    let events = fixture
        .store
        .domain_events(
            Some(&TENANT.to_string()),
            &EventFilter {
                types: Some(vec![EventType::PaymentInstructionCreated]),
                ..EventFilter::default()
            },
        )
        .await
        .expect("events");
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn submit_refuses_without_pay_gate_pass() {
    let fixture = fixture().await;
    let instruction = fixture
        .orchestrator
        .create_instruction(instruction_request("pi-key", "batch-without-gate"))
        .await
        .expect("create")
        .record;

    let err = fixture
        .orchestrator
        .submit(&TENANT.to_string(), &instruction.id, "corr-1")
        .await
        .expect_err("no gate pass");
    assert!(matches!(err, PaymentsError::PayGateNotPassed { .. }));

    let attempts = fixture
        .store
        .attempts_for_instruction(&TENANT.to_string(), &instruction.id)
        .await
        .expect("attempts");
    assert!(attempts.is_empty());
}

#[tokio::test]
async fn repeated_submit_yields_one_attempt_and_one_event() {
    let fixture = fixture().await;
    let tenant = TENANT.to_string();
    let instruction = fixture
        .orchestrator
        .create_instruction(instruction_request("pi-key", BATCH))
        .await
        .expect("create")
        .record;

    let first = fixture
        .orchestrator
        .submit(&tenant, &instruction.id, "corr-1")
        .await
        .expect("submit");
    let replay = fixture
        .orchestrator
        .submit(&tenant, &instruction.id, "corr-1")
        .await
        .expect("replay");

    assert!(first.is_new);
    assert!(!replay.is_new);
    assert_eq!(first.attempt.id, replay.attempt.id);
    assert_eq!(
        first.attempt.provider_request_id,
        replay.attempt.provider_request_id
    );
    assert_eq!(replay.instruction.status, InstructionStatus::Submitted);
    assert_eq!(fixture.provider.submissions().await.len(), 1);

    let events = fixture
        .store
        .domain_events(
            Some(&tenant),
            &EventFilter {
                types: Some(vec![EventType::PaymentSubmitted]),
                ..EventFilter::default()
            },
        )
        .await
        .expect("events");
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn transient_provider_errors_are_retried() {
    let fixture = fixture().await;
    let tenant = TENANT.to_string();
    fixture
        .provider
        .script_submit_error(ProviderError::Network {
            provider: "mock-ach".into(),
            detail: "timeout".into(),
        })
        .await;
    fixture
        .provider
        .script_submit_error(ProviderError::RateLimited {
            provider: "mock-ach".into(),
        })
        .await;

    let instruction = fixture
        .orchestrator
        .create_instruction(instruction_request("pi-key", BATCH))
        .await
        .expect("create")
        .record;
    let outcome = fixture
        .orchestrator
        .submit(&tenant, &instruction.id, "corr-1")
        .await
        .expect("submit succeeds on third try");

    assert!(outcome.is_new);
    assert_eq!(outcome.attempt.status, AttemptStatus::Submitted);
    assert_eq!(outcome.instruction.status, InstructionStatus::Submitted);
}

#[tokio::test]
async fn permanent_provider_error_records_failed_attempt() {
    let fixture = fixture().await;
    let tenant = TENANT.to_string();
    fixture
        .provider
        .script_submit_error(ProviderError::InvalidAccount {
            detail: "account is closed".into(),
        })
        .await;

    let instruction = fixture
        .orchestrator
        .create_instruction(instruction_request("pi-key", BATCH))
        .await
        .expect("create")
        .record;
    let outcome = fixture
        .orchestrator
        .submit(&tenant, &instruction.id, "corr-1")
        .await
        .expect("terminal failure is recorded, not raised");

    assert_eq!(outcome.attempt.status, AttemptStatus::Failed);
    assert_eq!(outcome.instruction.status, InstructionStatus::Failed);

    let events = fixture
        .store
        .domain_events(
            Some(&tenant),
            &EventFilter {
                types: Some(vec![EventType::PaymentFailed]),
                ..EventFilter::default()
            },
        )
        .await
        .expect("events");
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn cancel_from_submitted_goes_through_the_provider() {
    let fixture = fixture().await;
    let tenant = TENANT.to_string();
    let instruction = fixture
        .orchestrator
        .create_instruction(instruction_request("pi-key", BATCH))
        .await
        .expect("create")
        .record;
    fixture
        .orchestrator
        .submit(&tenant, &instruction.id, "corr-1")
        .await
        .expect("submit");

    let canceled = fixture
        .orchestrator
        .cancel(&tenant, &instruction.id)
        .await
        .expect("cancel");
    assert_eq!(canceled.status, InstructionStatus::Canceled);
    assert_eq!(fixture.provider.canceled().await.len(), 1);

    let err = fixture
        .orchestrator
        .cancel(&tenant, &instruction.id)
        .await
        .expect_err("terminal instructions cannot cancel");
    assert!(matches!(err, PaymentsError::InvalidState { .. }));
}

#[tokio::test]
async fn tie_break_prefers_cost_then_speed_then_success_rate() {
    let today = Utc::now().date_naive();
    let cheap_slow: Arc<dyn RailProvider> = Arc::new(
        MockRailProvider::new("cheap-slow")
            .with_cost(10)
            .with_settlement_days(2),
    );
    let pricey_fast: Arc<dyn RailProvider> = Arc::new(
        MockRailProvider::new("pricey-fast")
            .with_cost(90)
            .with_settlement_days(0),
    );
    let providers = vec![cheap_slow, pricey_fast];

    // Urgent payment: only the fast provider meets the date.
    let urgent = select_provider(&providers, Rail::Ach, 100_000, today, today).expect("chosen");
    assert_eq!(urgent.name(), "pricey-fast");

    // Relaxed date: both are on time, lowest cost wins.
    let relaxed = select_provider(
        &providers,
        Rail::Ach,
        100_000,
        today + chrono::Duration::days(5),
        today,
    )
    .expect("chosen");
    assert_eq!(relaxed.name(), "cheap-slow");

    // Identical cost and speed fall through to the success rate.
    let steady: Arc<dyn RailProvider> = Arc::new(
        MockRailProvider::new("steady").with_cost(25).with_success_rate(0.999),
    );
    let flaky: Arc<dyn RailProvider> =
        Arc::new(MockRailProvider::new("flaky").with_cost(25).with_success_rate(0.8));
    let chosen = select_provider(
        &[flaky, steady],
        Rail::Ach,
        100_000,
        today + chrono::Duration::days(5),
        today,
    )
    .expect("chosen");
    assert_eq!(chosen.name(), "steady");
}

#[tokio::test]
async fn amount_limits_exclude_providers() {
    let today = Utc::now().date_naive();
    let small: Arc<dyn RailProvider> =
        Arc::new(MockRailProvider::new("small").with_max_per_txn(100_000));
    assert!(select_provider(&[small], Rail::Ach, 200_000, today, today).is_none());
}

#[tokio::test]
async fn default_rails_follow_purpose() {
    assert_eq!(default_rail(PaymentPurpose::NetPay), Rail::Ach);
    assert_eq!(default_rail(PaymentPurpose::TaxRemittance), Rail::FedNow);
}

#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::OwnedMutexGuard;

mod memory;
pub mod rows;
pub mod transitions;

pub use memory::MemoryStore;
pub use rows::*;
pub use transitions::AttemptStatus;
pub use transitions::FundingRequestStatus;
pub use transitions::InstructionStatus;
pub use transitions::ReservationStatus;
pub use transitions::SettlementStatus;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid {entity} transition: {from} -> {to}")]
    Transition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Result of an idempotent write: the persisted record and whether this call
/// created it. Callers gate every downstream effect on `is_new`.
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted<T> {
    pub record: T,
    pub is_new: bool,
}

impl<T> Inserted<T> {
    pub fn new(record: T) -> Self {
        Self {
            record,
            is_new: true,
        }
    }

    pub fn existing(record: T) -> Self {
        Self {
            record,
            is_new: false,
        }
    }
}

/// Sha-256 digest over the semantically relevant fields of a request, so an
/// idempotency-key replay with a different payload is detectable as a
/// conflict rather than treated as a benign retry.
pub fn fingerprint<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update(b"|");
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub types: Option<Vec<EventType>>,
    pub categories: Option<Vec<EventCategory>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub correlation_id: Option<CorrelationId>,
}

impl EventFilter {
    pub fn matches(&self, event: &DomainEventRow) -> bool {
        if let Some(types) = &self.types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(categories) = &self.categories
            && !categories.contains(&event.category)
        {
            return false;
        }
        if let Some(from) = self.from
            && event.occurred_at < from
        {
            return false;
        }
        if let Some(to) = self.to
            && event.occurred_at > to
        {
            return false;
        }
        if let Some(correlation) = &self.correlation_id
            && &event.correlation_id != correlation
        {
            return false;
        }
        true
    }
}

/// Forward advance of a settlement event, optionally carrying the return
/// details the provider reported with the new status.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementAdvance {
    pub to: SettlementStatus,
    pub return_code: Option<String>,
    pub return_reason: Option<String>,
}

/// Match targets for a settlement event. Each side is set at most once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettlementMatch {
    pub instruction_id: Option<InstructionId>,
    pub funding_request_id: Option<FundingRequestId>,
}

/// Explicit, session-scoped authorization for GDPR erasure of domain
/// events. Domain events are otherwise append-only; no other write path can
/// remove one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GdprErasureGrant {
    pub operator: String,
    pub reason: String,
    pub granted_at: DateTime<Utc>,
}

impl GdprErasureGrant {
    pub fn new(operator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            reason: reason.into(),
            granted_at: Utc::now(),
        }
    }
}

/// Storage contract for the sub-ledger. Every method is atomic, and every
/// invariant in the data model is enforced here regardless of what the
/// calling engine validated. Mutating methods accept the domain events to
/// append with the write so an observer never sees an event for a
/// non-persisted change.
#[async_trait]
pub trait SubLedgerStore: Send + Sync {
    // Ledger accounts
    async fn insert_account(
        &self,
        row: LedgerAccountRow,
    ) -> StoreResult<Inserted<LedgerAccountRow>>;
    async fn account(
        &self,
        tenant: &TenantId,
        id: &AccountId,
    ) -> StoreResult<Option<LedgerAccountRow>>;
    async fn find_account(
        &self,
        tenant: &TenantId,
        legal_entity: &LegalEntityId,
        account_type: AccountType,
        currency: &str,
    ) -> StoreResult<Option<LedgerAccountRow>>;
    async fn close_account(
        &self,
        tenant: &TenantId,
        id: &AccountId,
    ) -> StoreResult<LedgerAccountRow>;

    // Bank accounts
    async fn upsert_bank_account(&self, row: BankAccountRow) -> StoreResult<BankAccountRow>;
    async fn bank_account(
        &self,
        tenant: &TenantId,
        id: &BankAccountId,
    ) -> StoreResult<Option<BankAccountRow>>;

    // Ledger entries (append-only)
    async fn insert_ledger_entry(
        &self,
        row: LedgerEntryRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<LedgerEntryRow>>;
    /// Inserts the reversal entry and sets the original's back-pointer in
    /// one atomic step. The only write path that touches `reversed_by`.
    async fn link_reversal(
        &self,
        tenant: &TenantId,
        original_id: &EntryId,
        reversal: LedgerEntryRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<LedgerEntryRow>>;
    async fn ledger_entry(
        &self,
        tenant: &TenantId,
        id: &EntryId,
    ) -> StoreResult<Option<LedgerEntryRow>>;
    async fn ledger_entry_by_key(
        &self,
        tenant: &TenantId,
        key: &IdempotencyKey,
    ) -> StoreResult<Option<LedgerEntryRow>>;
    async fn entries_touching_account(
        &self,
        tenant: &TenantId,
        account_id: &AccountId,
        as_of: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<LedgerEntryRow>>;

    // Reservations
    async fn insert_reservation(
        &self,
        row: ReservationRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<ReservationRow>>;
    async fn transition_reservation(
        &self,
        tenant: &TenantId,
        id: &ReservationId,
        to: ReservationStatus,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<ReservationRow>;
    async fn reservation(
        &self,
        tenant: &TenantId,
        id: &ReservationId,
    ) -> StoreResult<Option<ReservationRow>>;
    async fn active_reservations(
        &self,
        tenant: &TenantId,
        account_id: &AccountId,
    ) -> StoreResult<Vec<ReservationRow>>;
    async fn reservations_by_source(
        &self,
        tenant: &TenantId,
        source_ref: &str,
    ) -> StoreResult<Vec<ReservationRow>>;

    // Funding requests and gate evaluations
    async fn insert_funding_request(
        &self,
        row: FundingRequestRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<FundingRequestRow>>;
    async fn transition_funding_request(
        &self,
        tenant: &TenantId,
        id: &FundingRequestId,
        to: FundingRequestStatus,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<FundingRequestRow>;
    async fn funding_request(
        &self,
        tenant: &TenantId,
        id: &FundingRequestId,
    ) -> StoreResult<Option<FundingRequestRow>>;
    async fn funding_requests(&self, tenant: &TenantId) -> StoreResult<Vec<FundingRequestRow>>;
    async fn insert_gate_evaluation(
        &self,
        row: FundingGateEvaluationRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<FundingGateEvaluationRow>>;
    async fn gate_evaluation_by_key(
        &self,
        tenant: &TenantId,
        key: &IdempotencyKey,
    ) -> StoreResult<Option<FundingGateEvaluationRow>>;

    // Payment instructions and attempts
    async fn insert_instruction(
        &self,
        row: PaymentInstructionRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<PaymentInstructionRow>>;
    async fn transition_instruction(
        &self,
        tenant: &TenantId,
        id: &InstructionId,
        to: InstructionStatus,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<PaymentInstructionRow>;
    async fn instruction(
        &self,
        tenant: &TenantId,
        id: &InstructionId,
    ) -> StoreResult<Option<PaymentInstructionRow>>;
    async fn instruction_by_key(
        &self,
        tenant: &TenantId,
        key: &IdempotencyKey,
    ) -> StoreResult<Option<PaymentInstructionRow>>;
    async fn instructions_for_source(
        &self,
        tenant: &TenantId,
        source_id: &str,
    ) -> StoreResult<Vec<PaymentInstructionRow>>;
    async fn insert_attempt(
        &self,
        row: PaymentAttemptRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<PaymentAttemptRow>>;
    async fn transition_attempt(
        &self,
        tenant: &TenantId,
        id: &AttemptId,
        to: AttemptStatus,
    ) -> StoreResult<PaymentAttemptRow>;
    async fn attempt_by_provider_ref(
        &self,
        provider: &str,
        provider_request_id: &str,
    ) -> StoreResult<Option<PaymentAttemptRow>>;
    async fn attempts_for_instruction(
        &self,
        tenant: &TenantId,
        instruction_id: &InstructionId,
    ) -> StoreResult<Vec<PaymentAttemptRow>>;
    async fn open_attempts(&self, tenant: &TenantId) -> StoreResult<Vec<PaymentAttemptRow>>;

    // Settlement events and links
    async fn insert_settlement_event(
        &self,
        row: SettlementEventRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<SettlementEventRow>>;
    async fn advance_settlement_event(
        &self,
        tenant: &TenantId,
        id: &SettlementEventId,
        advance: SettlementAdvance,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<SettlementEventRow>;
    async fn attach_settlement_match(
        &self,
        tenant: &TenantId,
        id: &SettlementEventId,
        matched: SettlementMatch,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<SettlementEventRow>;
    async fn settlement_event(
        &self,
        tenant: &TenantId,
        id: &SettlementEventId,
    ) -> StoreResult<Option<SettlementEventRow>>;
    async fn settlement_event_by_trace(
        &self,
        tenant: &TenantId,
        bank_account_id: &BankAccountId,
        rail: Rail,
        external_trace_id: &str,
    ) -> StoreResult<Option<SettlementEventRow>>;
    /// All settlement events for a tenant; the manual-review queue is the
    /// subset that never matched.
    async fn settlement_events(&self, tenant: &TenantId) -> StoreResult<Vec<SettlementEventRow>>;
    async fn insert_settlement_link(
        &self,
        row: SettlementLinkRow,
    ) -> StoreResult<Inserted<SettlementLinkRow>>;
    async fn links_for_settlement(
        &self,
        tenant: &TenantId,
        settlement_event_id: &SettlementEventId,
    ) -> StoreResult<Vec<SettlementLinkRow>>;

    // Liability events and return-code reference
    async fn insert_liability_event(
        &self,
        row: LiabilityEventRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<LiabilityEventRow>>;
    async fn liability_events(&self, tenant: &TenantId) -> StoreResult<Vec<LiabilityEventRow>>;
    async fn seed_return_codes(&self, rows: Vec<ReturnCodeReferenceRow>) -> StoreResult<()>;
    async fn return_code(
        &self,
        rail: Rail,
        code: &str,
    ) -> StoreResult<Option<ReturnCodeReferenceRow>>;

    // Domain events and subscriptions
    async fn append_domain_event(
        &self,
        row: DomainEventRow,
    ) -> StoreResult<Inserted<DomainEventRow>>;
    async fn domain_events(
        &self,
        tenant: Option<&TenantId>,
        filter: &EventFilter,
    ) -> StoreResult<Vec<DomainEventRow>>;
    async fn upsert_subscription(
        &self,
        row: EventSubscriptionRow,
    ) -> StoreResult<EventSubscriptionRow>;
    async fn subscription(&self, name: &str) -> StoreResult<Option<EventSubscriptionRow>>;
    async fn events_for_subscriber(
        &self,
        name: &str,
        limit: usize,
    ) -> StoreResult<Vec<DomainEventRow>>;
    async fn update_subscription_cursor(
        &self,
        name: &str,
        event_id: &EventId,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn erase_domain_event(
        &self,
        grant: &GdprErasureGrant,
        tenant: &TenantId,
        event_id: &EventId,
    ) -> StoreResult<bool>;

    /// Hands out a per-key mutex guard. Lock keys are plain strings such as
    /// `account:{tenant}:{id}` or `batch:{tenant}:{batch}`; holders
    /// serialize against each other for the lifetime of the guard.
    async fn advisory_lock(&self, key: &str) -> OwnedMutexGuard<()>;
}

//! Persisted row types for every table in the sub-ledger. Rows are plain
//! data; all invariant enforcement happens at the storage boundary.

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::transitions::AttemptStatus;
use crate::transitions::FundingRequestStatus;
use crate::transitions::InstructionStatus;
use crate::transitions::ReservationStatus;
use crate::transitions::SettlementStatus;

pub type TenantId = String;
pub type LegalEntityId = String;
pub type AccountId = String;
pub type BankAccountId = String;
pub type EntryId = String;
pub type ReservationId = String;
pub type FundingRequestId = String;
pub type EvaluationId = String;
pub type InstructionId = String;
pub type AttemptId = String;
pub type SettlementEventId = String;
pub type SettlementLinkId = String;
pub type LiabilityEventId = String;
pub type EventId = String;
pub type IdempotencyKey = String;
pub type CorrelationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    ClientFundingClearing,
    ClientNetPayPayable,
    ClientTaxImpoundPayable,
    ClientThirdPartyPayable,
    PspSettlementClearing,
    PspFeesRevenue,
}

impl AccountType {
    pub const ALL: [AccountType; 6] = [
        AccountType::ClientFundingClearing,
        AccountType::ClientNetPayPayable,
        AccountType::ClientTaxImpoundPayable,
        AccountType::ClientThirdPartyPayable,
        AccountType::PspSettlementClearing,
        AccountType::PspFeesRevenue,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rail {
    Ach,
    Wire,
    Rtp,
    FedNow,
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    FundingSettlement,
    PaymentSettlement,
    Reversal,
    Fee,
    Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    PayrollBatch,
    FundingRequest,
    PaymentInstruction,
    SettlementEvent,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveType {
    NetPay,
    Tax,
    ThirdParty,
    Fees,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingModel {
    PrefundAll,
    NetOnly,
    NetAndThirdParty,
    SplitSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Commit,
    Pay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    SoftFail,
    HardFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    InsufficientFunds,
    NsfReturn,
    RiskyBankChange,
    TaxDueShortfall,
    FundingNotSettled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    NetPay,
    TaxRemittance,
    ThirdPartyPayment,
    FeeCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayeeType {
    Employee,
    TaxAgency,
    ThirdParty,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiabilitySource {
    Instruction,
    Settlement,
    FundingRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    Employer,
    Recipient,
    Bank,
    Provider,
    Psp,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiabilityParty {
    Employer,
    Employee,
    Psp,
    Provider,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPath {
    OffsetFuture,
    Reclaim,
    WriteOff,
    Insurance,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    Recovered,
    WrittenOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Ledger,
    Reservation,
    Funding,
    Payment,
    Settlement,
    Liability,
    Operational,
}

/// Closed set of domain event names. Names are immutable; payload fields are
/// additive-only, and a breaking payload change introduces a V2 name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    PaymentInstructionCreated,
    PaymentSubmitted,
    PaymentAccepted,
    PaymentSettled,
    PaymentReturned,
    PaymentFailed,
    LedgerEntryPosted,
    LedgerEntryReversed,
    ReservationCreated,
    ReservationReleased,
    ReservationConsumed,
    FundingRequested,
    FundingSettled,
    FundingBlocked,
    LiabilityClassified,
    SettlementUnmatched,
    OperationalAlert,
}

impl EventType {
    pub fn category(self) -> EventCategory {
        match self {
            EventType::PaymentInstructionCreated
            | EventType::PaymentSubmitted
            | EventType::PaymentAccepted
            | EventType::PaymentSettled
            | EventType::PaymentReturned
            | EventType::PaymentFailed => EventCategory::Payment,
            EventType::LedgerEntryPosted | EventType::LedgerEntryReversed => {
                EventCategory::Ledger
            }
            EventType::ReservationCreated
            | EventType::ReservationReleased
            | EventType::ReservationConsumed => EventCategory::Reservation,
            EventType::FundingRequested
            | EventType::FundingSettled
            | EventType::FundingBlocked => EventCategory::Funding,
            EventType::LiabilityClassified => EventCategory::Liability,
            EventType::SettlementUnmatched => EventCategory::Settlement,
            EventType::OperationalAlert => EventCategory::Operational,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccountRow {
    pub id: AccountId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub account_type: AccountType,
    pub currency: String,
    pub status: AccountStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankAccountRow {
    pub id: BankAccountId,
    pub tenant_id: TenantId,
    /// Tokenized account reference; the raw account number never enters the
    /// sub-ledger.
    pub token: String,
    pub rails: Vec<Rail>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntryRow {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub debit_account_id: AccountId,
    pub credit_account_id: AccountId,
    pub amount_minor: i64,
    pub currency: String,
    pub entry_type: EntryType,
    pub source_type: SourceType,
    pub source_id: String,
    pub correlation_id: CorrelationId,
    pub idempotency_key: IdempotencyKey,
    pub request_fingerprint: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub posted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_by: Option<EntryId>,
    #[serde(default)]
    pub is_reversal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRow {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub reserve_type: ReserveType,
    pub amount_minor: i64,
    pub status: ReservationStatus,
    /// Business reference the hold belongs to, typically a payroll batch id.
    pub source_ref: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRequestRow {
    pub id: FundingRequestId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub funding_model: FundingModel,
    pub rail: Rail,
    pub amount_minor: i64,
    pub currency: String,
    pub requested_settlement_date: NaiveDate,
    pub status: FundingRequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    pub idempotency_key: IdempotencyKey,
    pub request_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingGateEvaluationRow {
    pub id: EvaluationId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub batch_id: String,
    pub gate_type: GateType,
    pub outcome: GateOutcome,
    pub required_minor: i64,
    pub available_minor: i64,
    pub reasons: Vec<GateReason>,
    pub correlation_id: CorrelationId,
    pub idempotency_key: IdempotencyKey,
    pub request_fingerprint: String,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstructionRow {
    pub id: InstructionId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub purpose: PaymentPurpose,
    pub direction: Direction,
    pub amount_minor: i64,
    pub currency: String,
    pub payee_type: PayeeType,
    pub payee_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_rail: Option<Rail>,
    pub requested_settlement_date: NaiveDate,
    pub status: InstructionStatus,
    pub source_type: SourceType,
    pub source_id: String,
    pub idempotency_key: IdempotencyKey,
    pub request_fingerprint: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttemptRow {
    pub id: AttemptId,
    pub tenant_id: TenantId,
    pub instruction_id: InstructionId,
    pub rail: Rail,
    pub provider: String,
    pub provider_request_id: String,
    pub status: AttemptStatus,
    #[serde(default)]
    pub request_payload: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEventRow {
    pub id: SettlementEventId,
    pub tenant_id: TenantId,
    pub bank_account_id: BankAccountId,
    pub rail: Rail,
    pub direction: Direction,
    pub amount_minor: i64,
    pub currency: String,
    pub status: SettlementStatus,
    pub external_trace_id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payee_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_reason: Option<String>,
    pub effective_date: NaiveDate,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
    /// Set exactly once when the record is matched to an instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_id: Option<InstructionId>,
    /// Set exactly once when the record is matched to an inbound funding
    /// request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_request_id: Option<FundingRequestId>,
    pub recorded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementEventRow {
    pub fn is_matched(&self) -> bool {
        self.instruction_id.is_some() || self.funding_request_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementLinkRow {
    pub id: SettlementLinkId,
    pub tenant_id: TenantId,
    pub settlement_event_id: SettlementEventId,
    pub ledger_entry_id: EntryId,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiabilityEventRow {
    pub id: LiabilityEventId,
    pub tenant_id: TenantId,
    pub source: LiabilitySource,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rail: Option<Rail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<String>,
    /// The employer (or other counterparty) the determination is charged
    /// against; used for repeat-offense overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_ref: Option<String>,
    pub error_origin: ErrorOrigin,
    pub liability_party: LiabilityParty,
    pub recovery_path: RecoveryPath,
    pub loss_minor: i64,
    pub recovery_status: RecoveryStatus,
    pub determination_reason: String,
    #[serde(default)]
    pub evidence: serde_json::Value,
    pub idempotency_key: IdempotencyKey,
    pub request_fingerprint: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnCodeReferenceRow {
    pub rail: Rail,
    pub code: String,
    pub error_origin: ErrorOrigin,
    pub liability_party: LiabilityParty,
    pub is_recoverable: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEventRow {
    pub event_id: EventId,
    pub event_type: EventType,
    pub category: EventCategory,
    pub tenant_id: TenantId,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub version: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscriptionRow {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_filter: Option<Vec<EventType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_filter: Option<Vec<EventCategory>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_filter: Option<TenantId>,
    pub active: bool,
}

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::EventFilter;
use crate::GdprErasureGrant;
use crate::Inserted;
use crate::SettlementAdvance;
use crate::SettlementMatch;
use crate::StoreError;
use crate::StoreResult;
use crate::SubLedgerStore;
use crate::rows::AccountId;
use crate::rows::AccountStatus;
use crate::rows::AccountType;
use crate::rows::AttemptId;
use crate::rows::BankAccountId;
use crate::rows::BankAccountRow;
use crate::rows::DomainEventRow;
use crate::rows::EntryId;
use crate::rows::EntryType;
use crate::rows::EventId;
use crate::rows::EventSubscriptionRow;
use crate::rows::FundingGateEvaluationRow;
use crate::rows::FundingRequestId;
use crate::rows::FundingRequestRow;
use crate::rows::IdempotencyKey;
use crate::rows::InstructionId;
use crate::rows::LedgerAccountRow;
use crate::rows::LedgerEntryRow;
use crate::rows::LegalEntityId;
use crate::rows::LiabilityEventId;
use crate::rows::LiabilityEventRow;
use crate::rows::PaymentAttemptRow;
use crate::rows::PaymentInstructionRow;
use crate::rows::Rail;
use crate::rows::ReservationId;
use crate::rows::ReservationRow;
use crate::rows::ReturnCodeReferenceRow;
use crate::rows::SettlementEventId;
use crate::rows::SettlementEventRow;
use crate::rows::SettlementLinkId;
use crate::rows::SettlementLinkRow;
use crate::rows::TenantId;
use crate::transitions::AttemptStatus;
use crate::transitions::FundingRequestStatus;
use crate::transitions::InstructionStatus;
use crate::transitions::ReservationStatus;

/// Reference `SubLedgerStore` backed by process memory. State lives behind a
/// single `tokio::sync::Mutex`, so every trait method is atomic; production
/// deployments put the same contract in front of a database.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<(TenantId, AccountId), LedgerAccountRow>,
    account_index: HashMap<(TenantId, LegalEntityId, AccountType, String), AccountId>,
    bank_accounts: HashMap<(TenantId, BankAccountId), BankAccountRow>,
    entries: HashMap<(TenantId, EntryId), LedgerEntryRow>,
    entry_keys: HashMap<(TenantId, IdempotencyKey), EntryId>,
    reservations: HashMap<(TenantId, ReservationId), ReservationRow>,
    funding_requests: HashMap<(TenantId, FundingRequestId), FundingRequestRow>,
    funding_request_keys: HashMap<(TenantId, IdempotencyKey), FundingRequestId>,
    gate_evaluations: HashMap<(TenantId, IdempotencyKey), FundingGateEvaluationRow>,
    instructions: HashMap<(TenantId, InstructionId), PaymentInstructionRow>,
    instruction_keys: HashMap<(TenantId, IdempotencyKey), InstructionId>,
    attempts: HashMap<(TenantId, AttemptId), PaymentAttemptRow>,
    attempt_provider_index: HashMap<(String, String), (TenantId, AttemptId)>,
    settlement_events: HashMap<(TenantId, SettlementEventId), SettlementEventRow>,
    settlement_trace_index: HashMap<(TenantId, BankAccountId, Rail, String), SettlementEventId>,
    settlement_links: HashMap<(TenantId, SettlementLinkId), SettlementLinkRow>,
    settlement_link_index: HashSet<(TenantId, SettlementEventId, EntryId)>,
    liability_events: HashMap<(TenantId, LiabilityEventId), LiabilityEventRow>,
    liability_keys: HashMap<(TenantId, IdempotencyKey), LiabilityEventId>,
    return_codes: HashMap<(Rail, String), ReturnCodeReferenceRow>,
    domain_events: Vec<DomainEventRow>,
    domain_event_ids: HashSet<EventId>,
    subscriptions: HashMap<String, EventSubscriptionRow>,
}

impl State {
    fn append_events(&mut self, events: Vec<DomainEventRow>) {
        for event in events {
            if self.domain_event_ids.insert(event.event_id.clone()) {
                self.domain_events.push(event);
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn ensure_positive(amount_minor: i64, what: &str) -> StoreResult<()> {
        if amount_minor <= 0 {
            return Err(StoreError::Validation(format!(
                "{what} amount must be strictly positive, got {amount_minor}"
            )));
        }
        Ok(())
    }

    fn ensure_currency(code: &str) -> StoreResult<()> {
        if code.len() == 3 && code.chars().all(|ch| ch.is_ascii_uppercase()) {
            Ok(())
        } else {
            Err(StoreError::Validation(format!(
                "invalid ISO-4217 currency code {code}"
            )))
        }
    }

    fn posting_account<'a>(
        state: &'a State,
        tenant: &TenantId,
        account_id: &AccountId,
    ) -> StoreResult<&'a LedgerAccountRow> {
        let account = state
            .accounts
            .get(&(tenant.clone(), account_id.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("ledger account {account_id}")))?;
        if account.status != AccountStatus::Active {
            return Err(StoreError::Validation(format!(
                "ledger account {account_id} is closed"
            )));
        }
        Ok(account)
    }

    fn validate_entry(state: &State, row: &LedgerEntryRow) -> StoreResult<()> {
        Self::ensure_positive(row.amount_minor, "ledger entry")?;
        Self::ensure_currency(&row.currency)?;
        if row.debit_account_id == row.credit_account_id {
            return Err(StoreError::Validation(
                "ledger entry debit and credit accounts must differ".into(),
            ));
        }
        Self::posting_account(state, &row.tenant_id, &row.debit_account_id)?;
        Self::posting_account(state, &row.tenant_id, &row.credit_account_id)?;
        Ok(())
    }

    /// Idempotency lookup shared by every externally keyed insert: `Ok(Some)`
    /// is a benign replay, a fingerprint mismatch is a conflict.
    fn check_idempotency<'a, T>(
        keys: &HashMap<(TenantId, IdempotencyKey), String>,
        records: &'a HashMap<(TenantId, String), T>,
        tenant: &TenantId,
        key: &IdempotencyKey,
        fingerprint: &str,
        extract: impl Fn(&T) -> &str,
    ) -> StoreResult<Option<&'a T>> {
        let Some(existing_id) = keys.get(&(tenant.clone(), key.clone())) else {
            return Ok(None);
        };
        let existing = records
            .get(&(tenant.clone(), existing_id.clone()))
            .ok_or_else(|| {
                StoreError::Invariant(format!("idempotency index points at missing row {existing_id}"))
            })?;
        if extract(existing) != fingerprint {
            return Err(StoreError::Conflict(format!(
                "idempotency key {key} was already used with a different payload"
            )));
        }
        Ok(Some(existing))
    }
}

#[async_trait]
impl SubLedgerStore for MemoryStore {
    async fn insert_account(
        &self,
        row: LedgerAccountRow,
    ) -> StoreResult<Inserted<LedgerAccountRow>> {
        Self::ensure_currency(&row.currency)?;
        let mut state = self.state.lock().await;
        let index_key = (
            row.tenant_id.clone(),
            row.legal_entity_id.clone(),
            row.account_type,
            row.currency.clone(),
        );
        if let Some(existing_id) = state.account_index.get(&index_key) {
            let existing = state
                .accounts
                .get(&(row.tenant_id.clone(), existing_id.clone()))
                .cloned()
                .ok_or_else(|| {
                    StoreError::Invariant(format!("account index points at missing row {existing_id}"))
                })?;
            return Ok(Inserted::existing(existing));
        }
        state.account_index.insert(index_key, row.id.clone());
        state
            .accounts
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        Ok(Inserted::new(row))
    }

    async fn account(
        &self,
        tenant: &TenantId,
        id: &AccountId,
    ) -> StoreResult<Option<LedgerAccountRow>> {
        let state = self.state.lock().await;
        Ok(state.accounts.get(&(tenant.clone(), id.clone())).cloned())
    }

    async fn find_account(
        &self,
        tenant: &TenantId,
        legal_entity: &LegalEntityId,
        account_type: AccountType,
        currency: &str,
    ) -> StoreResult<Option<LedgerAccountRow>> {
        let state = self.state.lock().await;
        let id = state.account_index.get(&(
            tenant.clone(),
            legal_entity.clone(),
            account_type,
            currency.to_string(),
        ));
        Ok(id.and_then(|id| state.accounts.get(&(tenant.clone(), id.clone())).cloned()))
    }

    async fn close_account(
        &self,
        tenant: &TenantId,
        id: &AccountId,
    ) -> StoreResult<LedgerAccountRow> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&(tenant.clone(), id.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("ledger account {id}")))?;
        if account.status == AccountStatus::Active {
            account.status = AccountStatus::Closed;
            account.closed_at = Some(Utc::now());
        }
        Ok(account.clone())
    }

    async fn upsert_bank_account(&self, row: BankAccountRow) -> StoreResult<BankAccountRow> {
        let mut state = self.state.lock().await;
        state
            .bank_accounts
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        Ok(row)
    }

    async fn bank_account(
        &self,
        tenant: &TenantId,
        id: &BankAccountId,
    ) -> StoreResult<Option<BankAccountRow>> {
        let state = self.state.lock().await;
        Ok(state
            .bank_accounts
            .get(&(tenant.clone(), id.clone()))
            .cloned())
    }

    async fn insert_ledger_entry(
        &self,
        row: LedgerEntryRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<LedgerEntryRow>> {
        let mut state = self.state.lock().await;
        if let Some(existing) = Self::check_idempotency(
            &state.entry_keys,
            &state.entries,
            &row.tenant_id,
            &row.idempotency_key,
            &row.request_fingerprint,
            |entry: &LedgerEntryRow| entry.request_fingerprint.as_str(),
        )? {
            return Ok(Inserted::existing(existing.clone()));
        }
        Self::validate_entry(&state, &row)?;
        if row.reversed_by.is_some() {
            return Err(StoreError::Validation(
                "a new ledger entry cannot be born reversed".into(),
            ));
        }
        if state
            .entries
            .contains_key(&(row.tenant_id.clone(), row.id.clone()))
        {
            return Err(StoreError::Invariant(format!(
                "ledger entry id {} already exists",
                row.id
            )));
        }
        state.entry_keys.insert(
            (row.tenant_id.clone(), row.idempotency_key.clone()),
            row.id.clone(),
        );
        state
            .entries
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        state.append_events(events);
        Ok(Inserted::new(row))
    }

    async fn link_reversal(
        &self,
        tenant: &TenantId,
        original_id: &EntryId,
        reversal: LedgerEntryRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<LedgerEntryRow>> {
        let mut state = self.state.lock().await;
        if let Some(existing) = Self::check_idempotency(
            &state.entry_keys,
            &state.entries,
            tenant,
            &reversal.idempotency_key,
            &reversal.request_fingerprint,
            |entry: &LedgerEntryRow| entry.request_fingerprint.as_str(),
        )? {
            return Ok(Inserted::existing(existing.clone()));
        }

        let original = state
            .entries
            .get(&(tenant.clone(), original_id.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ledger entry {original_id}")))?;
        if original.reversed_by.is_some() {
            return Err(StoreError::Conflict(format!(
                "ledger entry {original_id} is already reversed"
            )));
        }
        if !reversal.is_reversal || reversal.entry_type != EntryType::Reversal {
            return Err(StoreError::Validation(
                "reversal entry must carry the reversal entry type".into(),
            ));
        }
        if reversal.debit_account_id != original.credit_account_id
            || reversal.credit_account_id != original.debit_account_id
            || reversal.amount_minor != original.amount_minor
        {
            return Err(StoreError::Validation(
                "reversal must swap the original legs and keep the amount".into(),
            ));
        }
        Self::validate_entry(&state, &reversal)?;

        state.entry_keys.insert(
            (tenant.clone(), reversal.idempotency_key.clone()),
            reversal.id.clone(),
        );
        state
            .entries
            .insert((tenant.clone(), reversal.id.clone()), reversal.clone());
        if let Some(original) = state.entries.get_mut(&(tenant.clone(), original_id.clone())) {
            original.reversed_by = Some(reversal.id.clone());
        }
        state.append_events(events);
        Ok(Inserted::new(reversal))
    }

    async fn ledger_entry(
        &self,
        tenant: &TenantId,
        id: &EntryId,
    ) -> StoreResult<Option<LedgerEntryRow>> {
        let state = self.state.lock().await;
        Ok(state.entries.get(&(tenant.clone(), id.clone())).cloned())
    }

    async fn ledger_entry_by_key(
        &self,
        tenant: &TenantId,
        key: &IdempotencyKey,
    ) -> StoreResult<Option<LedgerEntryRow>> {
        let state = self.state.lock().await;
        let id = state.entry_keys.get(&(tenant.clone(), key.clone()));
        Ok(id.and_then(|id| state.entries.get(&(tenant.clone(), id.clone())).cloned()))
    }

    async fn entries_touching_account(
        &self,
        tenant: &TenantId,
        account_id: &AccountId,
        as_of: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<LedgerEntryRow>> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntryRow> = state
            .entries
            .values()
            .filter(|entry| entry.tenant_id == *tenant)
            .filter(|entry| {
                entry.debit_account_id == *account_id || entry.credit_account_id == *account_id
            })
            .filter(|entry| as_of.is_none_or(|cutoff| entry.posted_at <= cutoff))
            .cloned()
            .collect();
        entries.sort_by(|a, b| (a.posted_at, &a.id).cmp(&(b.posted_at, &b.id)));
        Ok(entries)
    }

    async fn insert_reservation(
        &self,
        row: ReservationRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<ReservationRow>> {
        Self::ensure_positive(row.amount_minor, "reservation")?;
        let mut state = self.state.lock().await;
        Self::posting_account(&state, &row.tenant_id, &row.account_id)?;
        if row.status != ReservationStatus::Active {
            return Err(StoreError::Validation(
                "reservations are created in the active state".into(),
            ));
        }
        if state
            .reservations
            .contains_key(&(row.tenant_id.clone(), row.id.clone()))
        {
            return Err(StoreError::Invariant(format!(
                "reservation id {} already exists",
                row.id
            )));
        }
        state
            .reservations
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        state.append_events(events);
        Ok(Inserted::new(row))
    }

    async fn transition_reservation(
        &self,
        tenant: &TenantId,
        id: &ReservationId,
        to: ReservationStatus,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<ReservationRow> {
        let mut state = self.state.lock().await;
        let reservation = state
            .reservations
            .get_mut(&(tenant.clone(), id.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("reservation {id}")))?;
        if !reservation.status.can_transition_to(to) {
            return Err(StoreError::Transition {
                entity: "reservation",
                from: format!("{:?}", reservation.status),
                to: format!("{to:?}"),
            });
        }
        reservation.status = to;
        reservation.released_at = Some(Utc::now());
        let updated = reservation.clone();
        state.append_events(events);
        Ok(updated)
    }

    async fn reservation(
        &self,
        tenant: &TenantId,
        id: &ReservationId,
    ) -> StoreResult<Option<ReservationRow>> {
        let state = self.state.lock().await;
        Ok(state
            .reservations
            .get(&(tenant.clone(), id.clone()))
            .cloned())
    }

    async fn active_reservations(
        &self,
        tenant: &TenantId,
        account_id: &AccountId,
    ) -> StoreResult<Vec<ReservationRow>> {
        let state = self.state.lock().await;
        Ok(state
            .reservations
            .values()
            .filter(|reservation| {
                reservation.tenant_id == *tenant
                    && reservation.account_id == *account_id
                    && reservation.status == ReservationStatus::Active
            })
            .cloned()
            .collect())
    }

    async fn reservations_by_source(
        &self,
        tenant: &TenantId,
        source_ref: &str,
    ) -> StoreResult<Vec<ReservationRow>> {
        let state = self.state.lock().await;
        Ok(state
            .reservations
            .values()
            .filter(|reservation| {
                reservation.tenant_id == *tenant && reservation.source_ref == source_ref
            })
            .cloned()
            .collect())
    }

    async fn insert_funding_request(
        &self,
        row: FundingRequestRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<FundingRequestRow>> {
        Self::ensure_positive(row.amount_minor, "funding request")?;
        Self::ensure_currency(&row.currency)?;
        let mut state = self.state.lock().await;
        if let Some(existing) = Self::check_idempotency(
            &state.funding_request_keys,
            &state.funding_requests,
            &row.tenant_id,
            &row.idempotency_key,
            &row.request_fingerprint,
            |request: &FundingRequestRow| request.request_fingerprint.as_str(),
        )? {
            return Ok(Inserted::existing(existing.clone()));
        }
        state.funding_request_keys.insert(
            (row.tenant_id.clone(), row.idempotency_key.clone()),
            row.id.clone(),
        );
        state
            .funding_requests
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        state.append_events(events);
        Ok(Inserted::new(row))
    }

    async fn transition_funding_request(
        &self,
        tenant: &TenantId,
        id: &FundingRequestId,
        to: FundingRequestStatus,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<FundingRequestRow> {
        let mut state = self.state.lock().await;
        let request = state
            .funding_requests
            .get_mut(&(tenant.clone(), id.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("funding request {id}")))?;
        if !request.status.can_transition_to(to) {
            return Err(StoreError::Transition {
                entity: "funding_request",
                from: format!("{:?}", request.status),
                to: format!("{to:?}"),
            });
        }
        request.status = to;
        let updated = request.clone();
        state.append_events(events);
        Ok(updated)
    }

    async fn funding_request(
        &self,
        tenant: &TenantId,
        id: &FundingRequestId,
    ) -> StoreResult<Option<FundingRequestRow>> {
        let state = self.state.lock().await;
        Ok(state
            .funding_requests
            .get(&(tenant.clone(), id.clone()))
            .cloned())
    }

    async fn funding_requests(&self, tenant: &TenantId) -> StoreResult<Vec<FundingRequestRow>> {
        let state = self.state.lock().await;
        let mut requests: Vec<FundingRequestRow> = state
            .funding_requests
            .values()
            .filter(|request| request.tenant_id == *tenant)
            .cloned()
            .collect();
        requests.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(requests)
    }

    async fn insert_gate_evaluation(
        &self,
        row: FundingGateEvaluationRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<FundingGateEvaluationRow>> {
        let mut state = self.state.lock().await;
        let key = (row.tenant_id.clone(), row.idempotency_key.clone());
        if let Some(existing) = state.gate_evaluations.get(&key) {
            if existing.request_fingerprint != row.request_fingerprint {
                return Err(StoreError::Conflict(format!(
                    "idempotency key {} was already used with a different payload",
                    row.idempotency_key
                )));
            }
            return Ok(Inserted::existing(existing.clone()));
        }
        state.gate_evaluations.insert(key, row.clone());
        state.append_events(events);
        Ok(Inserted::new(row))
    }

    async fn gate_evaluation_by_key(
        &self,
        tenant: &TenantId,
        key: &IdempotencyKey,
    ) -> StoreResult<Option<FundingGateEvaluationRow>> {
        let state = self.state.lock().await;
        Ok(state
            .gate_evaluations
            .get(&(tenant.clone(), key.clone()))
            .cloned())
    }

    async fn insert_instruction(
        &self,
        row: PaymentInstructionRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<PaymentInstructionRow>> {
        Self::ensure_positive(row.amount_minor, "payment instruction")?;
        Self::ensure_currency(&row.currency)?;
        if row.status != InstructionStatus::Created {
            return Err(StoreError::Validation(
                "payment instructions are created in the created state".into(),
            ));
        }
        let mut state = self.state.lock().await;
        if let Some(existing) = Self::check_idempotency(
            &state.instruction_keys,
            &state.instructions,
            &row.tenant_id,
            &row.idempotency_key,
            &row.request_fingerprint,
            |instruction: &PaymentInstructionRow| instruction.request_fingerprint.as_str(),
        )? {
            return Ok(Inserted::existing(existing.clone()));
        }
        state.instruction_keys.insert(
            (row.tenant_id.clone(), row.idempotency_key.clone()),
            row.id.clone(),
        );
        state
            .instructions
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        state.append_events(events);
        Ok(Inserted::new(row))
    }

    async fn transition_instruction(
        &self,
        tenant: &TenantId,
        id: &InstructionId,
        to: InstructionStatus,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<PaymentInstructionRow> {
        let mut state = self.state.lock().await;
        let instruction = state
            .instructions
            .get_mut(&(tenant.clone(), id.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("payment instruction {id}")))?;
        if !instruction.status.can_transition_to(to) {
            return Err(StoreError::Transition {
                entity: "payment_instruction",
                from: format!("{:?}", instruction.status),
                to: format!("{to:?}"),
            });
        }
        instruction.status = to;
        instruction.updated_at = Utc::now();
        let updated = instruction.clone();
        state.append_events(events);
        Ok(updated)
    }

    async fn instruction(
        &self,
        tenant: &TenantId,
        id: &InstructionId,
    ) -> StoreResult<Option<PaymentInstructionRow>> {
        let state = self.state.lock().await;
        Ok(state
            .instructions
            .get(&(tenant.clone(), id.clone()))
            .cloned())
    }

    async fn instruction_by_key(
        &self,
        tenant: &TenantId,
        key: &IdempotencyKey,
    ) -> StoreResult<Option<PaymentInstructionRow>> {
        let state = self.state.lock().await;
        let id = state.instruction_keys.get(&(tenant.clone(), key.clone()));
        Ok(id.and_then(|id| {
            state
                .instructions
                .get(&(tenant.clone(), id.clone()))
                .cloned()
        }))
    }

    async fn instructions_for_source(
        &self,
        tenant: &TenantId,
        source_id: &str,
    ) -> StoreResult<Vec<PaymentInstructionRow>> {
        let state = self.state.lock().await;
        let mut instructions: Vec<PaymentInstructionRow> = state
            .instructions
            .values()
            .filter(|instruction| {
                instruction.tenant_id == *tenant && instruction.source_id == source_id
            })
            .cloned()
            .collect();
        instructions.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(instructions)
    }

    async fn insert_attempt(
        &self,
        row: PaymentAttemptRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<PaymentAttemptRow>> {
        let mut state = self.state.lock().await;
        let provider_key = (row.provider.clone(), row.provider_request_id.clone());
        if let Some((tenant, attempt_id)) = state.attempt_provider_index.get(&provider_key) {
            let existing = state
                .attempts
                .get(&(tenant.clone(), attempt_id.clone()))
                .cloned()
                .ok_or_else(|| {
                    StoreError::Invariant(format!(
                        "attempt index points at missing row {attempt_id}"
                    ))
                })?;
            return Ok(Inserted::existing(existing));
        }
        if !state
            .instructions
            .contains_key(&(row.tenant_id.clone(), row.instruction_id.clone()))
        {
            return Err(StoreError::NotFound(format!(
                "payment instruction {}",
                row.instruction_id
            )));
        }
        state
            .attempt_provider_index
            .insert(provider_key, (row.tenant_id.clone(), row.id.clone()));
        state
            .attempts
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        state.append_events(events);
        Ok(Inserted::new(row))
    }

    async fn transition_attempt(
        &self,
        tenant: &TenantId,
        id: &AttemptId,
        to: AttemptStatus,
    ) -> StoreResult<PaymentAttemptRow> {
        let mut state = self.state.lock().await;
        let attempt = state
            .attempts
            .get_mut(&(tenant.clone(), id.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("payment attempt {id}")))?;
        if attempt.status == to {
            return Ok(attempt.clone());
        }
        if !attempt.status.can_transition_to(to) {
            return Err(StoreError::Transition {
                entity: "payment_attempt",
                from: format!("{:?}", attempt.status),
                to: format!("{to:?}"),
            });
        }
        attempt.status = to;
        attempt.updated_at = Utc::now();
        Ok(attempt.clone())
    }

    async fn attempt_by_provider_ref(
        &self,
        provider: &str,
        provider_request_id: &str,
    ) -> StoreResult<Option<PaymentAttemptRow>> {
        let state = self.state.lock().await;
        let located = state
            .attempt_provider_index
            .get(&(provider.to_string(), provider_request_id.to_string()));
        Ok(located.and_then(|(tenant, id)| {
            state.attempts.get(&(tenant.clone(), id.clone())).cloned()
        }))
    }

    async fn attempts_for_instruction(
        &self,
        tenant: &TenantId,
        instruction_id: &InstructionId,
    ) -> StoreResult<Vec<PaymentAttemptRow>> {
        let state = self.state.lock().await;
        let mut attempts: Vec<PaymentAttemptRow> = state
            .attempts
            .values()
            .filter(|attempt| {
                attempt.tenant_id == *tenant && attempt.instruction_id == *instruction_id
            })
            .cloned()
            .collect();
        attempts.sort_by(|a, b| (a.submitted_at, &a.id).cmp(&(b.submitted_at, &b.id)));
        Ok(attempts)
    }

    async fn open_attempts(&self, tenant: &TenantId) -> StoreResult<Vec<PaymentAttemptRow>> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .values()
            .filter(|attempt| {
                attempt.tenant_id == *tenant
                    && matches!(
                        attempt.status,
                        AttemptStatus::Submitted | AttemptStatus::Accepted
                    )
            })
            .cloned()
            .collect())
    }

    async fn insert_settlement_event(
        &self,
        row: SettlementEventRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<SettlementEventRow>> {
        Self::ensure_positive(row.amount_minor, "settlement event")?;
        Self::ensure_currency(&row.currency)?;
        let mut state = self.state.lock().await;
        let trace_key = (
            row.tenant_id.clone(),
            row.bank_account_id.clone(),
            row.rail,
            row.external_trace_id.clone(),
        );
        if let Some(existing_id) = state.settlement_trace_index.get(&trace_key) {
            let existing = state
                .settlement_events
                .get(&(row.tenant_id.clone(), existing_id.clone()))
                .cloned()
                .ok_or_else(|| {
                    StoreError::Invariant(format!(
                        "settlement trace index points at missing row {existing_id}"
                    ))
                })?;
            return Ok(Inserted::existing(existing));
        }
        state.settlement_trace_index.insert(trace_key, row.id.clone());
        state
            .settlement_events
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        state.append_events(events);
        Ok(Inserted::new(row))
    }

    async fn advance_settlement_event(
        &self,
        tenant: &TenantId,
        id: &SettlementEventId,
        advance: SettlementAdvance,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<SettlementEventRow> {
        let mut state = self.state.lock().await;
        let event = state
            .settlement_events
            .get_mut(&(tenant.clone(), id.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("settlement event {id}")))?;
        if !event.status.can_transition_to(advance.to) {
            return Err(StoreError::Transition {
                entity: "settlement_event",
                from: format!("{:?}", event.status),
                to: format!("{:?}", advance.to),
            });
        }
        event.status = advance.to;
        if advance.return_code.is_some() {
            event.return_code = advance.return_code;
        }
        if advance.return_reason.is_some() {
            event.return_reason = advance.return_reason;
        }
        event.updated_at = Utc::now();
        let updated = event.clone();
        state.append_events(events);
        Ok(updated)
    }

    async fn attach_settlement_match(
        &self,
        tenant: &TenantId,
        id: &SettlementEventId,
        matched: SettlementMatch,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<SettlementEventRow> {
        let mut state = self.state.lock().await;
        let event = state
            .settlement_events
            .get_mut(&(tenant.clone(), id.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("settlement event {id}")))?;
        if let Some(instruction_id) = matched.instruction_id {
            match &event.instruction_id {
                Some(existing) if *existing != instruction_id => {
                    return Err(StoreError::Conflict(format!(
                        "settlement event {id} is already matched to instruction {existing}"
                    )));
                }
                _ => event.instruction_id = Some(instruction_id),
            }
        }
        if let Some(funding_request_id) = matched.funding_request_id {
            match &event.funding_request_id {
                Some(existing) if *existing != funding_request_id => {
                    return Err(StoreError::Conflict(format!(
                        "settlement event {id} is already matched to funding request {existing}"
                    )));
                }
                _ => event.funding_request_id = Some(funding_request_id),
            }
        }
        let updated = event.clone();
        state.append_events(events);
        Ok(updated)
    }

    async fn settlement_event(
        &self,
        tenant: &TenantId,
        id: &SettlementEventId,
    ) -> StoreResult<Option<SettlementEventRow>> {
        let state = self.state.lock().await;
        Ok(state
            .settlement_events
            .get(&(tenant.clone(), id.clone()))
            .cloned())
    }

    async fn settlement_event_by_trace(
        &self,
        tenant: &TenantId,
        bank_account_id: &BankAccountId,
        rail: Rail,
        external_trace_id: &str,
    ) -> StoreResult<Option<SettlementEventRow>> {
        let state = self.state.lock().await;
        let id = state.settlement_trace_index.get(&(
            tenant.clone(),
            bank_account_id.clone(),
            rail,
            external_trace_id.to_string(),
        ));
        Ok(id.and_then(|id| {
            state
                .settlement_events
                .get(&(tenant.clone(), id.clone()))
                .cloned()
        }))
    }

    async fn settlement_events(&self, tenant: &TenantId) -> StoreResult<Vec<SettlementEventRow>> {
        let state = self.state.lock().await;
        let mut events: Vec<SettlementEventRow> = state
            .settlement_events
            .values()
            .filter(|event| event.tenant_id == *tenant)
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.recorded_at, &a.id).cmp(&(b.recorded_at, &b.id)));
        Ok(events)
    }

    async fn insert_settlement_link(
        &self,
        row: SettlementLinkRow,
    ) -> StoreResult<Inserted<SettlementLinkRow>> {
        let mut state = self.state.lock().await;
        let dedupe_key = (
            row.tenant_id.clone(),
            row.settlement_event_id.clone(),
            row.ledger_entry_id.clone(),
        );
        if state.settlement_link_index.contains(&dedupe_key) {
            let existing = state
                .settlement_links
                .values()
                .find(|link| {
                    link.tenant_id == row.tenant_id
                        && link.settlement_event_id == row.settlement_event_id
                        && link.ledger_entry_id == row.ledger_entry_id
                })
                .cloned()
                .ok_or_else(|| {
                    StoreError::Invariant("settlement link index points at missing row".into())
                })?;
            return Ok(Inserted::existing(existing));
        }
        if !state
            .settlement_events
            .contains_key(&(row.tenant_id.clone(), row.settlement_event_id.clone()))
        {
            return Err(StoreError::NotFound(format!(
                "settlement event {}",
                row.settlement_event_id
            )));
        }
        if !state
            .entries
            .contains_key(&(row.tenant_id.clone(), row.ledger_entry_id.clone()))
        {
            return Err(StoreError::NotFound(format!(
                "ledger entry {}",
                row.ledger_entry_id
            )));
        }
        state.settlement_link_index.insert(dedupe_key);
        state
            .settlement_links
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        Ok(Inserted::new(row))
    }

    async fn links_for_settlement(
        &self,
        tenant: &TenantId,
        settlement_event_id: &SettlementEventId,
    ) -> StoreResult<Vec<SettlementLinkRow>> {
        let state = self.state.lock().await;
        Ok(state
            .settlement_links
            .values()
            .filter(|link| {
                link.tenant_id == *tenant && link.settlement_event_id == *settlement_event_id
            })
            .cloned()
            .collect())
    }

    async fn insert_liability_event(
        &self,
        row: LiabilityEventRow,
        events: Vec<DomainEventRow>,
    ) -> StoreResult<Inserted<LiabilityEventRow>> {
        if row.loss_minor < 0 {
            return Err(StoreError::Validation(
                "liability loss amount cannot be negative".into(),
            ));
        }
        let mut state = self.state.lock().await;
        if let Some(existing) = Self::check_idempotency(
            &state.liability_keys,
            &state.liability_events,
            &row.tenant_id,
            &row.idempotency_key,
            &row.request_fingerprint,
            |event: &LiabilityEventRow| event.request_fingerprint.as_str(),
        )? {
            return Ok(Inserted::existing(existing.clone()));
        }
        state.liability_keys.insert(
            (row.tenant_id.clone(), row.idempotency_key.clone()),
            row.id.clone(),
        );
        state
            .liability_events
            .insert((row.tenant_id.clone(), row.id.clone()), row.clone());
        state.append_events(events);
        Ok(Inserted::new(row))
    }

    async fn liability_events(&self, tenant: &TenantId) -> StoreResult<Vec<LiabilityEventRow>> {
        let state = self.state.lock().await;
        let mut events: Vec<LiabilityEventRow> = state
            .liability_events
            .values()
            .filter(|event| event.tenant_id == *tenant)
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.recorded_at, &a.id).cmp(&(b.recorded_at, &b.id)));
        Ok(events)
    }

    async fn seed_return_codes(&self, rows: Vec<ReturnCodeReferenceRow>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for row in rows {
            state
                .return_codes
                .insert((row.rail, row.code.clone()), row);
        }
        Ok(())
    }

    async fn return_code(
        &self,
        rail: Rail,
        code: &str,
    ) -> StoreResult<Option<ReturnCodeReferenceRow>> {
        let state = self.state.lock().await;
        Ok(state.return_codes.get(&(rail, code.to_string())).cloned())
    }

    async fn append_domain_event(
        &self,
        row: DomainEventRow,
    ) -> StoreResult<Inserted<DomainEventRow>> {
        if row.tenant_id.trim().is_empty() {
            return Err(StoreError::Validation(
                "domain events must carry a tenant".into(),
            ));
        }
        let mut state = self.state.lock().await;
        if state.domain_event_ids.contains(&row.event_id) {
            let existing = state
                .domain_events
                .iter()
                .find(|event| event.event_id == row.event_id)
                .cloned();
            return match existing {
                Some(event) => Ok(Inserted::existing(event)),
                // The id is tombstoned: the event was erased under a GDPR
                // grant and must not be recreated.
                None => Err(StoreError::Conflict(format!(
                    "domain event {} was erased and cannot be re-appended",
                    row.event_id
                ))),
            };
        }
        state.domain_event_ids.insert(row.event_id.clone());
        state.domain_events.push(row.clone());
        Ok(Inserted::new(row))
    }

    async fn domain_events(
        &self,
        tenant: Option<&TenantId>,
        filter: &EventFilter,
    ) -> StoreResult<Vec<DomainEventRow>> {
        let state = self.state.lock().await;
        let mut events: Vec<DomainEventRow> = state
            .domain_events
            .iter()
            .filter(|event| tenant.is_none_or(|tenant| &event.tenant_id == tenant))
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            (&a.tenant_id, a.occurred_at, &a.event_id).cmp(&(&b.tenant_id, b.occurred_at, &b.event_id))
        });
        Ok(events)
    }

    async fn upsert_subscription(
        &self,
        row: EventSubscriptionRow,
    ) -> StoreResult<EventSubscriptionRow> {
        if row.name.trim().is_empty() {
            return Err(StoreError::Validation(
                "subscription name must be provided".into(),
            ));
        }
        let mut state = self.state.lock().await;
        state.subscriptions.insert(row.name.clone(), row.clone());
        Ok(row)
    }

    async fn subscription(&self, name: &str) -> StoreResult<Option<EventSubscriptionRow>> {
        let state = self.state.lock().await;
        Ok(state.subscriptions.get(name).cloned())
    }

    async fn events_for_subscriber(
        &self,
        name: &str,
        limit: usize,
    ) -> StoreResult<Vec<DomainEventRow>> {
        let state = self.state.lock().await;
        let subscription = state
            .subscriptions
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {name}")))?;
        if !subscription.active {
            return Ok(Vec::new());
        }
        let cursor = subscription
            .cursor_timestamp
            .zip(subscription.cursor_event_id.clone());
        let mut events: Vec<DomainEventRow> = state
            .domain_events
            .iter()
            .filter(|event| {
                subscription
                    .tenant_filter
                    .as_ref()
                    .is_none_or(|tenant| &event.tenant_id == tenant)
            })
            .filter(|event| {
                subscription
                    .type_filter
                    .as_ref()
                    .is_none_or(|types| types.contains(&event.event_type))
            })
            .filter(|event| {
                subscription
                    .category_filter
                    .as_ref()
                    .is_none_or(|categories| categories.contains(&event.category))
            })
            .filter(|event| {
                cursor.as_ref().is_none_or(|(timestamp, event_id)| {
                    (event.occurred_at, &event.event_id) > (*timestamp, event_id)
                })
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.occurred_at, &a.event_id).cmp(&(b.occurred_at, &b.event_id)));
        events.truncate(limit);
        Ok(events)
    }

    async fn update_subscription_cursor(
        &self,
        name: &str,
        event_id: &EventId,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let subscription = state
            .subscriptions
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {name}")))?;
        subscription.cursor_event_id = Some(event_id.clone());
        subscription.cursor_timestamp = Some(timestamp);
        Ok(())
    }

    async fn erase_domain_event(
        &self,
        _grant: &GdprErasureGrant,
        tenant: &TenantId,
        event_id: &EventId,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.domain_events.len();
        state
            .domain_events
            .retain(|event| !(event.tenant_id == *tenant && event.event_id == *event_id));
        // The id stays tombstoned in domain_event_ids so the erased event
        // cannot quietly reappear through a replay.
        Ok(state.domain_events.len() != before)
    }

    async fn advisory_lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let cell = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        cell.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::rows::Direction;
    use crate::rows::EventCategory;
    use crate::rows::EventType;
    use crate::rows::PayeeType;
    use crate::rows::PaymentPurpose;
    use crate::rows::SourceType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TENANT: &str = "tenant-1";
    const ENTITY: &str = "le-1";

    fn account_row(id: &str, account_type: AccountType) -> LedgerAccountRow {
        LedgerAccountRow {
            id: id.into(),
            tenant_id: TENANT.into(),
            legal_entity_id: ENTITY.into(),
            account_type,
            currency: "USD".into(),
            status: AccountStatus::Active,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    fn entry_row(id: &str, key: &str, amount_minor: i64) -> LedgerEntryRow {
        LedgerEntryRow {
            id: id.into(),
            tenant_id: TENANT.into(),
            legal_entity_id: ENTITY.into(),
            debit_account_id: "acct-funding".into(),
            credit_account_id: "acct-clearing".into(),
            amount_minor,
            currency: "USD".into(),
            entry_type: EntryType::PaymentSettlement,
            source_type: SourceType::SettlementEvent,
            source_id: "se-1".into(),
            correlation_id: "corr-1".into(),
            idempotency_key: key.into(),
            request_fingerprint: fingerprint([key.to_string(), amount_minor.to_string()]),
            metadata: json!({}),
            posted_at: Utc::now(),
            reversed_by: None,
            is_reversal: false,
        }
    }

    fn domain_event(id: &str) -> DomainEventRow {
        DomainEventRow {
            event_id: id.into(),
            event_type: EventType::LedgerEntryPosted,
            category: EventCategory::Ledger,
            tenant_id: TENANT.into(),
            correlation_id: "corr-1".into(),
            causation_id: None,
            occurred_at: Utc::now(),
            payload: json!({}),
            version: 1,
        }
    }

    async fn store_with_accounts() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_account(account_row("acct-funding", AccountType::ClientFundingClearing))
            .await
            .expect("account");
        store
            .insert_account(account_row("acct-clearing", AccountType::PspSettlementClearing))
            .await
            .expect("account");
        store
    }

    #[tokio::test]
    async fn account_uniqueness_is_find_or_create() {
        let store = MemoryStore::new();
        let first = store
            .insert_account(account_row("acct-1", AccountType::ClientFundingClearing))
            .await
            .expect("insert");
        assert!(first.is_new);

        let second = store
            .insert_account(account_row("acct-other", AccountType::ClientFundingClearing))
            .await
            .expect("insert");
        assert!(!second.is_new);
        assert_eq!(second.record.id, "acct-1");
    }

    #[tokio::test]
    async fn ledger_entry_rejects_non_positive_and_self_transfer() {
        let store = store_with_accounts().await;

        let err = store
            .insert_ledger_entry(entry_row("e-1", "k-1", 0), Vec::new())
            .await
            .expect_err("zero amount must fail");
        assert!(matches!(err, StoreError::Validation(_)));

        let mut self_transfer = entry_row("e-2", "k-2", 500);
        self_transfer.credit_account_id = self_transfer.debit_account_id.clone();
        let err = store
            .insert_ledger_entry(self_transfer, Vec::new())
            .await
            .expect_err("self transfer must fail");
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn idempotent_replay_returns_existing_and_skips_events() {
        let store = store_with_accounts().await;

        let first = store
            .insert_ledger_entry(entry_row("e-1", "k-1", 500), vec![domain_event("ev-1")])
            .await
            .expect("insert");
        assert!(first.is_new);

        let replay = store
            .insert_ledger_entry(entry_row("e-ignored", "k-1", 500), vec![domain_event("ev-2")])
            .await
            .expect("replay");
        assert!(!replay.is_new);
        assert_eq!(replay.record.id, "e-1");

        let events = store
            .domain_events(Some(&TENANT.to_string()), &EventFilter::default())
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "ev-1");
    }

    #[tokio::test]
    async fn idempotency_key_reuse_with_different_payload_conflicts() {
        let store = store_with_accounts().await;
        store
            .insert_ledger_entry(entry_row("e-1", "k-1", 500), Vec::new())
            .await
            .expect("insert");

        let err = store
            .insert_ledger_entry(entry_row("e-2", "k-1", 900), Vec::new())
            .await
            .expect_err("different payload must conflict");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn reversal_is_unique_and_validated() {
        let store = store_with_accounts().await;
        let original = store
            .insert_ledger_entry(entry_row("e-1", "k-1", 500), Vec::new())
            .await
            .expect("insert")
            .record;

        let mut reversal = entry_row("e-rev", "k-rev", 500);
        reversal.debit_account_id = original.credit_account_id.clone();
        reversal.credit_account_id = original.debit_account_id.clone();
        reversal.entry_type = EntryType::Reversal;
        reversal.is_reversal = true;
        reversal.request_fingerprint = fingerprint(["k-rev", "500"]);

        let linked = store
            .link_reversal(&TENANT.to_string(), &original.id, reversal.clone(), Vec::new())
            .await
            .expect("link reversal");
        assert!(linked.is_new);

        let stored = store
            .ledger_entry(&TENANT.to_string(), &original.id)
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.reversed_by.as_deref(), Some("e-rev"));

        let mut second = reversal.clone();
        second.id = "e-rev-2".into();
        second.idempotency_key = "k-rev-2".into();
        second.request_fingerprint = fingerprint(["k-rev-2", "500"]);
        let err = store
            .link_reversal(&TENANT.to_string(), &original.id, second, Vec::new())
            .await
            .expect_err("second reversal must fail");
        assert!(matches!(err, StoreError::Conflict(_)));

        // Retrying the first reversal by key is a benign replay.
        let replay = store
            .link_reversal(&TENANT.to_string(), &original.id, reversal, Vec::new())
            .await
            .expect("replay");
        assert!(!replay.is_new);
    }

    #[tokio::test]
    async fn instruction_transitions_follow_the_table() {
        let store = store_with_accounts().await;
        let now = Utc::now();
        let instruction = PaymentInstructionRow {
            id: "pi-1".into(),
            tenant_id: TENANT.into(),
            legal_entity_id: ENTITY.into(),
            purpose: PaymentPurpose::NetPay,
            direction: Direction::Outbound,
            amount_minor: 350_000,
            currency: "USD".into(),
            payee_type: PayeeType::Employee,
            payee_ref: "emp-alice".into(),
            preferred_rail: None,
            requested_settlement_date: now.date_naive(),
            status: InstructionStatus::Created,
            source_type: SourceType::PayrollBatch,
            source_id: "batch-1".into(),
            idempotency_key: "pi-key-1".into(),
            request_fingerprint: fingerprint(["pi-key-1"]),
            metadata: json!({}),
            created_at: now,
            updated_at: now,
        };
        store
            .insert_instruction(instruction, Vec::new())
            .await
            .expect("insert");

        let tenant = TENANT.to_string();
        let err = store
            .transition_instruction(&tenant, &"pi-1".to_string(), InstructionStatus::Settled, Vec::new())
            .await
            .expect_err("created -> settled is not a forward edge");
        assert!(matches!(err, StoreError::Transition { .. }));

        store
            .transition_instruction(&tenant, &"pi-1".to_string(), InstructionStatus::Queued, Vec::new())
            .await
            .expect("created -> queued");
        store
            .transition_instruction(&tenant, &"pi-1".to_string(), InstructionStatus::Submitted, Vec::new())
            .await
            .expect("queued -> submitted");
    }

    #[tokio::test]
    async fn subscriber_cursor_only_advances_past_acknowledged_events() {
        let store = MemoryStore::new();
        store
            .upsert_subscription(EventSubscriptionRow {
                name: "projector".into(),
                cursor_event_id: None,
                cursor_timestamp: None,
                type_filter: None,
                category_filter: None,
                tenant_filter: Some(TENANT.into()),
                active: true,
            })
            .await
            .expect("subscription");

        for id in ["ev-1", "ev-2", "ev-3"] {
            store
                .append_domain_event(domain_event(id))
                .await
                .expect("append");
        }

        let batch = store
            .events_for_subscriber("projector", 2)
            .await
            .expect("batch");
        assert_eq!(batch.len(), 2);

        let last = batch.last().expect("non-empty");
        store
            .update_subscription_cursor("projector", &last.event_id, last.occurred_at)
            .await
            .expect("ack");

        let rest = store
            .events_for_subscriber("projector", 10)
            .await
            .expect("rest");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event_id, "ev-3");
    }

    #[tokio::test]
    async fn gdpr_erase_tombstones_the_event_id() {
        let store = MemoryStore::new();
        store
            .append_domain_event(domain_event("ev-1"))
            .await
            .expect("append");

        let grant = GdprErasureGrant::new("dpo", "subject erasure request 42");
        let tenant = TENANT.to_string();
        let erased = store
            .erase_domain_event(&grant, &tenant, &"ev-1".to_string())
            .await
            .expect("erase");
        assert!(erased);

        let err = store
            .append_domain_event(domain_event("ev-1"))
            .await
            .expect_err("tombstoned event id cannot come back");
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}

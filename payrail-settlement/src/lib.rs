#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Settlement reconciliation: ingest bank-confirmed truth, match it to
//! intents, post the money movement, and unwind it on returns. Replay of
//! any feed is idempotent end to end.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use payrail_events::EventScope;
use payrail_events::funding_settled;
use payrail_events::payment_accepted;
use payrail_events::payment_failed;
use payrail_events::payment_returned;
use payrail_events::payment_settled;
use payrail_events::settlement_unmatched;
use payrail_ledger::LedgerEngine;
use payrail_ledger::LedgerError;
use payrail_ledger::PostEntryRequest;
use payrail_ledger::ReservationManager;
use payrail_ledger::ReverseEntryRequest;
use payrail_liability::ClassifyRequest;
use payrail_liability::LiabilityAttributor;
use payrail_liability::LiabilityError;
use payrail_providers::SettlementRecord;
use payrail_store::AccountType;
use payrail_store::AttemptStatus;
use payrail_store::Direction;
use payrail_store::EntryType;
use payrail_store::FundingRequestRow;
use payrail_store::FundingRequestStatus;
use payrail_store::InstructionStatus;
use payrail_store::LiabilitySource;
use payrail_store::PaymentInstructionRow;
use payrail_store::ReservationStatus;
use payrail_store::SettlementAdvance;
use payrail_store::SettlementEventRow;
use payrail_store::SettlementLinkRow;
use payrail_store::SettlementMatch;
use payrail_store::SettlementStatus;
use payrail_store::SourceType;
use payrail_store::StoreError;
use payrail_store::SubLedgerStore;
use payrail_store::TenantId;

pub type SettlementResult<T> = Result<T, SettlementError>;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Liability(#[from] LiabilityError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fallback-matching knobs. Amount and direction must match exactly and
/// the date must land inside the tolerance window before the weights even
/// apply; the score then ranks survivors.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    pub amount_weight: f32,
    pub date_weight: f32,
    pub payee_weight: f32,
    pub date_tolerance_days: i64,
    pub score_threshold: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            amount_weight: 0.45,
            date_weight: 0.35,
            payee_weight: 0.20,
            date_tolerance_days: 1,
            score_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub received: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub unmatched: usize,
    pub returns: usize,
}

/// Shortest forward path through the instruction machine, or `None` when
/// the target is unreachable (stale or out-of-order truth).
fn instruction_path(from: InstructionStatus, to: InstructionStatus) -> Option<Vec<InstructionStatus>> {
    if from == to {
        return Some(Vec::new());
    }
    let mut frontier = vec![(from, Vec::new())];
    loop {
        let mut next = Vec::new();
        for (status, path) in frontier {
            for candidate in status.valid_transitions() {
                let mut path = path.clone();
                path.push(*candidate);
                if *candidate == to {
                    return Some(path);
                }
                next.push((*candidate, path));
            }
        }
        if next.is_empty() {
            return None;
        }
        frontier = next;
    }
}

fn funding_path(
    from: FundingRequestStatus,
    to: FundingRequestStatus,
) -> Option<Vec<FundingRequestStatus>> {
    if from == to {
        return Some(Vec::new());
    }
    let mut frontier = vec![(from, Vec::new())];
    loop {
        let mut next = Vec::new();
        for (status, path) in frontier {
            for candidate in status.valid_transitions() {
                let mut path = path.clone();
                path.push(*candidate);
                if *candidate == to {
                    return Some(path);
                }
                next.push((*candidate, path));
            }
        }
        if next.is_empty() {
            return None;
        }
        frontier = next;
    }
}

fn settlement_entry_key(event_id: &str) -> String {
    format!("settle:{event_id}")
}

fn reversal_entry_key(event_id: &str) -> String {
    format!("reverse:{event_id}")
}

#[derive(Clone)]
pub struct SettlementReconciler {
    store: Arc<dyn SubLedgerStore>,
    ledger: LedgerEngine,
    reservations: ReservationManager,
    attributor: LiabilityAttributor,
    config: MatchConfig,
}

impl SettlementReconciler {
    pub fn new(store: Arc<dyn SubLedgerStore>, config: MatchConfig) -> Self {
        let ledger = LedgerEngine::new(store.clone());
        let reservations = ReservationManager::new(store.clone());
        let attributor = LiabilityAttributor::new(store.clone());
        Self {
            store,
            ledger,
            reservations,
            attributor,
            config,
        }
    }

    /// Ingests a provider feed. Duplicates are counted and skipped; new
    /// truth is matched, posted and advanced. Replaying the whole feed
    /// yields identical settlement events, links and ledger entries.
    pub async fn ingest(
        &self,
        tenant_id: &TenantId,
        records: Vec<SettlementRecord>,
        correlation_id: &str,
    ) -> SettlementResult<IngestSummary> {
        let mut summary = IngestSummary {
            received: records.len(),
            ..IngestSummary::default()
        };
        let scope = EventScope::new(tenant_id.clone(), correlation_id.to_string());
        for record in records {
            self.process_record(tenant_id, record, &scope, &mut summary)
                .await?;
        }
        tracing::info!(
            received = summary.received,
            applied = summary.applied,
            duplicates = summary.duplicates,
            unmatched = summary.unmatched,
            returns = summary.returns,
            "settlement feed ingested"
        );
        Ok(summary)
    }

    async fn process_record(
        &self,
        tenant_id: &TenantId,
        record: SettlementRecord,
        scope: &EventScope,
        summary: &mut IngestSummary,
    ) -> SettlementResult<()> {
        let existing = self
            .store
            .settlement_event_by_trace(
                tenant_id,
                &record.bank_account_id,
                record.rail,
                &record.external_trace_id,
            )
            .await?;

        let event_row = match existing {
            None => {
                let row = self.to_row(tenant_id, &record);
                self.store
                    .insert_settlement_event(row, Vec::new())
                    .await?
                    .record
            }
            Some(existing) => {
                if existing.status == record.status
                    || !existing.status.can_transition_to(record.status)
                {
                    summary.duplicates += 1;
                    return Ok(());
                }
                self.store
                    .advance_settlement_event(
                        tenant_id,
                        &existing.id,
                        SettlementAdvance {
                            to: record.status,
                            return_code: record.return_code.clone(),
                            return_reason: record.return_reason.clone(),
                        },
                        Vec::new(),
                    )
                    .await?
            }
        };
        summary.applied += 1;

        let event_row = if event_row.is_matched() {
            event_row
        } else {
            match self.find_match(tenant_id, &event_row).await? {
                Some(matched) => {
                    self.store
                        .attach_settlement_match(tenant_id, &event_row.id, matched, Vec::new())
                        .await?
                }
                None => {
                    // Parked for manual review; never auto-credited.
                    summary.unmatched += 1;
                    self.store
                        .append_domain_event(settlement_unmatched(scope, &event_row))
                        .await?;
                    tracing::warn!(
                        settlement_event_id = %event_row.id,
                        external_trace_id = %event_row.external_trace_id,
                        "settlement record parked unmatched"
                    );
                    return Ok(());
                }
            }
        };

        self.apply_effects(tenant_id, &event_row, scope, summary)
            .await
    }

    fn to_row(&self, tenant_id: &TenantId, record: &SettlementRecord) -> SettlementEventRow {
        let now = Utc::now();
        SettlementEventRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            bank_account_id: record.bank_account_id.clone(),
            rail: record.rail,
            direction: record.direction,
            amount_minor: record.amount_minor,
            currency: record.currency.clone(),
            status: record.status,
            external_trace_id: record.external_trace_id.clone(),
            provider: record.provider.clone(),
            provider_request_id: record.provider_request_id.clone(),
            payee_ref: record.payee_ref.clone(),
            return_code: record.return_code.clone(),
            return_reason: record.return_reason.clone(),
            effective_date: record.effective_date,
            raw_payload: record.raw_payload.clone(),
            instruction_id: None,
            funding_request_id: None,
            recorded_at: now,
            updated_at: now,
        }
    }

    async fn find_match(
        &self,
        tenant_id: &TenantId,
        event_row: &SettlementEventRow,
    ) -> SettlementResult<Option<SettlementMatch>> {
        match event_row.direction {
            Direction::Outbound => self.match_attempt(tenant_id, event_row).await,
            Direction::Inbound => self.match_funding(tenant_id, event_row).await,
        }
    }

    /// Outbound records match their attempt by `(provider,
    /// provider_request_id)` first; the scored fallback never wins on an
    /// ambiguous or sub-threshold candidate set.
    async fn match_attempt(
        &self,
        tenant_id: &TenantId,
        event_row: &SettlementEventRow,
    ) -> SettlementResult<Option<SettlementMatch>> {
        if let Some(provider_request_id) = &event_row.provider_request_id
            && let Some(attempt) = self
                .store
                .attempt_by_provider_ref(&event_row.provider, provider_request_id)
                .await?
        {
            return Ok(Some(SettlementMatch {
                instruction_id: Some(attempt.instruction_id),
                ..SettlementMatch::default()
            }));
        }

        let mut candidates: Vec<(f32, String)> = Vec::new();
        for attempt in self.store.open_attempts(tenant_id).await? {
            let Some(instruction) = self
                .store
                .instruction(tenant_id, &attempt.instruction_id)
                .await?
            else {
                continue;
            };
            if instruction.direction != event_row.direction
                || instruction.amount_minor != event_row.amount_minor
                || instruction.currency != event_row.currency
            {
                continue;
            }
            let date_delta = (event_row.effective_date - instruction.requested_settlement_date)
                .num_days()
                .abs();
            if date_delta > self.config.date_tolerance_days {
                continue;
            }
            let payee_known = event_row.payee_ref.is_some();
            let payee_matches =
                event_row.payee_ref.as_deref() == Some(instruction.payee_ref.as_str());
            if payee_known && !payee_matches {
                continue;
            }
            let date_component =
                1.0 - (date_delta as f32) / ((self.config.date_tolerance_days + 1) as f32);
            let score = self.config.amount_weight
                + self.config.date_weight * date_component
                + if payee_matches {
                    self.config.payee_weight
                } else {
                    0.0
                };
            candidates.push((score, instruction.id));
        }

        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        match candidates.as_slice() {
            [] => Ok(None),
            [(score, _), ..] if *score < self.config.score_threshold => Ok(None),
            [(best, _), (second, _), ..] if second.total_cmp(best).is_eq() => {
                // Two equally good candidates: deterministic scoring cannot
                // choose, so the record parks for review.
                Ok(None)
            }
            [(_, instruction_id), ..] => Ok(Some(SettlementMatch {
                instruction_id: Some(instruction_id.clone()),
                ..SettlementMatch::default()
            })),
        }
    }

    async fn match_funding(
        &self,
        tenant_id: &TenantId,
        event_row: &SettlementEventRow,
    ) -> SettlementResult<Option<SettlementMatch>> {
        let requests = self.store.funding_requests(tenant_id).await?;
        if let Some(provider_request_id) = &event_row.provider_request_id
            && let Some(request) = requests
                .iter()
                .find(|request| request.provider_ref.as_deref() == Some(provider_request_id))
        {
            return Ok(Some(SettlementMatch {
                funding_request_id: Some(request.id.clone()),
                ..SettlementMatch::default()
            }));
        }

        let candidates: Vec<&FundingRequestRow> = requests
            .iter()
            .filter(|request| {
                let date_delta = (event_row.effective_date - request.requested_settlement_date)
                    .num_days()
                    .abs();
                request.amount_minor == event_row.amount_minor
                    && request.currency == event_row.currency
                    && date_delta <= self.config.date_tolerance_days
                    && funding_path(request.status, FundingRequestStatus::Settled).is_some()
            })
            .collect();
        match candidates.as_slice() {
            [only] => Ok(Some(SettlementMatch {
                funding_request_id: Some(only.id.clone()),
                ..SettlementMatch::default()
            })),
            _ => Ok(None),
        }
    }

    async fn apply_effects(
        &self,
        tenant_id: &TenantId,
        event_row: &SettlementEventRow,
        scope: &EventScope,
        summary: &mut IngestSummary,
    ) -> SettlementResult<()> {
        match event_row.status {
            SettlementStatus::Pending | SettlementStatus::Submitted => Ok(()),
            SettlementStatus::Accepted => self.apply_accepted(tenant_id, event_row, scope).await,
            SettlementStatus::Settled => self.apply_settled(tenant_id, event_row, scope).await,
            SettlementStatus::Returned => {
                summary.returns += 1;
                self.apply_unwind(tenant_id, event_row, InstructionStatus::Returned, scope)
                    .await
            }
            SettlementStatus::Reversed => {
                summary.returns += 1;
                self.apply_unwind(tenant_id, event_row, InstructionStatus::Reversed, scope)
                    .await
            }
            SettlementStatus::Rejected | SettlementStatus::Failed => {
                self.apply_failed(tenant_id, event_row, scope).await
            }
            SettlementStatus::Canceled => {
                if let Some(instruction_id) = &event_row.instruction_id {
                    self.advance_instruction(
                        tenant_id,
                        instruction_id,
                        InstructionStatus::Canceled,
                        event_row,
                        scope,
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    async fn apply_accepted(
        &self,
        tenant_id: &TenantId,
        event_row: &SettlementEventRow,
        scope: &EventScope,
    ) -> SettlementResult<()> {
        if let Some(instruction_id) = &event_row.instruction_id {
            self.mark_attempt(tenant_id, event_row, instruction_id, AttemptStatus::Accepted)
                .await?;
            self.advance_instruction(
                tenant_id,
                instruction_id,
                InstructionStatus::Accepted,
                event_row,
                scope,
            )
            .await?;
        }
        if let Some(funding_request_id) = &event_row.funding_request_id {
            self.advance_funding(tenant_id, funding_request_id, FundingRequestStatus::Accepted)
                .await?;
        }
        Ok(())
    }

    async fn apply_settled(
        &self,
        tenant_id: &TenantId,
        event_row: &SettlementEventRow,
        scope: &EventScope,
    ) -> SettlementResult<()> {
        if let Some(instruction_id) = &event_row.instruction_id {
            let instruction = self.require_instruction(tenant_id, instruction_id).await?;
            let funding = self
                .ledger
                .account(
                    tenant_id,
                    &instruction.legal_entity_id,
                    AccountType::ClientFundingClearing,
                    &instruction.currency,
                )
                .await?;
            let clearing = self
                .ledger
                .account(
                    tenant_id,
                    &instruction.legal_entity_id,
                    AccountType::PspSettlementClearing,
                    &instruction.currency,
                )
                .await?;
            let entry = self
                .ledger
                .post_entry(PostEntryRequest {
                    tenant_id: tenant_id.clone(),
                    legal_entity_id: instruction.legal_entity_id.clone(),
                    debit_account_id: funding.id,
                    credit_account_id: clearing.id,
                    amount_minor: event_row.amount_minor,
                    currency: event_row.currency.clone(),
                    entry_type: EntryType::PaymentSettlement,
                    source_type: SourceType::SettlementEvent,
                    source_id: event_row.id.clone(),
                    correlation_id: scope.correlation_id.clone(),
                    causation_id: scope.causation_id.clone(),
                    idempotency_key: settlement_entry_key(&event_row.id),
                    metadata: serde_json::json!({
                        "external_trace_id": event_row.external_trace_id,
                    }),
                })
                .await?;
            self.link(tenant_id, &event_row.id, &entry.record.id).await?;
            self.mark_attempt(tenant_id, event_row, instruction_id, AttemptStatus::Accepted)
                .await?;
            self.advance_instruction(
                tenant_id,
                instruction_id,
                InstructionStatus::Settled,
                event_row,
                scope,
            )
            .await?;
            self.consume_batch_reservations(tenant_id, &instruction.source_id, scope)
                .await?;
        }

        if let Some(funding_request_id) = &event_row.funding_request_id {
            let request = self
                .store
                .funding_request(tenant_id, funding_request_id)
                .await?
                .ok_or_else(|| {
                    SettlementError::NotFound(format!("funding request {funding_request_id}"))
                })?;
            let funding = self
                .ledger
                .account(
                    tenant_id,
                    &request.legal_entity_id,
                    AccountType::ClientFundingClearing,
                    &request.currency,
                )
                .await?;
            let clearing = self
                .ledger
                .account(
                    tenant_id,
                    &request.legal_entity_id,
                    AccountType::PspSettlementClearing,
                    &request.currency,
                )
                .await?;
            let entry = self
                .ledger
                .post_entry(PostEntryRequest {
                    tenant_id: tenant_id.clone(),
                    legal_entity_id: request.legal_entity_id.clone(),
                    debit_account_id: clearing.id,
                    credit_account_id: funding.id,
                    amount_minor: event_row.amount_minor,
                    currency: event_row.currency.clone(),
                    entry_type: EntryType::FundingSettlement,
                    source_type: SourceType::SettlementEvent,
                    source_id: event_row.id.clone(),
                    correlation_id: scope.correlation_id.clone(),
                    causation_id: scope.causation_id.clone(),
                    idempotency_key: settlement_entry_key(&event_row.id),
                    metadata: serde_json::json!({
                        "external_trace_id": event_row.external_trace_id,
                    }),
                })
                .await?;
            self.link(tenant_id, &event_row.id, &entry.record.id).await?;
            let settled = self
                .advance_funding(tenant_id, funding_request_id, FundingRequestStatus::Settled)
                .await?;
            if settled {
                self.store
                    .append_domain_event(funding_settled(scope, &request, &entry.record.id))
                    .await?;
            }
        }
        Ok(())
    }

    /// `settled -> returned | reversed` unwinds the settlement posting;
    /// pre-settlement returns only advance the state machines. Either way
    /// the liability attributor gets one classification per event.
    async fn apply_unwind(
        &self,
        tenant_id: &TenantId,
        event_row: &SettlementEventRow,
        target: InstructionStatus,
        scope: &EventScope,
    ) -> SettlementResult<()> {
        let settlement_entry = self
            .store
            .ledger_entry_by_key(tenant_id, &settlement_entry_key(&event_row.id))
            .await?;
        if let Some(entry) = settlement_entry {
            let reversal = self
                .ledger
                .reverse_entry(ReverseEntryRequest {
                    tenant_id: tenant_id.clone(),
                    original_entry_id: entry.id.clone(),
                    reason: event_row
                        .return_reason
                        .clone()
                        .or_else(|| event_row.return_code.clone())
                        .unwrap_or_else(|| "settlement unwound".into()),
                    correlation_id: scope.correlation_id.clone(),
                    causation_id: scope.causation_id.clone(),
                    idempotency_key: reversal_entry_key(&event_row.id),
                })
                .await?;
            self.link(tenant_id, &event_row.id, &reversal.record.id)
                .await?;
        }

        let mut counterparty = None;
        if let Some(instruction_id) = &event_row.instruction_id {
            let instruction = self.require_instruction(tenant_id, instruction_id).await?;
            counterparty = Some(instruction.legal_entity_id.clone());
            self.mark_attempt(tenant_id, event_row, instruction_id, AttemptStatus::Failed)
                .await?;
            self.advance_instruction(tenant_id, instruction_id, target, event_row, scope)
                .await?;
        }
        if let Some(funding_request_id) = &event_row.funding_request_id {
            let request = self
                .store
                .funding_request(tenant_id, funding_request_id)
                .await?;
            counterparty = request.map(|request| request.legal_entity_id);
            self.advance_funding(tenant_id, funding_request_id, FundingRequestStatus::Returned)
                .await?;
        }

        let idempotency_key = if target == InstructionStatus::Reversed {
            // A reopen after settlement appends a compensating
            // classification; the original liability facts stay untouched.
            format!("liability:{}:reversal", event_row.id)
        } else {
            format!("liability:{}", event_row.id)
        };
        self.attributor
            .classify(ClassifyRequest {
                tenant_id: tenant_id.clone(),
                source: LiabilitySource::Settlement,
                source_id: event_row.id.clone(),
                rail: event_row.rail,
                return_code: event_row.return_code.clone(),
                counterparty_ref: counterparty,
                loss_minor: event_row.amount_minor,
                evidence: serde_json::json!({
                    "external_trace_id": event_row.external_trace_id,
                    "return_reason": event_row.return_reason,
                }),
                idempotency_key,
                correlation_id: scope.correlation_id.clone(),
                causation_id: scope.causation_id.clone(),
            })
            .await?;
        Ok(())
    }

    async fn apply_failed(
        &self,
        tenant_id: &TenantId,
        event_row: &SettlementEventRow,
        scope: &EventScope,
    ) -> SettlementResult<()> {
        if let Some(instruction_id) = &event_row.instruction_id {
            self.mark_attempt(tenant_id, event_row, instruction_id, AttemptStatus::Failed)
                .await?;
            self.advance_instruction(
                tenant_id,
                instruction_id,
                InstructionStatus::Failed,
                event_row,
                scope,
            )
            .await?;
        }
        if let Some(funding_request_id) = &event_row.funding_request_id {
            self.advance_funding(tenant_id, funding_request_id, FundingRequestStatus::Failed)
                .await?;
        }
        Ok(())
    }

    async fn require_instruction(
        &self,
        tenant_id: &TenantId,
        instruction_id: &str,
    ) -> SettlementResult<PaymentInstructionRow> {
        self.store
            .instruction(tenant_id, &instruction_id.to_string())
            .await?
            .ok_or_else(|| {
                SettlementError::NotFound(format!("payment instruction {instruction_id}"))
            })
    }

    /// Walks the instruction forward one edge at a time, emitting the
    /// canonical event for each state actually entered. A no-op when the
    /// instruction is already there; stale targets are ignored.
    async fn advance_instruction(
        &self,
        tenant_id: &TenantId,
        instruction_id: &str,
        target: InstructionStatus,
        event_row: &SettlementEventRow,
        scope: &EventScope,
    ) -> SettlementResult<()> {
        let instruction_id = instruction_id.to_string();
        let instruction = self.require_instruction(tenant_id, &instruction_id).await?;
        let Some(path) = instruction_path(instruction.status, target) else {
            tracing::debug!(
                instruction_id = %instruction_id,
                from = ?instruction.status,
                to = ?target,
                "ignoring stale settlement truth"
            );
            return Ok(());
        };
        let mut current = instruction;
        for step in path {
            let events = match step {
                InstructionStatus::Accepted => vec![payment_accepted(scope, &current)],
                InstructionStatus::Settled => {
                    vec![payment_settled(scope, &current, &event_row.id)]
                }
                InstructionStatus::Returned => vec![payment_returned(
                    scope,
                    &current,
                    event_row.return_code.as_deref(),
                )],
                InstructionStatus::Failed => vec![payment_failed(
                    scope,
                    &current,
                    event_row
                        .return_reason
                        .as_deref()
                        .unwrap_or("settlement reported failure"),
                )],
                _ => Vec::new(),
            };
            current = self
                .store
                .transition_instruction(tenant_id, &instruction_id, step, events)
                .await?;
        }
        Ok(())
    }

    /// Returns whether the request newly reached `target`.
    async fn advance_funding(
        &self,
        tenant_id: &TenantId,
        funding_request_id: &str,
        target: FundingRequestStatus,
    ) -> SettlementResult<bool> {
        let funding_request_id = funding_request_id.to_string();
        let request = self
            .store
            .funding_request(tenant_id, &funding_request_id)
            .await?
            .ok_or_else(|| {
                SettlementError::NotFound(format!("funding request {funding_request_id}"))
            })?;
        let Some(path) = funding_path(request.status, target) else {
            return Ok(false);
        };
        if path.is_empty() {
            return Ok(false);
        }
        for step in path {
            self.store
                .transition_funding_request(tenant_id, &funding_request_id, step, Vec::new())
                .await?;
        }
        Ok(true)
    }

    async fn mark_attempt(
        &self,
        tenant_id: &TenantId,
        event_row: &SettlementEventRow,
        instruction_id: &str,
        to: AttemptStatus,
    ) -> SettlementResult<()> {
        let attempt = match &event_row.provider_request_id {
            Some(provider_request_id) => {
                self.store
                    .attempt_by_provider_ref(&event_row.provider, provider_request_id)
                    .await?
            }
            None => None,
        };
        let attempt = match attempt {
            Some(attempt) => Some(attempt),
            None => self
                .store
                .attempts_for_instruction(tenant_id, &instruction_id.to_string())
                .await?
                .pop(),
        };
        if let Some(attempt) = attempt
            && attempt.status != to
            && attempt.status.can_transition_to(to)
        {
            self.store
                .transition_attempt(tenant_id, &attempt.id, to)
                .await?;
        }
        Ok(())
    }

    async fn link(
        &self,
        tenant_id: &TenantId,
        settlement_event_id: &str,
        ledger_entry_id: &str,
    ) -> SettlementResult<()> {
        self.store
            .insert_settlement_link(SettlementLinkRow {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.clone(),
                settlement_event_id: settlement_event_id.to_string(),
                ledger_entry_id: ledger_entry_id.to_string(),
                linked_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Once every instruction of a batch has settled, its holds are
    /// consumed; each consumption emits one `ReservationConsumed`.
    async fn consume_batch_reservations(
        &self,
        tenant_id: &TenantId,
        source_id: &str,
        scope: &EventScope,
    ) -> SettlementResult<()> {
        let instructions = self
            .store
            .instructions_for_source(tenant_id, source_id)
            .await?;
        if instructions.is_empty()
            || !instructions
                .iter()
                .all(|instruction| instruction.status == InstructionStatus::Settled)
        {
            return Ok(());
        }
        for reservation in self.reservations.for_source(tenant_id, source_id).await? {
            if reservation.status == ReservationStatus::Active {
                self.reservations
                    .consume(tenant_id, &reservation.id, scope)
                    .await?;
            }
        }
        Ok(())
    }
}

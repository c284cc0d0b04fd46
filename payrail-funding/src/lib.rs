#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The two funding gates. The commit gate is policy-driven and decides
//! whether a payroll batch may be marked committed; the pay gate is
//! non-configurable, always strict, and is the only door to disbursement.

use std::sync::Arc;

use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use payrail_events::EventScope;
use payrail_events::funding_blocked;
use payrail_events::funding_requested;
use payrail_ledger::LedgerEngine;
use payrail_ledger::LedgerError;
use payrail_ledger::ReservationManager;
use payrail_store::AccountId;
use payrail_store::FundingGateEvaluationRow;
use payrail_store::FundingModel;
use payrail_store::FundingRequestRow;
use payrail_store::FundingRequestStatus;
use payrail_store::GateOutcome;
use payrail_store::GateReason;
use payrail_store::GateType;
use payrail_store::Inserted;
use payrail_store::LegalEntityId;
use payrail_store::Rail;
use payrail_store::StoreError;
use payrail_store::SubLedgerStore;
use payrail_store::TenantId;
use payrail_store::fingerprint;

pub type FundingResult<T> = Result<T, FundingError>;

#[derive(Debug, Error)]
pub enum FundingError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Commit-gate strictness. The pay gate ignores this entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    Strict,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPolicy {
    pub mode: GateMode,
}

impl Default for FundingPolicy {
    fn default() -> Self {
        Self {
            mode: GateMode::Strict,
        }
    }
}

impl FundingPolicy {
    /// Whether the given commit-gate outcome prevents the batch from being
    /// marked committed. Strict blocks on any non-pass; hybrid lets a soft
    /// fail commit and relies on the pay gate to block disbursement.
    pub fn blocks_commit(&self, outcome: GateOutcome) -> bool {
        match self.mode {
            GateMode::Strict => outcome != GateOutcome::Pass,
            GateMode::Hybrid => outcome == GateOutcome::HardFail,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTotals {
    pub net_minor: i64,
    pub tax_minor: i64,
    pub third_party_minor: i64,
    pub fee_minor: i64,
}

impl BatchTotals {
    pub fn grand_total(&self) -> i64 {
        self.net_minor + self.tax_minor + self.third_party_minor + self.fee_minor
    }

    /// The portion of the batch the client must fund up front under the
    /// given model.
    pub fn required_for(&self, model: FundingModel) -> i64 {
        match model {
            FundingModel::PrefundAll | FundingModel::SplitSchedule => self.grand_total(),
            FundingModel::NetOnly => self.net_minor,
            FundingModel::NetAndThirdParty => self.net_minor + self.third_party_minor,
        }
    }

    /// Whether the model leaves the tax bucket to arrive separately.
    pub fn tax_uncovered_by(&self, model: FundingModel) -> bool {
        self.tax_minor > 0
            && matches!(model, FundingModel::NetOnly | FundingModel::NetAndThirdParty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFundingStatus {
    Settled,
    InFlight,
    NotRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    NsfReturn,
    RiskyBankChange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitGateInput {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub batch_id: String,
    pub account_id: AccountId,
    pub funding_model: FundingModel,
    pub totals: BatchTotals,
    pub funding_status: ClientFundingStatus,
    pub risk_flags: Vec<RiskFlag>,
    pub correlation_id: String,
    pub causation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayGateInput {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub batch_id: String,
    pub account_id: AccountId,
    pub required_minor: i64,
    pub correlation_id: String,
    pub causation_id: Option<String>,
}

pub fn commit_gate_key(batch_id: &str) -> String {
    format!("commit_gate:{batch_id}")
}

pub fn pay_gate_key(batch_id: &str) -> String {
    format!("pay_gate:{batch_id}")
}

#[derive(Clone)]
pub struct FundingGate {
    store: Arc<dyn SubLedgerStore>,
    ledger: LedgerEngine,
    reservations: ReservationManager,
    policy: FundingPolicy,
}

impl FundingGate {
    pub fn new(store: Arc<dyn SubLedgerStore>, policy: FundingPolicy) -> Self {
        let ledger = LedgerEngine::new(store.clone());
        let reservations = ReservationManager::new(store.clone());
        Self {
            store,
            ledger,
            reservations,
            policy,
        }
    }

    pub fn policy(&self) -> &FundingPolicy {
        &self.policy
    }

    /// Deterministic commit-gate decision for a batch. Persists an
    /// immutable evaluation (idempotent on `commit_gate:{batch}`) and
    /// emits `FundingBlocked` with the write when the outcome is not a
    /// pass. Runs under the per-batch advisory lock so it never races a
    /// concurrent evaluation or reservation for the same batch.
    pub async fn evaluate_commit(
        &self,
        input: CommitGateInput,
    ) -> FundingResult<Inserted<FundingGateEvaluationRow>> {
        let lock_key = format!("batch:{}:{}", input.tenant_id, input.batch_id);
        let _guard = self.store.advisory_lock(&lock_key).await;

        let required = input.totals.required_for(input.funding_model);
        let available = self
            .available_for_batch(&input.tenant_id, &input.account_id, &input.batch_id)
            .await?;

        let mut hard = Vec::new();
        let mut soft = Vec::new();

        if input.risk_flags.contains(&RiskFlag::NsfReturn) {
            hard.push(GateReason::NsfReturn);
        }
        if input.risk_flags.contains(&RiskFlag::RiskyBankChange) {
            soft.push(GateReason::RiskyBankChange);
        }
        if available < required {
            // Under hybrid, a shortfall with funding still in flight is a
            // soft fail: commit may proceed, pay stays blocked.
            let in_flight = input.funding_status == ClientFundingStatus::InFlight;
            if self.policy.mode == GateMode::Hybrid && in_flight {
                soft.push(GateReason::InsufficientFunds);
                soft.push(GateReason::FundingNotSettled);
            } else {
                hard.push(GateReason::InsufficientFunds);
            }
        }
        if input.totals.tax_uncovered_by(input.funding_model) {
            soft.push(GateReason::TaxDueShortfall);
        }

        let outcome = if !hard.is_empty() {
            GateOutcome::HardFail
        } else if !soft.is_empty() {
            GateOutcome::SoftFail
        } else {
            GateOutcome::Pass
        };
        let mut reasons = hard;
        reasons.extend(soft);

        self.persist_evaluation(
            &input.tenant_id,
            &input.legal_entity_id,
            &input.batch_id,
            GateType::Commit,
            outcome,
            required,
            available,
            reasons,
            commit_gate_key(&input.batch_id),
            &input.correlation_id,
            input.causation_id.clone(),
        )
        .await
    }

    /// Always-strict recomputation at execution time. A pass persisted
    /// under `pay_gate:{batch}` is the precondition the orchestrator
    /// demands before any submission.
    pub async fn evaluate_pay(
        &self,
        input: PayGateInput,
    ) -> FundingResult<Inserted<FundingGateEvaluationRow>> {
        if input.required_minor <= 0 {
            return Err(FundingError::Validation(
                "pay gate requires a strictly positive required amount".into(),
            ));
        }
        let lock_key = format!("batch:{}:{}", input.tenant_id, input.batch_id);
        let _guard = self.store.advisory_lock(&lock_key).await;

        let available = self
            .available_for_batch(&input.tenant_id, &input.account_id, &input.batch_id)
            .await?;

        let (outcome, reasons) = if available < input.required_minor {
            (GateOutcome::HardFail, vec![GateReason::InsufficientFunds])
        } else {
            (GateOutcome::Pass, Vec::new())
        };

        self.persist_evaluation(
            &input.tenant_id,
            &input.legal_entity_id,
            &input.batch_id,
            GateType::Pay,
            outcome,
            input.required_minor,
            available,
            reasons,
            pay_gate_key(&input.batch_id),
            &input.correlation_id,
            input.causation_id.clone(),
        )
        .await
    }

    /// The persisted pay-gate pass for a batch, if any.
    pub async fn pay_gate_pass(
        &self,
        tenant_id: &TenantId,
        batch_id: &str,
    ) -> FundingResult<Option<FundingGateEvaluationRow>> {
        let evaluation = self
            .store
            .gate_evaluation_by_key(tenant_id, &pay_gate_key(batch_id))
            .await?;
        Ok(evaluation.filter(|evaluation| evaluation.outcome == GateOutcome::Pass))
    }

    /// Balance minus holds belonging to other batches; the batch under
    /// evaluation spends out of its own hold.
    async fn available_for_batch(
        &self,
        tenant_id: &TenantId,
        account_id: &AccountId,
        batch_id: &str,
    ) -> FundingResult<i64> {
        let balance = self.ledger.balance(tenant_id, account_id, None).await?;
        let reserved_elsewhere = self
            .reservations
            .active_sum_excluding(tenant_id, account_id, batch_id)
            .await?;
        Ok(balance - reserved_elsewhere)
    }

    #[expect(clippy::too_many_arguments)]
    async fn persist_evaluation(
        &self,
        tenant_id: &TenantId,
        legal_entity_id: &LegalEntityId,
        batch_id: &str,
        gate_type: GateType,
        outcome: GateOutcome,
        required_minor: i64,
        available_minor: i64,
        reasons: Vec<GateReason>,
        idempotency_key: String,
        correlation_id: &str,
        causation_id: Option<String>,
    ) -> FundingResult<Inserted<FundingGateEvaluationRow>> {
        // A pass claims the canonical per-batch key, so there is at most one
        // pass per batch and replays return it. Failed evaluations are
        // appended as their own audit rows; a later retry after funds arrive
        // must still be able to record the pass.
        let idempotency_key = if outcome == GateOutcome::Pass {
            idempotency_key
        } else {
            format!("{idempotency_key}:fail:{}", Uuid::new_v4())
        };
        let row = FundingGateEvaluationRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            legal_entity_id: legal_entity_id.clone(),
            batch_id: batch_id.to_string(),
            gate_type,
            outcome,
            required_minor,
            available_minor,
            reasons,
            correlation_id: correlation_id.to_string(),
            idempotency_key,
            // A commit replay with different totals is a conflict; the pay
            // gate re-derives its required amount at execution time, so its
            // pass replays benignly whatever the caller recomputed.
            request_fingerprint: match gate_type {
                GateType::Commit => fingerprint([
                    batch_id.to_string(),
                    "commit".to_string(),
                    required_minor.to_string(),
                ]),
                GateType::Pay => fingerprint([batch_id, "pay"]),
            },
            evaluated_at: Utc::now(),
        };
        let scope = EventScope {
            tenant_id: tenant_id.clone(),
            correlation_id: correlation_id.to_string(),
            causation_id,
        };
        let events = if outcome == GateOutcome::Pass {
            Vec::new()
        } else {
            vec![funding_blocked(&scope, &row)]
        };
        let persisted = self.store.insert_gate_evaluation(row, events).await?;
        if persisted.is_new && outcome != GateOutcome::Pass {
            tracing::warn!(
                batch_id = %batch_id,
                gate = ?gate_type,
                outcome = ?outcome,
                required_minor,
                available_minor,
                "funding gate blocked batch"
            );
        }
        Ok(persisted)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FundingRequestIntent {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub funding_model: FundingModel,
    pub rail: Rail,
    pub amount_minor: i64,
    pub currency: String,
    pub requested_settlement_date: NaiveDate,
    pub idempotency_key: String,
    pub correlation_id: String,
}

/// Client-to-PSP inbound funds intents. Settlement truth advances them;
/// this service only records the intent and its submission.
#[derive(Clone)]
pub struct FundingRequests {
    store: Arc<dyn SubLedgerStore>,
}

impl FundingRequests {
    pub fn new(store: Arc<dyn SubLedgerStore>) -> Self {
        Self { store }
    }

    pub async fn request(
        &self,
        intent: FundingRequestIntent,
    ) -> FundingResult<Inserted<FundingRequestRow>> {
        if intent.amount_minor <= 0 {
            return Err(FundingError::Validation(
                "funding amount must be strictly positive".into(),
            ));
        }
        let row = FundingRequestRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: intent.tenant_id.clone(),
            legal_entity_id: intent.legal_entity_id.clone(),
            funding_model: intent.funding_model,
            rail: intent.rail,
            amount_minor: intent.amount_minor,
            currency: intent.currency.clone(),
            requested_settlement_date: intent.requested_settlement_date,
            status: FundingRequestStatus::Created,
            provider_ref: None,
            idempotency_key: intent.idempotency_key.clone(),
            request_fingerprint: fingerprint([
                intent.currency.clone(),
                intent.amount_minor.to_string(),
                intent.requested_settlement_date.to_string(),
            ]),
            created_at: Utc::now(),
        };
        let scope = EventScope::new(intent.tenant_id, intent.correlation_id);
        let event = funding_requested(&scope, &row);
        Ok(self.store.insert_funding_request(row, vec![event]).await?)
    }

    pub async fn mark_submitted(
        &self,
        tenant_id: &TenantId,
        id: &str,
    ) -> FundingResult<FundingRequestRow> {
        Ok(self
            .store
            .transition_funding_request(
                tenant_id,
                &id.to_string(),
                FundingRequestStatus::Submitted,
                Vec::new(),
            )
            .await?)
    }
}

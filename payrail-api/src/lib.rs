#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The single entry point integrators embed. Wires the storage layer,
//! event log, ledger, gates, orchestrator and reconciler behind one
//! facade; internal services stay internal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;

use payrail_events::EventLog;
use payrail_events::EventsError;
use payrail_funding::BatchTotals;
use payrail_funding::CommitGateInput;
use payrail_funding::FundingError;
use payrail_funding::FundingGate;
use payrail_funding::FundingRequestIntent;
use payrail_funding::FundingRequests;
use payrail_funding::PayGateInput;
use payrail_ledger::CreateReservationRequest;
use payrail_ledger::LedgerEngine;
use payrail_ledger::LedgerError;
use payrail_ledger::ReservationManager;
use payrail_liability::LiabilityAttributor;
use payrail_liability::LiabilityError;
use payrail_payments::CreateInstructionRequest;
use payrail_payments::OrchestratorConfig;
use payrail_payments::PaymentOrchestrator;
use payrail_payments::PaymentsError;
use payrail_payments::SubmitOutcome;
use payrail_providers::ProviderError;
use payrail_providers::RailProvider;
use payrail_settlement::IngestSummary;
use payrail_settlement::MatchConfig;
use payrail_settlement::SettlementError;
use payrail_settlement::SettlementReconciler;
use payrail_store::AccountType;
use payrail_store::BankAccountRow;
use payrail_store::Direction;
use payrail_store::DomainEventRow;
use payrail_store::EventFilter;
use payrail_store::FundingGateEvaluationRow;
use payrail_store::FundingModel;
use payrail_store::FundingRequestRow;
use payrail_store::GateOutcome;
use payrail_store::Inserted;
use payrail_store::InstructionStatus;
use payrail_store::LedgerAccountRow;
use payrail_store::LegalEntityId;
use payrail_store::MemoryStore;
use payrail_store::PayeeType;
use payrail_store::PaymentInstructionRow;
use payrail_store::PaymentPurpose;
use payrail_store::Rail;
use payrail_store::ReservationRow;
use payrail_store::ReserveType;
use payrail_store::SourceType;
use payrail_store::StoreError;
use payrail_store::SubLedgerStore;
use payrail_store::TenantId;

mod telemetry;

pub use payrail_funding::ClientFundingStatus;
pub use payrail_funding::FundingPolicy;
pub use payrail_funding::GateMode;
pub use payrail_funding::RiskFlag;
pub use payrail_providers::SettlementRecord;
pub use telemetry::PspTelemetry;
pub use telemetry::TelemetryCounters;

pub type PspResult<T> = Result<T, PspError>;

#[derive(Debug, Error)]
pub enum PspError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Funding(#[from] FundingError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Liability(#[from] LiabilityError),
    #[error(transparent)]
    Payments(#[from] PaymentsError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error(transparent)]
    Events(#[from] EventsError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Construction-time configuration. Nothing here is read from the
/// environment; money flow never changes behind the integrator's back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PspConfig {
    pub funding_policy: FundingPolicy,
    pub orchestrator: OrchestratorConfig,
    pub matching: MatchConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayrollItem {
    pub payee_ref: String,
    pub payee_type: PayeeType,
    pub purpose: PaymentPurpose,
    pub amount_minor: i64,
    pub preferred_rail: Option<Rail>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayrollBatch {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub batch_id: String,
    pub currency: String,
    pub pay_date: NaiveDate,
    pub funding_model: FundingModel,
    pub funding_status: ClientFundingStatus,
    pub risk_flags: Vec<RiskFlag>,
    pub items: Vec<PayrollItem>,
}

impl PayrollBatch {
    pub fn totals(&self) -> BatchTotals {
        self.items
            .iter()
            .fold(BatchTotals::default(), |mut totals, item| {
                match item.purpose {
                    PaymentPurpose::NetPay => totals.net_minor += item.amount_minor,
                    PaymentPurpose::TaxRemittance => totals.tax_minor += item.amount_minor,
                    PaymentPurpose::ThirdPartyPayment => {
                        totals.third_party_minor += item.amount_minor;
                    }
                    PaymentPurpose::FeeCollection => totals.fee_minor += item.amount_minor,
                }
                totals
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestFundingParams {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub funding_model: FundingModel,
    pub rail: Rail,
    pub amount_minor: i64,
    pub currency: String,
    pub requested_settlement_date: NaiveDate,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    pub evaluation: Inserted<FundingGateEvaluationRow>,
    pub committed: bool,
    pub reservations: Vec<ReservationRow>,
    pub instructions: Vec<PaymentInstructionRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOutcome {
    pub evaluation: Inserted<FundingGateEvaluationRow>,
    pub submissions: Vec<SubmitOutcome>,
}

/// The holds a committed batch takes, by funding model: the single-
/// settlement models hold one combined reservation, `split_schedule`
/// holds one per bucket.
fn reservation_plan(model: FundingModel, totals: &BatchTotals) -> Vec<(ReserveType, i64)> {
    let plan = match model {
        FundingModel::SplitSchedule => vec![
            (ReserveType::NetPay, totals.net_minor),
            (ReserveType::Tax, totals.tax_minor),
            (ReserveType::ThirdParty, totals.third_party_minor),
            (ReserveType::Fees, totals.fee_minor),
        ],
        FundingModel::PrefundAll => vec![(ReserveType::NetPay, totals.grand_total())],
        FundingModel::NetOnly => vec![(ReserveType::NetPay, totals.net_minor)],
        FundingModel::NetAndThirdParty => vec![(
            ReserveType::NetPay,
            totals.net_minor + totals.third_party_minor,
        )],
    };
    plan.into_iter().filter(|(_, amount)| *amount > 0).collect()
}

#[derive(Clone)]
pub struct PspFacade {
    store: Arc<dyn SubLedgerStore>,
    events: EventLog,
    ledger: LedgerEngine,
    reservations: ReservationManager,
    gate: FundingGate,
    funding_requests: FundingRequests,
    orchestrator: PaymentOrchestrator,
    reconciler: SettlementReconciler,
    providers: Vec<Arc<dyn RailProvider>>,
    telemetry: PspTelemetry,
}

impl PspFacade {
    pub fn with_store(
        store: Arc<dyn SubLedgerStore>,
        config: PspConfig,
        providers: Vec<Arc<dyn RailProvider>>,
    ) -> Self {
        Self {
            events: EventLog::new(store.clone()),
            ledger: LedgerEngine::new(store.clone()),
            reservations: ReservationManager::new(store.clone()),
            gate: FundingGate::new(store.clone(), config.funding_policy),
            funding_requests: FundingRequests::new(store.clone()),
            orchestrator: PaymentOrchestrator::new(
                store.clone(),
                providers.clone(),
                config.orchestrator,
            ),
            reconciler: SettlementReconciler::new(store.clone(), config.matching),
            providers,
            telemetry: PspTelemetry::new(),
            store,
        }
    }

    /// Builds a facade over the in-memory reference store and seeds the
    /// return-code reference.
    pub async fn bootstrap(
        config: PspConfig,
        providers: Vec<Arc<dyn RailProvider>>,
    ) -> PspResult<Self> {
        let store = MemoryStore::shared();
        let facade = Self::with_store(store.clone(), config, providers);
        LiabilityAttributor::new(store).seed().await?;
        Ok(facade)
    }

    pub fn store(&self) -> Arc<dyn SubLedgerStore> {
        self.store.clone()
    }

    pub fn telemetry(&self) -> TelemetryCounters {
        self.telemetry.snapshot()
    }

    /// Opens the six-account chart for a legal entity. Idempotent.
    pub async fn seed_accounts(
        &self,
        tenant_id: &TenantId,
        legal_entity_id: &LegalEntityId,
        currency: &str,
    ) -> PspResult<Vec<LedgerAccountRow>> {
        Ok(self
            .ledger
            .seed_chart(tenant_id, legal_entity_id, currency)
            .await?)
    }

    /// Registers (or refreshes) a tokenized PSP settlement account and the
    /// rails it can move money over.
    pub async fn register_bank_account(
        &self,
        tenant_id: &TenantId,
        bank_account_id: &str,
        token: &str,
        rails: Vec<Rail>,
    ) -> PspResult<BankAccountRow> {
        if token.trim().is_empty() {
            return Err(PspError::Validation(
                "bank account token must be provided".into(),
            ));
        }
        Ok(self
            .store
            .upsert_bank_account(BankAccountRow {
                id: bank_account_id.to_string(),
                tenant_id: tenant_id.clone(),
                token: token.to_string(),
                rails,
                active: true,
                created_at: chrono::Utc::now(),
            })
            .await?)
    }

    pub async fn request_funding(
        &self,
        params: RequestFundingParams,
    ) -> PspResult<Inserted<FundingRequestRow>> {
        let request = self
            .funding_requests
            .request(FundingRequestIntent {
                tenant_id: params.tenant_id,
                legal_entity_id: params.legal_entity_id,
                funding_model: params.funding_model,
                rail: params.rail,
                amount_minor: params.amount_minor,
                currency: params.currency,
                requested_settlement_date: params.requested_settlement_date,
                idempotency_key: params.idempotency_key.clone(),
                correlation_id: format!("funding:{}", params.idempotency_key),
            })
            .await?;
        if request.is_new {
            self.telemetry.record_funding_request();
        }
        Ok(request)
    }

    /// Commit gate, reservations and instruction intents for one payroll
    /// batch, all idempotent on the batch id.
    pub async fn commit_payroll_batch(&self, batch: PayrollBatch) -> PspResult<CommitOutcome> {
        if batch.items.is_empty() {
            return Err(PspError::Validation(
                "payroll batch has no items".into(),
            ));
        }
        // Serializes evaluation and reservation creation per batch; the
        // gate's own lock nests inside this one.
        let _guard = self
            .store
            .advisory_lock(&format!("commit:{}:{}", batch.tenant_id, batch.batch_id))
            .await;

        let totals = batch.totals();
        let funding_account = self
            .ledger
            .account(
                &batch.tenant_id,
                &batch.legal_entity_id,
                AccountType::ClientFundingClearing,
                &batch.currency,
            )
            .await?;

        let evaluation = self
            .gate
            .evaluate_commit(CommitGateInput {
                tenant_id: batch.tenant_id.clone(),
                legal_entity_id: batch.legal_entity_id.clone(),
                batch_id: batch.batch_id.clone(),
                account_id: funding_account.id.clone(),
                funding_model: batch.funding_model,
                totals,
                funding_status: batch.funding_status,
                risk_flags: batch.risk_flags.clone(),
                correlation_id: batch.batch_id.clone(),
                causation_id: None,
            })
            .await?;
        if evaluation.is_new {
            self.telemetry
                .record_gate(evaluation.record.gate_type, evaluation.record.outcome);
        }

        if self.gate.policy().blocks_commit(evaluation.record.outcome) {
            tracing::warn!(
                batch_id = %batch.batch_id,
                outcome = ?evaluation.record.outcome,
                "commit gate blocked payroll batch"
            );
            return Ok(CommitOutcome {
                evaluation,
                committed: false,
                reservations: Vec::new(),
                instructions: Vec::new(),
            });
        }

        // Reservations only back a clean pass; a hybrid soft fail commits
        // without a hold and the pay gate keeps disbursement shut until
        // funds actually land.
        let mut reservations = Vec::new();
        if evaluation.record.outcome == GateOutcome::Pass && evaluation.is_new {
            for (reserve_type, amount_minor) in reservation_plan(batch.funding_model, &totals) {
                let reservation = self
                    .reservations
                    .create(CreateReservationRequest {
                        tenant_id: batch.tenant_id.clone(),
                        account_id: funding_account.id.clone(),
                        reserve_type,
                        amount_minor,
                        source_ref: batch.batch_id.clone(),
                        correlation_id: batch.batch_id.clone(),
                        causation_id: None,
                    })
                    .await?;
                reservations.push(reservation.record);
            }
        }

        let mut instructions = Vec::new();
        for item in &batch.items {
            let created = self
                .orchestrator
                .create_instruction(CreateInstructionRequest {
                    tenant_id: batch.tenant_id.clone(),
                    legal_entity_id: batch.legal_entity_id.clone(),
                    purpose: item.purpose,
                    direction: Direction::Outbound,
                    amount_minor: item.amount_minor,
                    currency: batch.currency.clone(),
                    payee_type: item.payee_type,
                    payee_ref: item.payee_ref.clone(),
                    preferred_rail: item.preferred_rail,
                    requested_settlement_date: batch.pay_date,
                    source_type: SourceType::PayrollBatch,
                    source_id: batch.batch_id.clone(),
                    idempotency_key: format!(
                        "{}:{}:{}",
                        batch.batch_id,
                        item.payee_ref,
                        item.amount_minor
                    ),
                    correlation_id: batch.batch_id.clone(),
                    causation_id: None,
                    metadata: serde_json::json!({ "pay_date": batch.pay_date }),
                })
                .await?;
            instructions.push(created.record);
        }

        Ok(CommitOutcome {
            evaluation,
            committed: true,
            reservations,
            instructions,
        })
    }

    /// Pay gate, then submission of every open instruction in the batch.
    /// A gate hard fail produces no attempts and no ledger movement.
    pub async fn execute_payments(
        &self,
        tenant_id: &TenantId,
        batch_id: &str,
    ) -> PspResult<ExecuteOutcome> {
        let _guard = self
            .store
            .advisory_lock(&format!("execute:{tenant_id}:{batch_id}"))
            .await;

        let instructions = self
            .store
            .instructions_for_source(tenant_id, batch_id)
            .await?;
        let open: Vec<&PaymentInstructionRow> = instructions
            .iter()
            .filter(|instruction| {
                matches!(
                    instruction.status,
                    InstructionStatus::Created | InstructionStatus::Queued
                )
            })
            .collect();
        if instructions.is_empty() {
            return Err(PspError::NotFound(format!(
                "no instructions for batch {batch_id}"
            )));
        }

        let first = instructions
            .first()
            .ok_or_else(|| PspError::NotFound(format!("no instructions for batch {batch_id}")))?;
        let funding_account = self
            .ledger
            .account(
                tenant_id,
                &first.legal_entity_id,
                AccountType::ClientFundingClearing,
                &first.currency,
            )
            .await?;
        let required: i64 = open.iter().map(|instruction| instruction.amount_minor).sum();

        let evaluation = self
            .gate
            .evaluate_pay(PayGateInput {
                tenant_id: tenant_id.clone(),
                legal_entity_id: first.legal_entity_id.clone(),
                batch_id: batch_id.to_string(),
                account_id: funding_account.id,
                required_minor: required.max(1),
                correlation_id: batch_id.to_string(),
                causation_id: None,
            })
            .await?;
        if evaluation.is_new {
            self.telemetry
                .record_gate(evaluation.record.gate_type, evaluation.record.outcome);
        }
        if evaluation.record.outcome != GateOutcome::Pass {
            return Ok(ExecuteOutcome {
                evaluation,
                submissions: Vec::new(),
            });
        }

        // Submit everything not yet terminal; already-submitted
        // instructions replay their existing attempt.
        let mut submissions = Vec::new();
        let mut fresh = 0;
        for instruction in instructions
            .iter()
            .filter(|instruction| !instruction.status.is_terminal())
            .filter(|instruction| instruction.status != InstructionStatus::Settled)
        {
            let outcome = self
                .orchestrator
                .submit(tenant_id, &instruction.id, batch_id)
                .await?;
            if outcome.is_new {
                fresh += 1;
            }
            submissions.push(outcome);
        }
        self.telemetry.record_submissions(fresh);

        Ok(ExecuteOutcome {
            evaluation,
            submissions,
        })
    }

    /// Ingests a pulled settlement feed. Safe to replay in full. An
    /// invariant violation halts the run and leaves an operational alert
    /// in the event log.
    pub async fn ingest_settlement_feed(
        &self,
        tenant_id: &TenantId,
        records: Vec<SettlementRecord>,
    ) -> PspResult<IngestSummary> {
        let correlation = format!("reconcile:{tenant_id}");
        match self.reconciler.ingest(tenant_id, records, &correlation).await {
            Ok(summary) => {
                self.telemetry.record_ingest(&summary);
                Ok(summary)
            }
            Err(error) => {
                let invariant = match &error {
                    SettlementError::Store(StoreError::Invariant(detail)) => Some(detail),
                    SettlementError::Ledger(LedgerError::Store(StoreError::Invariant(detail))) => {
                        Some(detail)
                    }
                    _ => None,
                };
                if let Some(detail) = invariant {
                    let scope = payrail_events::EventScope::new(tenant_id.clone(), correlation);
                    let alert = payrail_events::operational_alert(
                        &scope,
                        "settlement ingest halted on storage invariant",
                        serde_json::json!({ "detail": detail }),
                    );
                    if let Err(append_error) = self.events.append(alert).await {
                        tracing::error!(
                            error = %append_error,
                            "failed to record operational alert"
                        );
                    }
                }
                Err(error.into())
            }
        }
    }

    /// Verifies and ingests one provider webhook. Signature failures
    /// surface as security errors before any parsing.
    pub async fn handle_provider_callback(
        &self,
        tenant_id: &TenantId,
        provider: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> PspResult<IngestSummary> {
        let adapter = self
            .providers
            .iter()
            .find(|candidate| candidate.name() == provider)
            .ok_or_else(|| PspError::NotFound(format!("provider {provider}")))?;
        let record = adapter.parse_webhook(body, headers)?;
        self.ingest_settlement_feed(tenant_id, vec![record]).await
    }

    pub async fn get_balance(
        &self,
        tenant_id: &TenantId,
        legal_entity_id: &LegalEntityId,
        account_type: AccountType,
        currency: &str,
    ) -> PspResult<i64> {
        let account = self
            .ledger
            .account(tenant_id, legal_entity_id, account_type, currency)
            .await?;
        Ok(self.ledger.balance(tenant_id, &account.id, None).await?)
    }

    /// Full-payload event replay for projections and audits.
    pub async fn replay_events(
        &self,
        tenant_id: &TenantId,
        filter: &EventFilter,
    ) -> PspResult<Vec<DomainEventRow>> {
        Ok(self.events.replay(tenant_id, filter).await?)
    }
}

#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Payment orchestration: the instruction/attempt state machine, rail
//! selection and idempotent submission. Nothing here can disburse without
//! a persisted pay-gate pass for the instruction's batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use payrail_events::EventScope;
use payrail_events::payment_failed;
use payrail_events::payment_instruction_created;
use payrail_events::payment_submitted;
use payrail_funding::FundingError;
use payrail_funding::pay_gate_key;
use payrail_providers::ProviderError;
use payrail_providers::RailProvider;
use payrail_providers::SubmitAck;
use payrail_providers::SubmitRequest;
use payrail_store::AttemptStatus;
use payrail_store::Direction;
use payrail_store::GateOutcome;
use payrail_store::InstructionId;
use payrail_store::InstructionStatus;
use payrail_store::LegalEntityId;
use payrail_store::PayeeType;
use payrail_store::PaymentAttemptRow;
use payrail_store::PaymentInstructionRow;
use payrail_store::PaymentPurpose;
use payrail_store::Rail;
use payrail_store::SourceType;
use payrail_store::StoreError;
use payrail_store::SubLedgerStore;
use payrail_store::TenantId;
use payrail_store::fingerprint;

pub type PaymentsResult<T> = Result<T, PaymentsError>;

#[derive(Debug, Error)]
pub enum PaymentsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("no pay-gate pass persisted for batch {batch_id}")]
    PayGateNotPassed { batch_id: String },
    #[error("no eligible provider for rail {rail:?} and amount {amount_minor}")]
    NoEligibleProvider { rail: Rail, amount_minor: i64 },
    #[error("instruction {instruction_id} cannot {action} from {status:?}")]
    InvalidState {
        instruction_id: InstructionId,
        status: InstructionStatus,
        action: &'static str,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Funding(#[from] FundingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Provider submissions per instruction before the attempt is recorded
    /// as terminally failed.
    pub max_submit_attempts: u32,
    /// Base of the exponential backoff between retries.
    pub retry_base_delay_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_submit_attempts: 3,
            retry_base_delay_ms: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateInstructionRequest {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub purpose: PaymentPurpose,
    pub direction: Direction,
    pub amount_minor: i64,
    pub currency: String,
    pub payee_type: PayeeType,
    pub payee_ref: String,
    pub preferred_rail: Option<Rail>,
    pub requested_settlement_date: NaiveDate,
    pub source_type: SourceType,
    pub source_id: String,
    pub idempotency_key: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub instruction: PaymentInstructionRow,
    pub attempt: PaymentAttemptRow,
    pub is_new: bool,
}

/// The default rail for a purpose when the payee expressed no preference.
pub fn default_rail(purpose: PaymentPurpose) -> Rail {
    match purpose {
        PaymentPurpose::NetPay => Rail::Ach,
        PaymentPurpose::TaxRemittance => Rail::FedNow,
        PaymentPurpose::ThirdPartyPayment => Rail::Ach,
        PaymentPurpose::FeeCollection => Rail::Ach,
    }
}

/// Deterministic provider choice: eligibility by rail and amount limit,
/// urgency by whether the advertised settlement timeline meets the
/// requested date, then the tie-break (cost, settlement speed, recent
/// success rate, name).
pub fn select_provider(
    providers: &[Arc<dyn RailProvider>],
    rail: Rail,
    amount_minor: i64,
    requested_date: NaiveDate,
    today: NaiveDate,
) -> Option<Arc<dyn RailProvider>> {
    let due_in_days = (requested_date - today).num_days().max(0);
    let mut candidates: Vec<(&Arc<dyn RailProvider>, bool, i64, u8, f32)> = providers
        .iter()
        .filter_map(|provider| {
            let capabilities = provider.capabilities();
            if !capabilities.supported_rails.contains(&rail) {
                return None;
            }
            if amount_minor > capabilities.max_per_txn_minor {
                return None;
            }
            let on_time = i64::from(capabilities.settlement_days) <= due_in_days;
            Some((
                provider,
                on_time,
                capabilities.cost_minor_per_txn,
                capabilities.settlement_days,
                capabilities.recent_success_rate,
            ))
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then(a.2.cmp(&b.2))
            .then(a.3.cmp(&b.3))
            .then(b.4.total_cmp(&a.4))
            .then(a.0.name().cmp(b.0.name()))
    });
    candidates.first().map(|(provider, ..)| Arc::clone(provider))
}

#[derive(Clone)]
pub struct PaymentOrchestrator {
    store: Arc<dyn SubLedgerStore>,
    providers: Vec<Arc<dyn RailProvider>>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn SubLedgerStore>,
        providers: Vec<Arc<dyn RailProvider>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            providers,
            config,
        }
    }

    /// Records the business intent. Idempotent on
    /// `(tenant, idempotency_key)`; `PaymentInstructionCreated` is emitted
    /// only with a fresh insert.
    pub async fn create_instruction(
        &self,
        request: CreateInstructionRequest,
    ) -> PaymentsResult<payrail_store::Inserted<PaymentInstructionRow>> {
        if request.amount_minor <= 0 {
            return Err(PaymentsError::Validation(
                "instruction amount must be strictly positive".into(),
            ));
        }
        let now = Utc::now();
        let row = PaymentInstructionRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            legal_entity_id: request.legal_entity_id.clone(),
            purpose: request.purpose,
            direction: request.direction,
            amount_minor: request.amount_minor,
            currency: request.currency.clone(),
            payee_type: request.payee_type,
            payee_ref: request.payee_ref.clone(),
            preferred_rail: request.preferred_rail,
            requested_settlement_date: request.requested_settlement_date,
            status: InstructionStatus::Created,
            source_type: request.source_type,
            source_id: request.source_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            request_fingerprint: fingerprint([
                request.payee_ref.clone(),
                request.amount_minor.to_string(),
                request.currency.clone(),
                request.source_id.clone(),
            ]),
            metadata: request.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        let scope = EventScope {
            tenant_id: request.tenant_id,
            correlation_id: request.correlation_id,
            causation_id: request.causation_id,
        };
        let event = payment_instruction_created(&scope, &row);
        Ok(self.store.insert_instruction(row, vec![event]).await?)
    }

    /// Submits an instruction to a rail provider. Serialized per
    /// instruction by a row-scoped advisory lock; refuses to run without a
    /// persisted pay-gate pass for the instruction's batch; idempotent
    /// across retries and concurrent callers.
    pub async fn submit(
        &self,
        tenant_id: &TenantId,
        instruction_id: &InstructionId,
        correlation_id: &str,
    ) -> PaymentsResult<SubmitOutcome> {
        let lock_key = format!("instruction:{tenant_id}:{instruction_id}");
        let _guard = self.store.advisory_lock(&lock_key).await;

        let instruction = self
            .store
            .instruction(tenant_id, instruction_id)
            .await?
            .ok_or_else(|| {
                PaymentsError::NotFound(format!("payment instruction {instruction_id}"))
            })?;

        // Idempotent re-submit: a live or finished instruction returns its
        // existing attempt.
        if !matches!(
            instruction.status,
            InstructionStatus::Created | InstructionStatus::Queued
        ) {
            let attempt = self
                .store
                .attempts_for_instruction(tenant_id, instruction_id)
                .await?
                .into_iter()
                .next_back()
                .ok_or_else(|| PaymentsError::InvalidState {
                    instruction_id: instruction_id.clone(),
                    status: instruction.status,
                    action: "submit",
                })?;
            return Ok(SubmitOutcome {
                instruction,
                attempt,
                is_new: false,
            });
        }

        self.require_pay_gate_pass(tenant_id, &instruction.source_id)
            .await?;

        let rail = instruction.preferred_rail.unwrap_or(default_rail(instruction.purpose));
        let provider = select_provider(
            &self.providers,
            rail,
            instruction.amount_minor,
            instruction.requested_settlement_date,
            Utc::now().date_naive(),
        )
        .ok_or(PaymentsError::NoEligibleProvider {
            rail,
            amount_minor: instruction.amount_minor,
        })?;

        let instruction = if instruction.status == InstructionStatus::Created {
            self.store
                .transition_instruction(
                    tenant_id,
                    instruction_id,
                    InstructionStatus::Queued,
                    Vec::new(),
                )
                .await?
        } else {
            instruction
        };

        let request = SubmitRequest {
            tenant_id: tenant_id.clone(),
            instruction_id: instruction_id.clone(),
            idempotency_key: instruction.idempotency_key.clone(),
            rail,
            direction: instruction.direction,
            amount_minor: instruction.amount_minor,
            currency: instruction.currency.clone(),
            payee_type: instruction.payee_type,
            payee_ref: instruction.payee_ref.clone(),
            settlement_date: instruction.requested_settlement_date,
        };
        let scope = EventScope::new(tenant_id.clone(), correlation_id.to_string());

        match self.submit_with_retries(provider.as_ref(), &request).await {
            Ok(ack) => {
                self.record_submission(tenant_id, &instruction, provider.name(), ack, &scope)
                    .await
            }
            Err(error) => {
                let outcome = self
                    .record_terminal_failure(tenant_id, &instruction, provider.name(), &error, &scope)
                    .await?;
                tracing::warn!(
                    instruction_id = %instruction.id,
                    provider = provider.name(),
                    error = %error,
                    "payment submission failed terminally"
                );
                Ok(outcome)
            }
        }
    }

    /// Cancels from `{queued, submitted, accepted}`, delegating to the
    /// provider when an attempt is already in flight.
    pub async fn cancel(
        &self,
        tenant_id: &TenantId,
        instruction_id: &InstructionId,
    ) -> PaymentsResult<PaymentInstructionRow> {
        let lock_key = format!("instruction:{tenant_id}:{instruction_id}");
        let _guard = self.store.advisory_lock(&lock_key).await;

        let instruction = self
            .store
            .instruction(tenant_id, instruction_id)
            .await?
            .ok_or_else(|| {
                PaymentsError::NotFound(format!("payment instruction {instruction_id}"))
            })?;
        if !instruction.status.cancelable() {
            return Err(PaymentsError::InvalidState {
                instruction_id: instruction_id.clone(),
                status: instruction.status,
                action: "cancel",
            });
        }

        let attempts = self
            .store
            .attempts_for_instruction(tenant_id, instruction_id)
            .await?;
        if let Some(attempt) = attempts.last() {
            let provider = self
                .providers
                .iter()
                .find(|provider| provider.name() == attempt.provider)
                .ok_or_else(|| {
                    PaymentsError::NotFound(format!("provider {}", attempt.provider))
                })?;
            if !provider.capabilities().supports_cancel {
                return Err(PaymentsError::Provider(ProviderError::CancelUnsupported {
                    provider: attempt.provider.clone(),
                }));
            }
            let canceled = provider.cancel(&attempt.provider_request_id).await?;
            if !canceled {
                return Err(PaymentsError::InvalidState {
                    instruction_id: instruction_id.clone(),
                    status: instruction.status,
                    action: "cancel",
                });
            }
        }

        Ok(self
            .store
            .transition_instruction(
                tenant_id,
                instruction_id,
                InstructionStatus::Canceled,
                Vec::new(),
            )
            .await?)
    }

    async fn require_pay_gate_pass(
        &self,
        tenant_id: &TenantId,
        batch_id: &str,
    ) -> PaymentsResult<()> {
        let pass = self
            .store
            .gate_evaluation_by_key(tenant_id, &pay_gate_key(batch_id))
            .await?
            .filter(|evaluation| evaluation.outcome == GateOutcome::Pass);
        if pass.is_none() {
            return Err(PaymentsError::PayGateNotPassed {
                batch_id: batch_id.to_string(),
            });
        }
        Ok(())
    }

    async fn submit_with_retries(
        &self,
        provider: &dyn RailProvider,
        request: &SubmitRequest,
    ) -> Result<SubmitAck, ProviderError> {
        let attempts = self.config.max_submit_attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry_base_delay_ms.saturating_mul(1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match provider.submit(request).await {
                Ok(ack) if ack.status == AttemptStatus::Failed => {
                    if ack.retryable != Some(true) {
                        return Err(ProviderError::Rejected {
                            provider: provider.name().to_string(),
                            detail: format!("request {} failed", ack.provider_request_id),
                        });
                    }
                    last_error = Some(ProviderError::Unavailable {
                        provider: provider.name().to_string(),
                        detail: "provider reported a retryable failure".into(),
                    });
                }
                Ok(ack) => return Ok(ack),
                Err(error) if error.retryable() => {
                    tracing::debug!(
                        provider = provider.name(),
                        instruction_id = %request.instruction_id,
                        attempt,
                        error = %error,
                        "retrying provider submission"
                    );
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error.unwrap_or(ProviderError::Unavailable {
            provider: provider.name().to_string(),
            detail: "no submission attempts were made".into(),
        }))
    }

    async fn record_submission(
        &self,
        tenant_id: &TenantId,
        instruction: &PaymentInstructionRow,
        provider: &str,
        ack: SubmitAck,
        scope: &EventScope,
    ) -> PaymentsResult<SubmitOutcome> {
        let now = Utc::now();
        let row = PaymentAttemptRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            instruction_id: instruction.id.clone(),
            rail: instruction.preferred_rail.unwrap_or(default_rail(instruction.purpose)),
            provider: provider.to_string(),
            provider_request_id: ack.provider_request_id,
            status: ack.status,
            request_payload: serde_json::json!({
                "amount_minor": instruction.amount_minor,
                "currency": instruction.currency,
                "payee_ref": instruction.payee_ref,
                "idempotency_key": instruction.idempotency_key,
            }),
            submitted_at: now,
            updated_at: now,
        };
        let attempt = self.store.insert_attempt(row, Vec::new()).await?;

        // Keyed to the queued -> submitted edge rather than attempt
        // freshness: a crash between the attempt insert and the transition
        // still converges on retry, and the event fires exactly once.
        let instruction = if instruction.status == InstructionStatus::Queued {
            self.store
                .transition_instruction(
                    tenant_id,
                    &instruction.id,
                    InstructionStatus::Submitted,
                    vec![payment_submitted(scope, instruction, &attempt.record)],
                )
                .await?
        } else {
            instruction.clone()
        };

        Ok(SubmitOutcome {
            instruction,
            attempt: attempt.record,
            is_new: attempt.is_new,
        })
    }

    /// Terminal provider failure: record the failed attempt under a
    /// synthetic provider request id so uniqueness and replay behavior
    /// hold, then drive the instruction to `failed`.
    async fn record_terminal_failure(
        &self,
        tenant_id: &TenantId,
        instruction: &PaymentInstructionRow,
        provider: &str,
        error: &ProviderError,
        scope: &EventScope,
    ) -> PaymentsResult<SubmitOutcome> {
        let now = Utc::now();
        let row = PaymentAttemptRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            instruction_id: instruction.id.clone(),
            rail: instruction.preferred_rail.unwrap_or(default_rail(instruction.purpose)),
            provider: provider.to_string(),
            provider_request_id: format!("failed:{}", instruction.idempotency_key),
            status: AttemptStatus::Failed,
            request_payload: serde_json::json!({
                "amount_minor": instruction.amount_minor,
                "error": error.to_string(),
            }),
            submitted_at: now,
            updated_at: now,
        };
        let attempt = self.store.insert_attempt(row, Vec::new()).await?;

        let instruction = if instruction.status == InstructionStatus::Queued {
            self.store
                .transition_instruction(
                    tenant_id,
                    &instruction.id,
                    InstructionStatus::Submitted,
                    Vec::new(),
                )
                .await?;
            self.store
                .transition_instruction(
                    tenant_id,
                    &instruction.id,
                    InstructionStatus::Failed,
                    vec![payment_failed(scope, instruction, &error.to_string())],
                )
                .await?
        } else {
            instruction.clone()
        };

        Ok(SubmitOutcome {
            instruction,
            attempt: attempt.record,
            is_new: attempt.is_new,
        })
    }
}

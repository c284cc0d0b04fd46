#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Liability attribution for returns: a seeded `(rail, code)` reference
//! maps return codes to origin, responsible party and recovery path.
//! Determinations are appended, never edited.

use std::sync::Arc;

use chrono::Duration;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use payrail_events::EventScope;
use payrail_events::liability_classified;
use payrail_store::ErrorOrigin;
use payrail_store::Inserted;
use payrail_store::LiabilityEventRow;
use payrail_store::LiabilityParty;
use payrail_store::LiabilitySource;
use payrail_store::Rail;
use payrail_store::RecoveryPath;
use payrail_store::RecoveryStatus;
use payrail_store::ReturnCodeReferenceRow;
use payrail_store::StoreError;
use payrail_store::SubLedgerStore;
use payrail_store::TenantId;
use payrail_store::fingerprint;

pub type LiabilityResult<T> = Result<T, LiabilityError>;

#[derive(Debug, Error)]
pub enum LiabilityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Repeated-return escalation: `threshold`-or-more recoverable returns
/// charged to the same counterparty inside `window_days` escalate the
/// recovery path to a direct reclaim.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationPolicy {
    pub code: String,
    pub threshold: usize,
    pub window_days: i64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            code: "R01".into(),
            threshold: 3,
            window_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyRequest {
    pub tenant_id: TenantId,
    pub source: LiabilitySource,
    pub source_id: String,
    pub rail: Rail,
    pub return_code: Option<String>,
    /// The employer (or other counterparty) charged by the determination.
    pub counterparty_ref: Option<String>,
    pub loss_minor: i64,
    pub evidence: serde_json::Value,
    pub idempotency_key: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Determination {
    pub error_origin: ErrorOrigin,
    pub liability_party: LiabilityParty,
    pub recovery_path: RecoveryPath,
    pub needs_manual_review: bool,
    pub reason: String,
}

fn reference(
    rail: Rail,
    code: &str,
    origin: ErrorOrigin,
    party: LiabilityParty,
    recoverable: bool,
    description: &str,
) -> ReturnCodeReferenceRow {
    ReturnCodeReferenceRow {
        rail,
        code: code.into(),
        error_origin: origin,
        liability_party: party,
        is_recoverable: recoverable,
        description: description.into(),
    }
}

/// The minimal seed: ACH R01-R10, R16, R20, R29 and the FedNow reject
/// codes the reconciler is expected to meet in practice.
pub fn seed_reference() -> Vec<ReturnCodeReferenceRow> {
    use ErrorOrigin::Bank;
    use ErrorOrigin::Employer as OriginEmployer;
    use ErrorOrigin::Psp as OriginPsp;
    use ErrorOrigin::Recipient;
    use ErrorOrigin::Unknown;
    use LiabilityParty::Employer;
    use LiabilityParty::Pending;
    use LiabilityParty::Psp;

    vec![
        reference(Rail::Ach, "R01", Recipient, Employer, true, "Insufficient funds"),
        reference(Rail::Ach, "R02", Recipient, Employer, true, "Account closed"),
        reference(Rail::Ach, "R03", OriginEmployer, Employer, true, "No account / unable to locate"),
        reference(Rail::Ach, "R04", OriginEmployer, Employer, true, "Invalid account number"),
        reference(Rail::Ach, "R05", OriginPsp, Psp, false, "Unauthorized debit to consumer account"),
        reference(Rail::Ach, "R06", OriginPsp, Psp, false, "Returned per ODFI request"),
        reference(Rail::Ach, "R07", Recipient, Employer, false, "Authorization revoked by customer"),
        reference(Rail::Ach, "R08", Recipient, Employer, false, "Payment stopped"),
        reference(Rail::Ach, "R09", Recipient, Employer, true, "Uncollected funds"),
        reference(Rail::Ach, "R10", Recipient, Psp, false, "Customer advises not authorized"),
        reference(Rail::Ach, "R16", Bank, Employer, false, "Account frozen"),
        reference(Rail::Ach, "R20", OriginEmployer, Employer, false, "Non-transaction account"),
        reference(Rail::Ach, "R29", OriginEmployer, Employer, false, "Corporate customer advises not authorized"),
        reference(Rail::FedNow, "AC01", OriginEmployer, Employer, true, "Incorrect account number"),
        reference(Rail::FedNow, "AC04", Recipient, Employer, true, "Closed account number"),
        reference(Rail::FedNow, "AC06", Bank, Employer, false, "Blocked account"),
        reference(Rail::FedNow, "AM02", OriginPsp, Psp, false, "Amount not allowed"),
        reference(Rail::FedNow, "AM04", Recipient, Employer, true, "Insufficient funds"),
        reference(Rail::FedNow, "BE04", OriginEmployer, Employer, true, "Missing creditor address"),
        reference(Rail::FedNow, "RJCT", Unknown, Pending, false, "Rejected, no further detail"),
    ]
}

#[derive(Clone)]
pub struct LiabilityAttributor {
    store: Arc<dyn SubLedgerStore>,
    escalation: EscalationPolicy,
}

impl LiabilityAttributor {
    pub fn new(store: Arc<dyn SubLedgerStore>) -> Self {
        Self {
            store,
            escalation: EscalationPolicy::default(),
        }
    }

    pub fn with_escalation(store: Arc<dyn SubLedgerStore>, escalation: EscalationPolicy) -> Self {
        Self { store, escalation }
    }

    /// Loads the reference seed into the store. Idempotent.
    pub async fn seed(&self) -> LiabilityResult<()> {
        Ok(self.store.seed_return_codes(seed_reference()).await?)
    }

    /// Pure lookup: `(rail, code)` to a determination. Unknown codes fall
    /// back to pending manual review.
    pub async fn determine(
        &self,
        rail: Rail,
        return_code: Option<&str>,
    ) -> LiabilityResult<Determination> {
        let Some(code) = return_code else {
            return Ok(Determination {
                error_origin: ErrorOrigin::Unknown,
                liability_party: LiabilityParty::Pending,
                recovery_path: RecoveryPath::None,
                needs_manual_review: true,
                reason: "return carried no code".into(),
            });
        };
        match self.store.return_code(rail, code).await? {
            Some(entry) => Ok(Determination {
                error_origin: entry.error_origin,
                liability_party: entry.liability_party,
                recovery_path: if entry.is_recoverable {
                    RecoveryPath::OffsetFuture
                } else {
                    RecoveryPath::WriteOff
                },
                needs_manual_review: false,
                reason: format!("{code}: {}", entry.description),
            }),
            None => Ok(Determination {
                error_origin: ErrorOrigin::Unknown,
                liability_party: LiabilityParty::Pending,
                recovery_path: RecoveryPath::None,
                needs_manual_review: true,
                reason: format!("unknown return code {code} on {rail:?}"),
            }),
        }
    }

    /// Classifies a return and records an append-only liability event,
    /// idempotent on `(tenant, idempotency_key)`. `LiabilityClassified`
    /// is emitted only with a fresh insert.
    pub async fn classify(
        &self,
        request: ClassifyRequest,
    ) -> LiabilityResult<Inserted<LiabilityEventRow>> {
        let mut determination = self
            .determine(request.rail, request.return_code.as_deref())
            .await?;

        if let Some(code) = &request.return_code
            && code == &self.escalation.code
            && let Some(counterparty) = &request.counterparty_ref
        {
            let repeats = self
                .count_recent_repeats(&request.tenant_id, code, counterparty)
                .await?;
            // This classification itself joins the streak.
            if repeats + 1 >= self.escalation.threshold {
                determination.recovery_path = RecoveryPath::Reclaim;
                determination.reason = format!(
                    "{}; escalated after {} {} returns within {} days",
                    determination.reason,
                    repeats + 1,
                    code,
                    self.escalation.window_days
                );
            }
        }

        if determination.needs_manual_review {
            tracing::warn!(
                source_id = %request.source_id,
                rail = ?request.rail,
                return_code = ?request.return_code,
                "unknown return code parked for manual review"
            );
        }

        let row = LiabilityEventRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            source: request.source,
            source_id: request.source_id.clone(),
            rail: Some(request.rail),
            return_code: request.return_code.clone(),
            counterparty_ref: request.counterparty_ref.clone(),
            error_origin: determination.error_origin,
            liability_party: determination.liability_party,
            recovery_path: determination.recovery_path,
            loss_minor: request.loss_minor,
            recovery_status: RecoveryStatus::Pending,
            determination_reason: determination.reason,
            evidence: request.evidence.clone(),
            idempotency_key: request.idempotency_key.clone(),
            request_fingerprint: fingerprint([
                request.source_id.clone(),
                request.return_code.clone().unwrap_or_default(),
                request.loss_minor.to_string(),
            ]),
            recorded_at: Utc::now(),
        };
        let scope = EventScope {
            tenant_id: request.tenant_id,
            correlation_id: request.correlation_id,
            causation_id: request.causation_id,
        };
        let event = liability_classified(&scope, &row);
        Ok(self.store.insert_liability_event(row, vec![event]).await?)
    }

    async fn count_recent_repeats(
        &self,
        tenant_id: &TenantId,
        code: &str,
        counterparty: &str,
    ) -> LiabilityResult<usize> {
        let cutoff = Utc::now() - Duration::days(self.escalation.window_days);
        Ok(self
            .store
            .liability_events(tenant_id)
            .await?
            .iter()
            .filter(|event| {
                event.return_code.as_deref() == Some(code)
                    && event.counterparty_ref.as_deref() == Some(counterparty)
                    && event.recorded_at >= cutoff
            })
            .count())
    }
}

#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Immutable domain-event log: append, filtered query, cursor subscriptions
//! and replay, plus the payload builders every engine uses so the closed
//! event set stays consistent in one place.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use payrail_store::DomainEventRow;
use payrail_store::EventFilter;
use payrail_store::EventId;
use payrail_store::EventSubscriptionRow;
use payrail_store::EventType;
use payrail_store::FundingGateEvaluationRow;
use payrail_store::FundingRequestRow;
use payrail_store::Inserted;
use payrail_store::LedgerEntryRow;
use payrail_store::LiabilityEventRow;
use payrail_store::PaymentAttemptRow;
use payrail_store::PaymentInstructionRow;
use payrail_store::ReservationRow;
use payrail_store::SettlementEventRow;
use payrail_store::StoreError;
use payrail_store::SubLedgerStore;
use payrail_store::TenantId;

pub const EVENT_SCHEMA_VERSION: u16 = 1;

pub type EventsResult<T> = Result<T, EventsError>;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The tenant/correlation/causation context an event is emitted under.
/// One scope spans one business workflow (a payroll batch, a
/// reconciliation run); causation points at the event being handled.
#[derive(Debug, Clone, PartialEq)]
pub struct EventScope {
    pub tenant_id: TenantId,
    pub correlation_id: String,
    pub causation_id: Option<EventId>,
}

impl EventScope {
    pub fn new(tenant_id: impl Into<TenantId>, correlation_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            correlation_id: correlation_id.into(),
            causation_id: None,
        }
    }

    #[must_use]
    pub fn caused_by(&self, event_id: impl Into<EventId>) -> Self {
        Self {
            causation_id: Some(event_id.into()),
            ..self.clone()
        }
    }

    fn build(&self, event_type: EventType, payload: serde_json::Value) -> DomainEventRow {
        DomainEventRow {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            category: event_type.category(),
            tenant_id: self.tenant_id.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            occurred_at: Utc::now(),
            payload,
            version: EVENT_SCHEMA_VERSION,
        }
    }
}

pub fn ledger_entry_posted(scope: &EventScope, entry: &LedgerEntryRow) -> DomainEventRow {
    scope.build(
        EventType::LedgerEntryPosted,
        json!({
            "entry_id": entry.id,
            "debit_account_id": entry.debit_account_id,
            "credit_account_id": entry.credit_account_id,
            "amount_minor": entry.amount_minor,
            "currency": entry.currency,
            "entry_type": entry.entry_type,
            "source_type": entry.source_type,
            "source_id": entry.source_id,
        }),
    )
}

pub fn ledger_entry_reversed(
    scope: &EventScope,
    original_id: &str,
    reversal: &LedgerEntryRow,
) -> DomainEventRow {
    scope.build(
        EventType::LedgerEntryReversed,
        json!({
            "original_entry_id": original_id,
            "reversal_entry_id": reversal.id,
            "amount_minor": reversal.amount_minor,
            "debit_account_id": reversal.debit_account_id,
            "credit_account_id": reversal.credit_account_id,
        }),
    )
}

pub fn reservation_created(scope: &EventScope, reservation: &ReservationRow) -> DomainEventRow {
    scope.build(
        EventType::ReservationCreated,
        json!({
            "reservation_id": reservation.id,
            "account_id": reservation.account_id,
            "reserve_type": reservation.reserve_type,
            "amount_minor": reservation.amount_minor,
            "source_ref": reservation.source_ref,
        }),
    )
}

pub fn reservation_released(scope: &EventScope, reservation: &ReservationRow) -> DomainEventRow {
    scope.build(
        EventType::ReservationReleased,
        json!({
            "reservation_id": reservation.id,
            "account_id": reservation.account_id,
            "amount_minor": reservation.amount_minor,
            "source_ref": reservation.source_ref,
        }),
    )
}

pub fn reservation_consumed(scope: &EventScope, reservation: &ReservationRow) -> DomainEventRow {
    scope.build(
        EventType::ReservationConsumed,
        json!({
            "reservation_id": reservation.id,
            "account_id": reservation.account_id,
            "amount_minor": reservation.amount_minor,
            "source_ref": reservation.source_ref,
        }),
    )
}

pub fn funding_requested(scope: &EventScope, request: &FundingRequestRow) -> DomainEventRow {
    scope.build(
        EventType::FundingRequested,
        json!({
            "funding_request_id": request.id,
            "funding_model": request.funding_model,
            "rail": request.rail,
            "amount_minor": request.amount_minor,
            "currency": request.currency,
            "requested_settlement_date": request.requested_settlement_date,
        }),
    )
}

pub fn funding_settled(
    scope: &EventScope,
    request: &FundingRequestRow,
    entry_id: &str,
) -> DomainEventRow {
    scope.build(
        EventType::FundingSettled,
        json!({
            "funding_request_id": request.id,
            "amount_minor": request.amount_minor,
            "ledger_entry_id": entry_id,
        }),
    )
}

pub fn funding_blocked(
    scope: &EventScope,
    evaluation: &FundingGateEvaluationRow,
) -> DomainEventRow {
    scope.build(
        EventType::FundingBlocked,
        json!({
            "evaluation_id": evaluation.id,
            "batch_id": evaluation.batch_id,
            "gate_type": evaluation.gate_type,
            "outcome": evaluation.outcome,
            "required_minor": evaluation.required_minor,
            "available_minor": evaluation.available_minor,
            "reasons": evaluation.reasons,
        }),
    )
}

pub fn payment_instruction_created(
    scope: &EventScope,
    instruction: &PaymentInstructionRow,
) -> DomainEventRow {
    scope.build(
        EventType::PaymentInstructionCreated,
        json!({
            "instruction_id": instruction.id,
            "purpose": instruction.purpose,
            "direction": instruction.direction,
            "amount_minor": instruction.amount_minor,
            "currency": instruction.currency,
            "payee_type": instruction.payee_type,
            "payee_ref": instruction.payee_ref,
            "source_id": instruction.source_id,
        }),
    )
}

pub fn payment_submitted(
    scope: &EventScope,
    instruction: &PaymentInstructionRow,
    attempt: &PaymentAttemptRow,
) -> DomainEventRow {
    scope.build(
        EventType::PaymentSubmitted,
        json!({
            "instruction_id": instruction.id,
            "attempt_id": attempt.id,
            "rail": attempt.rail,
            "provider": attempt.provider,
            "provider_request_id": attempt.provider_request_id,
            "amount_minor": instruction.amount_minor,
        }),
    )
}

pub fn payment_accepted(
    scope: &EventScope,
    instruction: &PaymentInstructionRow,
) -> DomainEventRow {
    scope.build(
        EventType::PaymentAccepted,
        json!({
            "instruction_id": instruction.id,
            "amount_minor": instruction.amount_minor,
        }),
    )
}

pub fn payment_settled(
    scope: &EventScope,
    instruction: &PaymentInstructionRow,
    settlement_event_id: &str,
) -> DomainEventRow {
    scope.build(
        EventType::PaymentSettled,
        json!({
            "instruction_id": instruction.id,
            "settlement_event_id": settlement_event_id,
            "amount_minor": instruction.amount_minor,
        }),
    )
}

pub fn payment_returned(
    scope: &EventScope,
    instruction: &PaymentInstructionRow,
    return_code: Option<&str>,
) -> DomainEventRow {
    scope.build(
        EventType::PaymentReturned,
        json!({
            "instruction_id": instruction.id,
            "amount_minor": instruction.amount_minor,
            "return_code": return_code,
        }),
    )
}

pub fn payment_failed(
    scope: &EventScope,
    instruction: &PaymentInstructionRow,
    reason: &str,
) -> DomainEventRow {
    scope.build(
        EventType::PaymentFailed,
        json!({
            "instruction_id": instruction.id,
            "amount_minor": instruction.amount_minor,
            "reason": reason,
        }),
    )
}

pub fn liability_classified(scope: &EventScope, event: &LiabilityEventRow) -> DomainEventRow {
    scope.build(
        EventType::LiabilityClassified,
        json!({
            "liability_event_id": event.id,
            "source": event.source,
            "source_id": event.source_id,
            "return_code": event.return_code,
            "error_origin": event.error_origin,
            "liability_party": event.liability_party,
            "recovery_path": event.recovery_path,
            "loss_minor": event.loss_minor,
        }),
    )
}

pub fn settlement_unmatched(scope: &EventScope, event: &SettlementEventRow) -> DomainEventRow {
    scope.build(
        EventType::SettlementUnmatched,
        json!({
            "settlement_event_id": event.id,
            "bank_account_id": event.bank_account_id,
            "external_trace_id": event.external_trace_id,
            "rail": event.rail,
            "direction": event.direction,
            "amount_minor": event.amount_minor,
            "effective_date": event.effective_date,
        }),
    )
}

pub fn operational_alert(
    scope: &EventScope,
    message: &str,
    context: serde_json::Value,
) -> DomainEventRow {
    scope.build(
        EventType::OperationalAlert,
        json!({
            "message": message,
            "context": context,
        }),
    )
}

/// Service view over the `domain_event` and `event_subscription` tables.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn SubLedgerStore>,
}

impl EventLog {
    pub fn new(store: Arc<dyn SubLedgerStore>) -> Self {
        Self { store }
    }

    /// Appends if the event id is unseen; replay of an already appended
    /// event is reported through `is_new = false`.
    pub async fn append(&self, event: DomainEventRow) -> EventsResult<Inserted<DomainEventRow>> {
        Ok(self.store.append_domain_event(event).await?)
    }

    pub async fn query(
        &self,
        tenant: &TenantId,
        filter: &EventFilter,
    ) -> EventsResult<Vec<DomainEventRow>> {
        Ok(self.store.domain_events(Some(tenant), filter).await?)
    }

    /// Full-payload replay: events are self-contained, so replaying the
    /// stream alone reconstructs a projection.
    pub async fn replay(
        &self,
        tenant: &TenantId,
        filter: &EventFilter,
    ) -> EventsResult<Vec<DomainEventRow>> {
        self.query(tenant, filter).await
    }

    pub async fn register_subscriber(
        &self,
        subscription: EventSubscriptionRow,
    ) -> EventsResult<EventSubscriptionRow> {
        if subscription.name.trim().is_empty() {
            return Err(EventsError::Validation(
                "subscriber name must be provided".into(),
            ));
        }
        Ok(self.store.upsert_subscription(subscription).await?)
    }

    /// Next batch after the subscriber's acknowledged cursor, in monotonic
    /// `(timestamp, event_id)` order. Events delivered but not yet
    /// acknowledged are redelivered after a crash.
    pub async fn get_for_subscriber(
        &self,
        name: &str,
        limit: usize,
    ) -> EventsResult<Vec<DomainEventRow>> {
        Ok(self.store.events_for_subscriber(name, limit).await?)
    }

    pub async fn update_subscriber_position(
        &self,
        name: &str,
        event_id: &EventId,
        timestamp: DateTime<Utc>,
    ) -> EventsResult<()> {
        Ok(self
            .store
            .update_subscription_cursor(name, event_id, timestamp)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payrail_store::EventCategory;
    use payrail_store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn scope() -> EventScope {
        EventScope::new("tenant-1", "corr-1")
    }

    fn alert(scope: &EventScope, message: &str) -> DomainEventRow {
        operational_alert(scope, message, json!({}))
    }

    #[tokio::test]
    async fn append_deduplicates_by_event_id() {
        let log = EventLog::new(MemoryStore::shared());
        let event = alert(&scope(), "first");

        let first = log.append(event.clone()).await.expect("append");
        assert!(first.is_new);

        let replay = log.append(event).await.expect("replay");
        assert!(!replay.is_new);

        let events = log
            .query(&"tenant-1".to_string(), &EventFilter::default())
            .await
            .expect("query");
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn causation_chain_links_events() {
        let log = EventLog::new(MemoryStore::shared());
        let root_scope = scope();
        let root = alert(&root_scope, "root");
        log.append(root.clone()).await.expect("append root");

        let child = alert(&root_scope.caused_by(root.event_id.clone()), "child");
        assert_eq!(child.causation_id.as_deref(), Some(root.event_id.as_str()));
        assert_eq!(child.correlation_id, root.correlation_id);
        log.append(child).await.expect("append child");
    }

    #[tokio::test]
    async fn query_filters_by_category_and_correlation() {
        let log = EventLog::new(MemoryStore::shared());
        log.append(alert(&scope(), "one")).await.expect("append");
        log.append(alert(&EventScope::new("tenant-1", "corr-other"), "two"))
            .await
            .expect("append");

        let filter = EventFilter {
            categories: Some(vec![EventCategory::Operational]),
            correlation_id: Some("corr-1".into()),
            ..EventFilter::default()
        };
        let events = log
            .query(&"tenant-1".to_string(), &filter)
            .await
            .expect("query");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, "corr-1");
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_order_and_past_cursor_only() {
        let log = EventLog::new(MemoryStore::shared());
        log.register_subscriber(EventSubscriptionRow {
            name: "warehouse".into(),
            cursor_event_id: None,
            cursor_timestamp: None,
            type_filter: Some(vec![EventType::OperationalAlert]),
            category_filter: None,
            tenant_filter: Some("tenant-1".into()),
            active: true,
        })
        .await
        .expect("register");

        for message in ["a", "b", "c"] {
            log.append(alert(&scope(), message)).await.expect("append");
        }

        let first_batch = log.get_for_subscriber("warehouse", 2).await.expect("batch");
        assert_eq!(first_batch.len(), 2);
        assert!(first_batch[0].occurred_at <= first_batch[1].occurred_at);

        let last = first_batch.last().expect("non-empty");
        log.update_subscriber_position("warehouse", &last.event_id, last.occurred_at)
            .await
            .expect("ack");

        let second_batch = log.get_for_subscriber("warehouse", 2).await.expect("batch");
        assert_eq!(second_batch.len(), 1);
    }
}

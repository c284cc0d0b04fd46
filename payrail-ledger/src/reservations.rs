//! Reservations hold funds against an account without moving money; they
//! are the bridge between the commit gate and the pay gate.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use payrail_events::EventScope;
use payrail_events::reservation_consumed;
use payrail_events::reservation_created;
use payrail_events::reservation_released;
use payrail_store::AccountId;
use payrail_store::Inserted;
use payrail_store::ReservationId;
use payrail_store::ReservationRow;
use payrail_store::ReservationStatus;
use payrail_store::ReserveType;
use payrail_store::SubLedgerStore;
use payrail_store::TenantId;

use crate::LedgerEngine;
use crate::LedgerError;
use crate::LedgerResult;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateReservationRequest {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub reserve_type: ReserveType,
    pub amount_minor: i64,
    pub source_ref: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
}

#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn SubLedgerStore>,
    ledger: LedgerEngine,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn SubLedgerStore>) -> Self {
        let ledger = LedgerEngine::new(store.clone());
        Self { store, ledger }
    }

    /// Creates an active hold, all-or-nothing. Availability is recomputed
    /// under the per-account advisory lock so the manager never races a
    /// concurrent reservation or posting into overspend.
    pub async fn create(
        &self,
        request: CreateReservationRequest,
    ) -> LedgerResult<Inserted<ReservationRow>> {
        if request.amount_minor <= 0 {
            return Err(LedgerError::Validation(
                "reservation amount must be strictly positive".into(),
            ));
        }

        let lock_key = format!("account:{}:{}", request.tenant_id, request.account_id);
        let _guard = self.store.advisory_lock(&lock_key).await;

        let available = self
            .ledger
            .available(&request.tenant_id, &request.account_id)
            .await?;
        if available < request.amount_minor {
            return Err(LedgerError::InsufficientAvailable {
                account_id: request.account_id,
                requested_minor: request.amount_minor,
                available_minor: available,
            });
        }

        let row = ReservationRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            account_id: request.account_id.clone(),
            reserve_type: request.reserve_type,
            amount_minor: request.amount_minor,
            status: ReservationStatus::Active,
            source_ref: request.source_ref.clone(),
            created_at: Utc::now(),
            released_at: None,
        };
        let scope = EventScope {
            tenant_id: request.tenant_id,
            correlation_id: request.correlation_id,
            causation_id: request.causation_id,
        };
        let event = reservation_created(&scope, &row);
        Ok(self.store.insert_reservation(row, vec![event]).await?)
    }

    /// `active -> released`; fails once the reservation is terminal.
    pub async fn release(
        &self,
        tenant_id: &TenantId,
        id: &ReservationId,
        scope: &EventScope,
    ) -> LedgerResult<ReservationRow> {
        self.transition(tenant_id, id, ReservationStatus::Released, scope)
            .await
    }

    /// `active -> consumed`; fails once the reservation is terminal.
    pub async fn consume(
        &self,
        tenant_id: &TenantId,
        id: &ReservationId,
        scope: &EventScope,
    ) -> LedgerResult<ReservationRow> {
        self.transition(tenant_id, id, ReservationStatus::Consumed, scope)
            .await
    }

    async fn transition(
        &self,
        tenant_id: &TenantId,
        id: &ReservationId,
        to: ReservationStatus,
        scope: &EventScope,
    ) -> LedgerResult<ReservationRow> {
        let current = self
            .store
            .reservation(tenant_id, id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("reservation {id}")))?;
        let mut preview = current;
        preview.status = to;
        let event = match to {
            ReservationStatus::Released => reservation_released(scope, &preview),
            ReservationStatus::Consumed => reservation_consumed(scope, &preview),
            ReservationStatus::Active => {
                return Err(LedgerError::Validation(
                    "reservations cannot transition back to active".into(),
                ));
            }
        };
        Ok(self
            .store
            .transition_reservation(tenant_id, id, to, vec![event])
            .await?)
    }

    pub async fn active_sum(
        &self,
        tenant_id: &TenantId,
        account_id: &AccountId,
    ) -> LedgerResult<i64> {
        Ok(self
            .store
            .active_reservations(tenant_id, account_id)
            .await?
            .iter()
            .map(|reservation| reservation.amount_minor)
            .sum())
    }

    /// Active holds on the account minus those belonging to `source_ref`.
    /// The pay gate funds a batch partly out of its own hold.
    pub async fn active_sum_excluding(
        &self,
        tenant_id: &TenantId,
        account_id: &AccountId,
        source_ref: &str,
    ) -> LedgerResult<i64> {
        Ok(self
            .store
            .active_reservations(tenant_id, account_id)
            .await?
            .iter()
            .filter(|reservation| reservation.source_ref != source_ref)
            .map(|reservation| reservation.amount_minor)
            .sum())
    }

    pub async fn for_source(
        &self,
        tenant_id: &TenantId,
        source_ref: &str,
    ) -> LedgerResult<Vec<ReservationRow>> {
        Ok(self.store.reservations_by_source(tenant_id, source_ref).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpenAccountRequest;
    use crate::PostEntryRequest;
    use payrail_store::AccountType;
    use payrail_store::EntryType;
    use payrail_store::MemoryStore;
    use payrail_store::SourceType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TENANT: &str = "tenant-1";

    async fn funded_account(amount_minor: i64) -> (ReservationManager, AccountId) {
        let store = MemoryStore::shared();
        let ledger = LedgerEngine::new(store.clone());
        let funding = ledger
            .open_account(OpenAccountRequest {
                tenant_id: TENANT.into(),
                legal_entity_id: "le-1".into(),
                account_type: AccountType::ClientFundingClearing,
                currency: "USD".into(),
            })
            .await
            .expect("account")
            .record;
        let clearing = ledger
            .open_account(OpenAccountRequest {
                tenant_id: TENANT.into(),
                legal_entity_id: "le-1".into(),
                account_type: AccountType::PspSettlementClearing,
                currency: "USD".into(),
            })
            .await
            .expect("account")
            .record;
        ledger
            .post_entry(PostEntryRequest {
                tenant_id: TENANT.into(),
                legal_entity_id: "le-1".into(),
                debit_account_id: clearing.id,
                credit_account_id: funding.id.clone(),
                amount_minor,
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
            .expect("funding");
        (ReservationManager::new(store), funding.id)
    }

    fn create(account: &AccountId, amount_minor: i64, source: &str) -> CreateReservationRequest {
        CreateReservationRequest {
            tenant_id: TENANT.into(),
            account_id: account.clone(),
            reserve_type: ReserveType::NetPay,
            amount_minor,
            source_ref: source.into(),
            correlation_id: "corr-1".into(),
            causation_id: None,
        }
    }

    #[tokio::test]
    async fn reservation_respects_available_balance() {
        let (manager, account) = funded_account(1_500_000).await;
        let tenant = TENANT.to_string();

        manager
            .create(create(&account, 1_260_000, "batch-1"))
            .await
            .expect("first hold fits");

        let err = manager
            .create(create(&account, 300_000, "batch-2"))
            .await
            .expect_err("second hold exceeds availability");
        match err {
            LedgerError::InsufficientAvailable {
                available_minor, ..
            } => assert_eq!(available_minor, 240_000),
            other => panic!("unexpected error {other:?}"),
        }

        assert_eq!(
            manager
                .active_sum(&tenant, &account)
                .await
                .expect("active sum"),
            1_260_000
        );
    }

    #[tokio::test]
    async fn lifecycle_is_one_way() {
        let (manager, account) = funded_account(500_000).await;
        let tenant = TENANT.to_string();
        let scope = EventScope::new(TENANT, "corr-1");

        let reservation = manager
            .create(create(&account, 200_000, "batch-1"))
            .await
            .expect("create")
            .record;

        let released = manager
            .release(&tenant, &reservation.id, &scope)
            .await
            .expect("release");
        assert_eq!(released.status, ReservationStatus::Released);

        let err = manager
            .consume(&tenant, &reservation.id, &scope)
            .await
            .expect_err("released reservations cannot be consumed");
        assert!(matches!(
            err,
            LedgerError::Store(payrail_store::StoreError::Transition { .. })
        ));

        assert_eq!(
            manager
                .active_sum(&tenant, &account)
                .await
                .expect("active sum"),
            0
        );
    }

    #[tokio::test]
    async fn excluding_own_batch_frees_its_hold() {
        let (manager, account) = funded_account(1_500_000).await;
        let tenant = TENANT.to_string();

        manager
            .create(create(&account, 1_260_000, "batch-1"))
            .await
            .expect("hold");

        assert_eq!(
            manager
                .active_sum_excluding(&tenant, &account, "batch-1")
                .await
                .expect("sum"),
            0
        );
        assert_eq!(
            manager
                .active_sum_excluding(&tenant, &account, "batch-other")
                .await
                .expect("sum"),
            1_260_000
        );
    }
}

#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Append-only double-entry ledger engine: balanced postings, idempotent
//! writes, reversals and point-in-time balances.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use payrail_events::EventScope;
use payrail_events::ledger_entry_posted;
use payrail_events::ledger_entry_reversed;
use payrail_store::AccountId;
use payrail_store::AccountStatus;
use payrail_store::AccountType;
use payrail_store::EntryId;
use payrail_store::EntryType;
use payrail_store::EventId;
use payrail_store::Inserted;
use payrail_store::LedgerAccountRow;
use payrail_store::LedgerEntryRow;
use payrail_store::LegalEntityId;
use payrail_store::SourceType;
use payrail_store::StoreError;
use payrail_store::SubLedgerStore;
use payrail_store::TenantId;
use payrail_store::fingerprint;

mod reservations;

pub use reservations::CreateReservationRequest;
pub use reservations::ReservationManager;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("ledger entry {0} is already reversed")]
    AlreadyReversed(EntryId),
    #[error(
        "insufficient available funds on {account_id}: requested {requested_minor}, available {available_minor}"
    )]
    InsufficientAvailable {
        account_id: AccountId,
        requested_minor: i64,
        available_minor: i64,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAccountRequest {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub account_type: AccountType,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostEntryRequest {
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub debit_account_id: AccountId,
    pub credit_account_id: AccountId,
    pub amount_minor: i64,
    pub currency: String,
    pub entry_type: EntryType,
    pub source_type: SourceType,
    pub source_id: String,
    pub correlation_id: String,
    pub causation_id: Option<EventId>,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
}

impl PostEntryRequest {
    fn fingerprint(&self) -> String {
        fingerprint([
            self.debit_account_id.clone(),
            self.credit_account_id.clone(),
            self.amount_minor.to_string(),
            self.currency.clone(),
            self.source_id.clone(),
        ])
    }

    fn scope(&self) -> EventScope {
        EventScope {
            tenant_id: self.tenant_id.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReverseEntryRequest {
    pub tenant_id: TenantId,
    pub original_entry_id: EntryId,
    pub reason: String,
    pub correlation_id: String,
    pub causation_id: Option<EventId>,
    pub idempotency_key: String,
}

/// A posting result: the persisted (or replayed) entry and whether this
/// call created it.
pub type Posting = Inserted<LedgerEntryRow>;

#[derive(Clone)]
pub struct LedgerEngine {
    store: Arc<dyn SubLedgerStore>,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn SubLedgerStore>) -> Self {
        Self { store }
    }

    /// Find-or-create for the `(tenant, legal_entity, type, currency)`
    /// bucket. Accounts are never deleted, only closed.
    pub async fn open_account(
        &self,
        request: OpenAccountRequest,
    ) -> LedgerResult<Inserted<LedgerAccountRow>> {
        let row = LedgerAccountRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id,
            legal_entity_id: request.legal_entity_id,
            account_type: request.account_type,
            currency: request.currency,
            status: AccountStatus::Active,
            opened_at: Utc::now(),
            closed_at: None,
        };
        Ok(self.store.insert_account(row).await?)
    }

    /// Opens the full chart for a legal entity and returns it in
    /// `AccountType::ALL` order.
    pub async fn seed_chart(
        &self,
        tenant_id: &TenantId,
        legal_entity_id: &LegalEntityId,
        currency: &str,
    ) -> LedgerResult<Vec<LedgerAccountRow>> {
        let mut accounts = Vec::with_capacity(AccountType::ALL.len());
        for account_type in AccountType::ALL {
            let opened = self
                .open_account(OpenAccountRequest {
                    tenant_id: tenant_id.clone(),
                    legal_entity_id: legal_entity_id.clone(),
                    account_type,
                    currency: currency.to_string(),
                })
                .await?;
            accounts.push(opened.record);
        }
        Ok(accounts)
    }

    pub async fn account(
        &self,
        tenant_id: &TenantId,
        legal_entity_id: &LegalEntityId,
        account_type: AccountType,
        currency: &str,
    ) -> LedgerResult<LedgerAccountRow> {
        self.store
            .find_account(tenant_id, legal_entity_id, account_type, currency)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!(
                    "ledger account {account_type:?}/{currency} for {legal_entity_id}"
                ))
            })
    }

    /// Posts one balanced double-entry record. Idempotent on
    /// `(tenant, idempotency_key)`; `LedgerEntryPosted` is appended with
    /// the write and only when the entry is new.
    pub async fn post_entry(&self, request: PostEntryRequest) -> LedgerResult<Posting> {
        if request.debit_account_id == request.credit_account_id {
            return Err(LedgerError::Validation(
                "debit and credit accounts must differ".into(),
            ));
        }
        if request.amount_minor <= 0 {
            return Err(LedgerError::Validation(
                "posting amount must be strictly positive".into(),
            ));
        }

        let _guards = self
            .lock_accounts(
                &request.tenant_id,
                &request.debit_account_id,
                &request.credit_account_id,
            )
            .await;

        let row = LedgerEntryRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            legal_entity_id: request.legal_entity_id.clone(),
            debit_account_id: request.debit_account_id.clone(),
            credit_account_id: request.credit_account_id.clone(),
            amount_minor: request.amount_minor,
            currency: request.currency.clone(),
            entry_type: request.entry_type,
            source_type: request.source_type,
            source_id: request.source_id.clone(),
            correlation_id: request.correlation_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            request_fingerprint: request.fingerprint(),
            metadata: request.metadata.clone(),
            posted_at: Utc::now(),
            reversed_by: None,
            is_reversal: false,
        };
        let event = ledger_entry_posted(&request.scope(), &row);
        let posted = self.store.insert_ledger_entry(row, vec![event]).await?;
        if posted.is_new {
            tracing::debug!(
                entry_id = %posted.record.id,
                amount_minor = posted.record.amount_minor,
                "posted ledger entry"
            );
        }
        Ok(posted)
    }

    /// Reverses a prior entry by posting a new one with the legs swapped.
    /// Fails with `AlreadyReversed` when the original is already
    /// pointed-to; retrying with the same idempotency key is benign.
    pub async fn reverse_entry(&self, request: ReverseEntryRequest) -> LedgerResult<Posting> {
        if let Some(existing) = self
            .store
            .ledger_entry_by_key(&request.tenant_id, &request.idempotency_key)
            .await?
        {
            return Ok(Inserted::existing(existing));
        }

        let original = self
            .store
            .ledger_entry(&request.tenant_id, &request.original_entry_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("ledger entry {}", request.original_entry_id))
            })?;

        let _guards = self
            .lock_accounts(
                &request.tenant_id,
                &original.debit_account_id,
                &original.credit_account_id,
            )
            .await;

        // Re-read under the lock; a concurrent reversal may have won.
        let original = self
            .store
            .ledger_entry(&request.tenant_id, &request.original_entry_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("ledger entry {}", request.original_entry_id))
            })?;
        if original.reversed_by.is_some() {
            return Err(LedgerError::AlreadyReversed(original.id));
        }

        let reversal = LedgerEntryRow {
            id: Uuid::new_v4().to_string(),
            tenant_id: original.tenant_id.clone(),
            legal_entity_id: original.legal_entity_id.clone(),
            debit_account_id: original.credit_account_id.clone(),
            credit_account_id: original.debit_account_id.clone(),
            amount_minor: original.amount_minor,
            currency: original.currency.clone(),
            entry_type: EntryType::Reversal,
            source_type: original.source_type,
            source_id: original.source_id.clone(),
            correlation_id: request.correlation_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            request_fingerprint: fingerprint([
                original.id.clone(),
                original.amount_minor.to_string(),
            ]),
            metadata: serde_json::json!({ "reason": request.reason }),
            posted_at: Utc::now(),
            reversed_by: None,
            is_reversal: true,
        };
        let scope = EventScope {
            tenant_id: request.tenant_id.clone(),
            correlation_id: request.correlation_id.clone(),
            causation_id: request.causation_id.clone(),
        };
        let event = ledger_entry_reversed(&scope, &original.id, &reversal);
        Ok(self
            .store
            .link_reversal(&request.tenant_id, &original.id, reversal, vec![event])
            .await?)
    }

    /// `Σ credits − Σ debits` over entries posted at or before `as_of`.
    /// Lock-free snapshot read.
    pub async fn balance(
        &self,
        tenant_id: &TenantId,
        account_id: &AccountId,
        as_of: Option<DateTime<Utc>>,
    ) -> LedgerResult<i64> {
        let entries = self
            .store
            .entries_touching_account(tenant_id, account_id, as_of)
            .await?;
        Ok(entries.iter().fold(0_i64, |acc, entry| {
            if entry.credit_account_id == *account_id {
                acc + entry.amount_minor
            } else {
                acc - entry.amount_minor
            }
        }))
    }

    /// Balance minus the sum of active reservations on the account.
    pub async fn available(
        &self,
        tenant_id: &TenantId,
        account_id: &AccountId,
    ) -> LedgerResult<i64> {
        let balance = self.balance(tenant_id, account_id, None).await?;
        let reserved: i64 = self
            .store
            .active_reservations(tenant_id, account_id)
            .await?
            .iter()
            .map(|reservation| reservation.amount_minor)
            .sum();
        Ok(balance - reserved)
    }

    pub(crate) fn store(&self) -> Arc<dyn SubLedgerStore> {
        self.store.clone()
    }

    /// Per-account advisory locks in sorted key order so concurrent
    /// postings over overlapping accounts cannot deadlock.
    async fn lock_accounts(
        &self,
        tenant_id: &TenantId,
        first: &AccountId,
        second: &AccountId,
    ) -> Vec<tokio::sync::OwnedMutexGuard<()>> {
        let mut keys = vec![
            format!("account:{tenant_id}:{first}"),
            format!("account:{tenant_id}:{second}"),
        ];
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.store.advisory_lock(&key).await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payrail_store::EventFilter;
    use payrail_store::EventType;
    use payrail_store::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TENANT: &str = "tenant-1";
    const ENTITY: &str = "le-1";

    async fn engine_with_chart() -> (LedgerEngine, Vec<LedgerAccountRow>) {
        let store = MemoryStore::shared();
        let engine = LedgerEngine::new(store);
        let chart = engine
            .seed_chart(&TENANT.to_string(), &ENTITY.to_string(), "USD")
            .await
            .expect("seed chart");
        (engine, chart)
    }

    fn post_request(
        debit: &LedgerAccountRow,
        credit: &LedgerAccountRow,
        amount_minor: i64,
        key: &str,
    ) -> PostEntryRequest {
        PostEntryRequest {
            tenant_id: TENANT.into(),
            legal_entity_id: ENTITY.into(),
            debit_account_id: debit.id.clone(),
            credit_account_id: credit.id.clone(),
            amount_minor,
            currency: "USD".into(),
            entry_type: EntryType::FundingSettlement,
            source_type: SourceType::Manual,
            source_id: "src-1".into(),
            correlation_id: "corr-1".into(),
            causation_id: None,
            idempotency_key: key.into(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn balance_is_credits_minus_debits() {
        let (engine, chart) = engine_with_chart().await;
        let clearing = &chart[4]; // psp_settlement_clearing
        let funding = &chart[0]; // client_funding_clearing
        let tenant = TENANT.to_string();

        engine
            .post_entry(post_request(clearing, funding, 1_500_000, "k-1"))
            .await
            .expect("post");
        engine
            .post_entry(post_request(funding, clearing, 420_000, "k-2"))
            .await
            .expect("post");

        assert_eq!(
            engine
                .balance(&tenant, &funding.id, None)
                .await
                .expect("balance"),
            1_080_000
        );
        assert_eq!(
            engine
                .balance(&tenant, &clearing.id, None)
                .await
                .expect("balance"),
            -1_080_000
        );
    }

    #[tokio::test]
    async fn post_entry_is_idempotent_and_emits_once() {
        let (engine, chart) = engine_with_chart().await;
        let request = post_request(&chart[4], &chart[0], 500_000, "k-1");

        let first = engine.post_entry(request.clone()).await.expect("post");
        let second = engine.post_entry(request.clone()).await.expect("replay");
        let third = engine.post_entry(request).await.expect("replay");

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(second.record.id, third.record.id);

        let events = engine
            .store()
            .domain_events(
                Some(&TENANT.to_string()),
                &EventFilter {
                    types: Some(vec![EventType::LedgerEntryPosted]),
                    ..EventFilter::default()
                },
            )
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn reversal_swaps_legs_and_restores_balance() {
        let (engine, chart) = engine_with_chart().await;
        let funding = &chart[0];
        let clearing = &chart[4];
        let tenant = TENANT.to_string();

        engine
            .post_entry(post_request(clearing, funding, 1_500_000, "k-fund"))
            .await
            .expect("post");
        let payout = engine
            .post_entry(post_request(funding, clearing, 420_000, "k-pay"))
            .await
            .expect("post")
            .record;

        let reversal = engine
            .reverse_entry(ReverseEntryRequest {
                tenant_id: tenant.clone(),
                original_entry_id: payout.id.clone(),
                reason: "R01 return".into(),
                correlation_id: "corr-1".into(),
                causation_id: None,
                idempotency_key: "k-rev".into(),
            })
            .await
            .expect("reverse")
            .record;

        assert_eq!(reversal.debit_account_id, payout.credit_account_id);
        assert_eq!(reversal.credit_account_id, payout.debit_account_id);
        assert_eq!(reversal.amount_minor, payout.amount_minor);
        assert!(reversal.is_reversal);
        assert_eq!(
            engine
                .balance(&tenant, &funding.id, None)
                .await
                .expect("balance"),
            1_500_000
        );
    }

    #[tokio::test]
    async fn double_reversal_fails_with_already_reversed() {
        let (engine, chart) = engine_with_chart().await;
        let entry = engine
            .post_entry(post_request(&chart[0], &chart[4], 100_000, "k-1"))
            .await
            .expect("post")
            .record;

        let reverse = |key: &str| ReverseEntryRequest {
            tenant_id: TENANT.into(),
            original_entry_id: entry.id.clone(),
            reason: "return".into(),
            correlation_id: "corr-1".into(),
            causation_id: None,
            idempotency_key: key.into(),
        };

        let first = engine.reverse_entry(reverse("k-rev-1")).await.expect("reverse");
        assert!(first.is_new);

        // Same key replays; a different key is a genuine double reversal.
        let replay = engine.reverse_entry(reverse("k-rev-1")).await.expect("replay");
        assert!(!replay.is_new);
        assert_eq!(replay.record.id, first.record.id);

        let err = engine
            .reverse_entry(reverse("k-rev-2"))
            .await
            .expect_err("double reversal");
        assert!(matches!(err, LedgerError::AlreadyReversed(_)));
    }

    #[tokio::test]
    async fn as_of_balance_ignores_later_entries() {
        let (engine, chart) = engine_with_chart().await;
        let funding = &chart[0];
        let clearing = &chart[4];
        let tenant = TENANT.to_string();

        engine
            .post_entry(post_request(clearing, funding, 800_000, "k-1"))
            .await
            .expect("post");
        let cutoff = Utc::now();
        engine
            .post_entry(post_request(funding, clearing, 300_000, "k-2"))
            .await
            .expect("post");

        assert_eq!(
            engine
                .balance(&tenant, &funding.id, Some(cutoff))
                .await
                .expect("balance"),
            800_000
        );
        assert_eq!(
            engine
                .balance(&tenant, &funding.id, None)
                .await
                .expect("balance"),
            500_000
        );
    }
}

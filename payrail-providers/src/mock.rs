//! Scripted in-memory provider for orchestrator and facade tests.

use std::collections::HashMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono::NaiveTime;
use tokio::sync::Mutex;

use payrail_store::AttemptStatus;
use payrail_store::Rail;
use payrail_store::SettlementStatus;

use crate::ProviderError;
use crate::RailCapabilities;
use crate::RailProvider;
use crate::SettlementRecord;
use crate::SubmitAck;
use crate::SubmitRequest;
use crate::parse_signed_webhook;

pub struct MockRailProvider {
    name: String,
    secret: String,
    capabilities: RailCapabilities,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sequence: u64,
    /// Scripted outcomes consumed before the default accept behavior.
    scripted: VecDeque<ProviderError>,
    acks_by_key: HashMap<String, SubmitAck>,
    statuses: HashMap<String, SettlementStatus>,
    submissions: Vec<SubmitRequest>,
    canceled: Vec<String>,
    feed: Vec<SettlementRecord>,
}

impl MockRailProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: "mock-secret".into(),
            capabilities: RailCapabilities {
                supported_rails: vec![Rail::Ach, Rail::Wire, Rail::Rtp, Rail::FedNow],
                cutoff: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
                max_per_txn_minor: 100_000_000,
                settlement_days: 1,
                cost_minor_per_txn: 25,
                recent_success_rate: 0.99,
                return_codes: vec!["R01".into(), "R02".into(), "R03".into()],
                supports_cancel: true,
                supports_batch: true,
            },
            inner: Mutex::new(Inner::default()),
        }
    }

    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    #[must_use]
    pub fn with_rails(mut self, rails: Vec<Rail>) -> Self {
        self.capabilities.supported_rails = rails;
        self
    }

    #[must_use]
    pub fn with_max_per_txn(mut self, max_minor: i64) -> Self {
        self.capabilities.max_per_txn_minor = max_minor;
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost_minor: i64) -> Self {
        self.capabilities.cost_minor_per_txn = cost_minor;
        self
    }

    #[must_use]
    pub fn with_settlement_days(mut self, days: u8) -> Self {
        self.capabilities.settlement_days = days;
        self
    }

    #[must_use]
    pub fn with_success_rate(mut self, rate: f32) -> Self {
        self.capabilities.recent_success_rate = rate;
        self
    }

    #[must_use]
    pub fn without_cancel(mut self) -> Self {
        self.capabilities.supports_cancel = false;
        self
    }

    /// Queue an error for the next `submit` call; the call after the queue
    /// drains succeeds.
    pub async fn script_submit_error(&self, error: ProviderError) {
        let mut inner = self.inner.lock().await;
        inner.scripted.push_back(error);
    }

    pub async fn seed_feed(&self, records: Vec<SettlementRecord>) {
        let mut inner = self.inner.lock().await;
        inner.feed.extend(records);
    }

    pub async fn submissions(&self) -> Vec<SubmitRequest> {
        let inner = self.inner.lock().await;
        inner.submissions.clone()
    }

    pub async fn canceled(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.canceled.clone()
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

#[async_trait]
impl RailProvider for MockRailProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> RailCapabilities {
        self.capabilities.clone()
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitAck, ProviderError> {
        if !self.capabilities.supported_rails.contains(&request.rail) {
            return Err(ProviderError::UnsupportedRail {
                provider: self.name.clone(),
                rail: request.rail,
            });
        }
        let mut inner = self.inner.lock().await;
        if let Some(error) = inner.scripted.pop_front() {
            return Err(error);
        }
        if let Some(ack) = inner.acks_by_key.get(&request.idempotency_key) {
            return Ok(ack.clone());
        }
        inner.sequence += 1;
        let provider_request_id = format!("{}-req-{}", self.name, inner.sequence);
        let ack = SubmitAck {
            provider_request_id: provider_request_id.clone(),
            status: AttemptStatus::Submitted,
            retryable: None,
        };
        inner
            .acks_by_key
            .insert(request.idempotency_key.clone(), ack.clone());
        inner
            .statuses
            .insert(provider_request_id, SettlementStatus::Submitted);
        inner.submissions.push(request.clone());
        Ok(ack)
    }

    async fn get_status(
        &self,
        provider_request_id: &str,
    ) -> Result<SettlementStatus, ProviderError> {
        let inner = self.inner.lock().await;
        inner
            .statuses
            .get(provider_request_id)
            .copied()
            .ok_or_else(|| ProviderError::UnknownRequest {
                provider: self.name.clone(),
                provider_request_id: provider_request_id.to_string(),
            })
    }

    async fn cancel(&self, provider_request_id: &str) -> Result<bool, ProviderError> {
        if !self.capabilities.supports_cancel {
            return Err(ProviderError::CancelUnsupported {
                provider: self.name.clone(),
            });
        }
        let mut inner = self.inner.lock().await;
        if !inner.statuses.contains_key(provider_request_id) {
            return Ok(false);
        }
        inner
            .statuses
            .insert(provider_request_id.to_string(), SettlementStatus::Canceled);
        inner.canceled.push(provider_request_id.to_string());
        Ok(true)
    }

    async fn reconcile(&self, date: NaiveDate) -> Result<Vec<SettlementRecord>, ProviderError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .feed
            .iter()
            .filter(|record| record.effective_date <= date)
            .cloned()
            .collect())
    }

    fn parse_webhook(
        &self,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<SettlementRecord, ProviderError> {
        parse_signed_webhook(&self.name, &self.secret, body, headers)
    }
}

#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Uniform abstraction over payment rails. The orchestrator and the
//! reconciler depend only on the capability set here, never on a concrete
//! provider.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono::NaiveTime;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

use payrail_store::AttemptStatus;
use payrail_store::Direction;
use payrail_store::PayeeType;
use payrail_store::Rail;
use payrail_store::SettlementStatus;

mod feed;
mod mock;

pub use feed::CsvSettlementFeedParser;
pub use feed::FeedParserProfile;
pub use mock::MockRailProvider;

pub const SIGNATURE_HEADER: &str = "x-payrail-signature";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error talking to {provider}: {detail}")]
    Network { provider: String, detail: String },
    #[error("{provider} rate limited the request")]
    RateLimited { provider: String },
    #[error("{provider} is unavailable: {detail}")]
    Unavailable { provider: String, detail: String },
    #[error("payment rejected by {provider}: {detail}")]
    Rejected { provider: String, detail: String },
    #[error("invalid account: {detail}")]
    InvalidAccount { detail: String },
    #[error("unauthorized: {detail}")]
    Unauthorized { detail: String },
    #[error("{provider} does not support rail {rail:?}")]
    UnsupportedRail { provider: String, rail: Rail },
    #[error("{provider} has no record of request {provider_request_id}")]
    UnknownRequest {
        provider: String,
        provider_request_id: String,
    },
    #[error("{provider} does not support cancellation")]
    CancelUnsupported { provider: String },
    #[error("webhook signature verification failed")]
    Signature,
    #[error("failed to parse provider payload: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Transient failures the orchestrator may retry with backoff.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Network { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::Unavailable { .. }
        )
    }
}

/// Capability advertisement the orchestrator selects providers by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailCapabilities {
    pub supported_rails: Vec<Rail>,
    pub cutoff: NaiveTime,
    pub max_per_txn_minor: i64,
    pub settlement_days: u8,
    pub cost_minor_per_txn: i64,
    /// Rolling success ratio the provider reports for itself; a
    /// tie-break input, never a gate.
    pub recent_success_rate: f32,
    pub return_codes: Vec<String>,
    pub supports_cancel: bool,
    pub supports_batch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub tenant_id: String,
    pub instruction_id: String,
    pub idempotency_key: String,
    pub rail: Rail,
    pub direction: Direction,
    pub amount_minor: i64,
    pub currency: String,
    pub payee_type: PayeeType,
    pub payee_ref: String,
    pub settlement_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub provider_request_id: String,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

/// A normalized external settlement record, before it becomes a stored
/// settlement event. Bank/processor truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub bank_account_id: String,
    pub rail: Rail,
    pub direction: Direction,
    pub amount_minor: i64,
    pub currency: String,
    pub status: SettlementStatus,
    pub external_trace_id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payee_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_reason: Option<String>,
    pub effective_date: NaiveDate,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

/// Operation set every rail provider implements. `submit` must itself be
/// idempotent per instruction idempotency key.
#[async_trait]
pub trait RailProvider: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> RailCapabilities;
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitAck, ProviderError>;
    async fn get_status(
        &self,
        provider_request_id: &str,
    ) -> Result<SettlementStatus, ProviderError>;
    async fn cancel(&self, provider_request_id: &str) -> Result<bool, ProviderError>;
    /// Pull feed of settlement truth for a date.
    async fn reconcile(&self, date: NaiveDate) -> Result<Vec<SettlementRecord>, ProviderError>;
    /// Push feed. Signature failure is `ProviderError::Signature` and the
    /// body is never parsed in that case.
    fn parse_webhook(
        &self,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<SettlementRecord, ProviderError>;
}

/// Pure mapping from provider-native status strings to the canonical
/// settlement status set.
pub fn canonical_status(native: &str) -> Option<SettlementStatus> {
    match native.trim().to_ascii_lowercase().as_str() {
        "created" | "pending" | "received" => Some(SettlementStatus::Pending),
        "submitted" | "sent" | "in_transit" => Some(SettlementStatus::Submitted),
        "accepted" | "acknowledged" | "processing" => Some(SettlementStatus::Accepted),
        "settled" | "completed" | "paid" => Some(SettlementStatus::Settled),
        "failed" | "error" => Some(SettlementStatus::Failed),
        "returned" => Some(SettlementStatus::Returned),
        "rejected" => Some(SettlementStatus::Rejected),
        "canceled" | "cancelled" => Some(SettlementStatus::Canceled),
        "reversed" => Some(SettlementStatus::Reversed),
        _ => None,
    }
}

pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Deserialize)]
struct WebhookSettlement {
    bank_account_id: String,
    rail: Rail,
    direction: Direction,
    amount_minor: i64,
    currency: String,
    status: String,
    external_trace_id: String,
    #[serde(default)]
    provider_request_id: Option<String>,
    #[serde(default)]
    payee_ref: Option<String>,
    #[serde(default)]
    return_code: Option<String>,
    #[serde(default)]
    return_reason: Option<String>,
    effective_date: NaiveDate,
}

/// Verifies the webhook signature, then parses the body into a settlement
/// record. Verification failure short-circuits before any parsing.
pub fn parse_signed_webhook(
    provider: &str,
    secret: &str,
    body: &[u8],
    headers: &HashMap<String, String>,
) -> Result<SettlementRecord, ProviderError> {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .ok_or(ProviderError::Signature)?;
    if compute_signature(secret, body) != provided.trim() {
        return Err(ProviderError::Signature);
    }

    let raw: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| ProviderError::Parse(format!("invalid webhook json: {err}")))?;
    let payload: WebhookSettlement = serde_json::from_value(raw.clone())
        .map_err(|err| ProviderError::Parse(format!("invalid webhook payload: {err}")))?;
    let status = canonical_status(&payload.status).ok_or_else(|| {
        ProviderError::Parse(format!("unknown provider status {}", payload.status))
    })?;

    Ok(SettlementRecord {
        bank_account_id: payload.bank_account_id,
        rail: payload.rail,
        direction: payload.direction,
        amount_minor: payload.amount_minor,
        currency: payload.currency,
        status,
        external_trace_id: payload.external_trace_id,
        provider: provider.to_string(),
        provider_request_id: payload.provider_request_id,
        payee_ref: payload.payee_ref,
        return_code: payload.return_code,
        return_reason: payload.return_reason,
        effective_date: payload.effective_date,
        raw_payload: raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn webhook_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "bank_account_id": "ba-1",
            "rail": "ach",
            "direction": "outbound",
            "amount_minor": 420_000,
            "currency": "USD",
            "status": "settled",
            "external_trace_id": "trace-bob",
            "provider_request_id": "req-7",
            "payee_ref": "emp-bob",
            "effective_date": "2026-07-31",
        }))
        .expect("serialize")
    }

    #[test]
    fn canonical_status_maps_the_closed_set() {
        assert_eq!(canonical_status("Completed"), Some(SettlementStatus::Settled));
        assert_eq!(canonical_status("in_transit"), Some(SettlementStatus::Submitted));
        assert_eq!(canonical_status("RETURNED"), Some(SettlementStatus::Returned));
        assert_eq!(canonical_status("mystery"), None);
    }

    #[test]
    fn webhook_with_valid_signature_parses() {
        let body = webhook_body();
        let mut headers = HashMap::new();
        headers.insert(
            SIGNATURE_HEADER.to_string(),
            compute_signature("shh", &body),
        );

        let record = parse_signed_webhook("mock-ach", "shh", &body, &headers).expect("parse");
        assert_eq!(record.status, SettlementStatus::Settled);
        assert_eq!(record.external_trace_id, "trace-bob");
        assert_eq!(record.provider, "mock-ach");
        assert_eq!(record.amount_minor, 420_000);
    }

    #[test]
    fn bad_signature_is_a_security_error_not_a_parse_error() {
        let body = webhook_body();
        let mut headers = HashMap::new();
        headers.insert(SIGNATURE_HEADER.to_string(), "deadbeef".to_string());

        let err = parse_signed_webhook("mock-ach", "shh", &body, &headers)
            .expect_err("must reject");
        assert!(matches!(err, ProviderError::Signature));

        // Even a garbage body fails on the signature first.
        let err = parse_signed_webhook("mock-ach", "shh", b"not json", &headers)
            .expect_err("must reject");
        assert!(matches!(err, ProviderError::Signature));
    }

    #[test]
    fn missing_signature_header_is_rejected() {
        let err = parse_signed_webhook("mock-ach", "shh", &webhook_body(), &HashMap::new())
            .expect_err("must reject");
        assert!(matches!(err, ProviderError::Signature));
    }

    #[test]
    fn retryable_split_matches_the_error_taxonomy() {
        assert!(
            ProviderError::Network {
                provider: "p".into(),
                detail: "timeout".into()
            }
            .retryable()
        );
        assert!(ProviderError::RateLimited { provider: "p".into() }.retryable());
        assert!(
            !ProviderError::InvalidAccount {
                detail: "no such account".into()
            }
            .retryable()
        );
        assert!(!ProviderError::Signature.retryable());
    }
}

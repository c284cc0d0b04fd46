//! Profile-driven CSV parsing for provider pull feeds. Column names and
//! formats vary per provider; a profile maps them onto the normalized
//! settlement record.

use chrono::NaiveDate;
use csv::StringRecord;
use serde::Deserialize;

use payrail_store::Direction;
use payrail_store::Rail;

use crate::ProviderError;
use crate::SettlementRecord;
use crate::canonical_status;

fn default_date_format() -> String {
    "%Y-%m-%d".into()
}

fn default_amount_factor() -> i64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedParserProfile {
    pub external_trace_id: String,
    pub bank_account_id: String,
    pub rail: String,
    pub direction: String,
    pub amount: String,
    pub currency: String,
    pub status: String,
    pub effective_date: String,
    #[serde(default)]
    pub provider_request_id: Option<String>,
    #[serde(default)]
    pub payee_ref: Option<String>,
    #[serde(default)]
    pub return_code: Option<String>,
    #[serde(default)]
    pub return_reason: Option<String>,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_amount_factor")]
    pub amount_minor_factor: i64,
}

impl Default for FeedParserProfile {
    fn default() -> Self {
        Self {
            external_trace_id: "trace_id".into(),
            bank_account_id: "bank_account".into(),
            rail: "rail".into(),
            direction: "direction".into(),
            amount: "amount".into(),
            currency: "currency".into(),
            status: "status".into(),
            effective_date: "effective_date".into(),
            provider_request_id: Some("provider_request_id".into()),
            payee_ref: Some("payee_ref".into()),
            return_code: Some("return_code".into()),
            return_reason: Some("return_reason".into()),
            date_format: default_date_format(),
            amount_minor_factor: default_amount_factor(),
        }
    }
}

struct FeedIndexes {
    external_trace_id: usize,
    bank_account_id: usize,
    rail: usize,
    direction: usize,
    amount: usize,
    currency: usize,
    status: usize,
    effective_date: usize,
    provider_request_id: Option<usize>,
    payee_ref: Option<usize>,
    return_code: Option<usize>,
    return_reason: Option<usize>,
}

impl FeedParserProfile {
    fn indexes(&self, headers: &StringRecord) -> Result<FeedIndexes, ProviderError> {
        Ok(FeedIndexes {
            external_trace_id: find_index(headers, &self.external_trace_id)?,
            bank_account_id: find_index(headers, &self.bank_account_id)?,
            rail: find_index(headers, &self.rail)?,
            direction: find_index(headers, &self.direction)?,
            amount: find_index(headers, &self.amount)?,
            currency: find_index(headers, &self.currency)?,
            status: find_index(headers, &self.status)?,
            effective_date: find_index(headers, &self.effective_date)?,
            provider_request_id: optional_index(headers, self.provider_request_id.as_deref()),
            payee_ref: optional_index(headers, self.payee_ref.as_deref()),
            return_code: optional_index(headers, self.return_code.as_deref()),
            return_reason: optional_index(headers, self.return_reason.as_deref()),
        })
    }
}

fn find_index(headers: &StringRecord, column: &str) -> Result<usize, ProviderError> {
    headers
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(column))
        .ok_or_else(|| ProviderError::Parse(format!("feed is missing column {column}")))
}

fn optional_index(headers: &StringRecord, column: Option<&str>) -> Option<usize> {
    column.and_then(|name| {
        headers
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(name))
    })
}

fn parse_rail(value: &str) -> Result<Rail, ProviderError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "ach" => Ok(Rail::Ach),
        "wire" => Ok(Rail::Wire),
        "rtp" => Ok(Rail::Rtp),
        "fednow" | "fed_now" => Ok(Rail::FedNow),
        "check" => Ok(Rail::Check),
        other => Err(ProviderError::Parse(format!("unknown rail {other}"))),
    }
}

fn parse_direction(value: &str) -> Result<Direction, ProviderError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "inbound" | "credit" => Ok(Direction::Inbound),
        "outbound" | "debit" => Ok(Direction::Outbound),
        other => Err(ProviderError::Parse(format!("unknown direction {other}"))),
    }
}

/// Decimal amount in major units to minor units, without floats.
fn parse_amount_minor(value: &str, factor: i64) -> Result<i64, ProviderError> {
    let cleaned = value.trim().replace(',', "");
    if cleaned.is_empty() {
        return Err(ProviderError::Parse("amount cannot be empty".into()));
    }
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };
    let (integer, fraction) = match digits.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (digits, ""),
    };
    let integer: i64 = integer
        .parse()
        .map_err(|err| ProviderError::Parse(format!("invalid amount {value}: {err}")))?;
    let mut amount = integer
        .checked_mul(factor)
        .ok_or_else(|| ProviderError::Parse(format!("amount {value} overflows")))?;
    if !fraction.is_empty() {
        let scale = 10_i64.pow(fraction.len() as u32);
        let fraction: i64 = fraction
            .parse()
            .map_err(|err| ProviderError::Parse(format!("invalid amount {value}: {err}")))?;
        amount += (fraction * factor) / scale;
    }
    Ok(if negative { -amount } else { amount })
}

#[derive(Clone)]
pub struct CsvSettlementFeedParser {
    provider: String,
    profile: FeedParserProfile,
}

impl CsvSettlementFeedParser {
    pub fn new(provider: impl Into<String>, profile: FeedParserProfile) -> Self {
        Self {
            provider: provider.into(),
            profile,
        }
    }

    pub fn parse(&self, input: &str) -> Result<Vec<SettlementRecord>, ProviderError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(input.as_bytes());
        let headers = reader
            .headers()
            .map_err(|err| ProviderError::Parse(err.to_string()))?
            .clone();
        let indexes = self.profile.indexes(&headers)?;
        let mut records = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| ProviderError::Parse(err.to_string()))?;
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            records.push(self.build_record(&record, &indexes)?);
        }
        Ok(records)
    }

    fn build_record(
        &self,
        record: &StringRecord,
        indexes: &FeedIndexes,
    ) -> Result<SettlementRecord, ProviderError> {
        let required = |index: usize, what: &str| {
            record
                .get(index)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| ProviderError::Parse(format!("{what} missing")))
        };
        let optional = |index: Option<usize>| {
            index
                .and_then(|index| record.get(index))
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };

        let status_raw = required(indexes.status, "status")?;
        let status = canonical_status(&status_raw)
            .ok_or_else(|| ProviderError::Parse(format!("unknown provider status {status_raw}")))?;
        let date_raw = required(indexes.effective_date, "effective_date")?;
        let effective_date = NaiveDate::parse_from_str(&date_raw, &self.profile.date_format)
            .map_err(|err| ProviderError::Parse(format!("invalid date {date_raw}: {err}")))?;

        Ok(SettlementRecord {
            bank_account_id: required(indexes.bank_account_id, "bank_account")?,
            rail: parse_rail(&required(indexes.rail, "rail")?)?,
            direction: parse_direction(&required(indexes.direction, "direction")?)?,
            amount_minor: parse_amount_minor(
                &required(indexes.amount, "amount")?,
                self.profile.amount_minor_factor,
            )?,
            currency: required(indexes.currency, "currency")?.to_uppercase(),
            status,
            external_trace_id: required(indexes.external_trace_id, "trace_id")?,
            provider: self.provider.clone(),
            provider_request_id: optional(indexes.provider_request_id),
            payee_ref: optional(indexes.payee_ref),
            return_code: optional(indexes.return_code),
            return_reason: optional(indexes.return_reason),
            effective_date,
            raw_payload: serde_json::json!({
                "fields": record.iter().collect::<Vec<&str>>(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payrail_store::SettlementStatus;
    use pretty_assertions::assert_eq;

    const FEED: &str = "\
trace_id,bank_account,rail,direction,amount,currency,status,provider_request_id,payee_ref,return_code,return_reason,effective_date
trace-1,ba-1,ach,outbound,3500.00,usd,settled,req-1,emp-alice,,,2026-07-31
trace-2,ba-1,ach,outbound,4200.00,usd,returned,req-2,emp-bob,R01,Insufficient Funds,2026-07-31
trace-3,ba-1,fednow,outbound,2100.00,usd,completed,req-3,irs,,,2026-07-31
";

    #[test]
    fn parses_a_profiled_feed() {
        let parser = CsvSettlementFeedParser::new("mock-ach", FeedParserProfile::default());
        let records = parser.parse(FEED).expect("parse");

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].amount_minor, 350_000);
        assert_eq!(records[0].currency, "USD");
        assert_eq!(records[0].status, SettlementStatus::Settled);
        assert_eq!(records[1].return_code.as_deref(), Some("R01"));
        assert_eq!(records[1].status, SettlementStatus::Returned);
        assert_eq!(records[2].rail, Rail::FedNow);
        assert_eq!(records[2].status, SettlementStatus::Settled);
    }

    #[test]
    fn rejects_unknown_status() {
        let feed = "\
trace_id,bank_account,rail,direction,amount,currency,status,effective_date
trace-1,ba-1,ach,outbound,10.00,USD,exploded,2026-07-31
";
        let parser = CsvSettlementFeedParser::new("mock-ach", FeedParserProfile::default());
        let err = parser.parse(feed).expect_err("unknown status must fail");
        assert!(matches!(err, ProviderError::Parse(_)));
    }

    #[test]
    fn amount_parsing_avoids_floats() {
        assert_eq!(parse_amount_minor("3500.00", 100).expect("parse"), 350_000);
        assert_eq!(parse_amount_minor("0.01", 100).expect("parse"), 1);
        assert_eq!(parse_amount_minor("1,234.56", 100).expect("parse"), 123_456);
        assert_eq!(parse_amount_minor("-42", 100).expect("parse"), -4_200);
        assert!(parse_amount_minor("", 100).is_err());
    }
}

//! Lightweight operational counters for the embedding platform to scrape.
//! Counters are process-local; durable audit lives in the event log.

use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use payrail_settlement::IngestSummary;
use payrail_store::GateOutcome;
use payrail_store::GateType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryCounters {
    pub commit_gate_pass: usize,
    pub commit_gate_soft_fail: usize,
    pub commit_gate_hard_fail: usize,
    pub pay_gate_pass: usize,
    pub pay_gate_hard_fail: usize,
    pub funding_requests: usize,
    pub payments_submitted: usize,
    pub settlement_records_applied: usize,
    pub settlement_records_unmatched: usize,
    pub returns_classified: usize,
}

#[derive(Clone, Default)]
pub struct PspTelemetry {
    inner: Arc<Mutex<TelemetryCounters>>,
}

impl PspTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TelemetryCounters {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut TelemetryCounters)) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
    }

    pub fn record_gate(&self, gate: GateType, outcome: GateOutcome) {
        self.update(|counters| match (gate, outcome) {
            (GateType::Commit, GateOutcome::Pass) => counters.commit_gate_pass += 1,
            (GateType::Commit, GateOutcome::SoftFail) => counters.commit_gate_soft_fail += 1,
            (GateType::Commit, GateOutcome::HardFail) => counters.commit_gate_hard_fail += 1,
            (GateType::Pay, GateOutcome::HardFail) => counters.pay_gate_hard_fail += 1,
            (GateType::Pay, _) => counters.pay_gate_pass += 1,
        });
    }

    pub fn record_funding_request(&self) {
        self.update(|counters| counters.funding_requests += 1);
    }

    pub fn record_submissions(&self, count: usize) {
        self.update(|counters| counters.payments_submitted += count);
    }

    pub fn record_ingest(&self, summary: &IngestSummary) {
        self.update(|counters| {
            counters.settlement_records_applied += summary.applied;
            counters.settlement_records_unmatched += summary.unmatched;
            counters.returns_classified += summary.returns;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_accumulate() {
        let telemetry = PspTelemetry::new();
        telemetry.record_gate(GateType::Commit, GateOutcome::Pass);
        telemetry.record_gate(GateType::Pay, GateOutcome::HardFail);
        telemetry.record_submissions(4);
        telemetry.record_ingest(&IngestSummary {
            received: 4,
            applied: 4,
            duplicates: 0,
            unmatched: 1,
            returns: 1,
        });

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.commit_gate_pass, 1);
        assert_eq!(snapshot.pay_gate_hard_fail, 1);
        assert_eq!(snapshot.payments_submitted, 4);
        assert_eq!(snapshot.settlement_records_unmatched, 1);
        assert_eq!(snapshot.returns_classified, 1);
    }
}

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;

use delay_store::Merge;

use crate::wire::Verdict;

#[derive(Clone, Debug)]
pub(crate) struct GateMetrics {
    requests: Counter<u64>,
    delayed_by: Histogram<u64>,
    control_updates: Counter<u64>,
    evicted: Counter<u64>,
    store_errors: Counter<u64>,
    accounting_dropped: Counter<u64>,
}

impl GateMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("gatekeeper");
        Self {
            requests: meter.u64_counter("gatekeeper.requests").build(),
            delayed_by: meter
                .u64_histogram("gatekeeper.delayed_by_ms")
                .with_unit("ms")
                .build(),
            control_updates: meter.u64_counter("gatekeeper.control_updates").build(),
            evicted: meter.u64_counter("gatekeeper.evicted").build(),
            store_errors: meter.u64_counter("gatekeeper.store_errors").build(),
            accounting_dropped: meter.u64_counter("gatekeeper.accounting_dropped").build(),
        }
    }

    pub(crate) fn request(&self, domain: &str, verdict: Verdict, delayed_by: Option<u64>) {
        let attributes = [
            KeyValue::new("status", verdict.as_str()),
            KeyValue::new("domain", domain.to_string()),
        ];
        self.requests.add(1, &attributes);
        if let Some(ms) = delayed_by {
            self.delayed_by.record(ms, &attributes[1..]);
        }
    }

    /// `None` means the update never reached the store.
    pub(crate) fn control_update(&self, merge: Option<Merge>) {
        let outcome = match merge {
            Some(Merge::Inserted) => "inserted",
            Some(Merge::Raised { .. }) => "raised",
            Some(Merge::Unchanged { .. }) => "unchanged",
            None => "dropped",
        };
        self.control_updates
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub(crate) fn malformed_control(&self) {
        self.control_updates
            .add(1, &[KeyValue::new("outcome", "malformed")]);
    }

    pub(crate) fn store_error(&self) {
        self.store_errors.add(1, &[]);
    }

    pub(crate) fn evicted(&self, count: usize) {
        if count > 0 {
            self.evicted.add(count as u64, &[]);
        }
    }

    pub(crate) fn accounting_dropped(&self, reason: &'static str) {
        self.accounting_dropped
            .add(1, &[KeyValue::new("reason", reason)]);
    }
}

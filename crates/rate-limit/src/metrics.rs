//! Admission counters.

use std::time::Instant;

use opentelemetry::{
    Key, KeyValue, Value,
    metrics::{Counter, Histogram},
};

const METER_NAME: &str = "dispatcher";

/// Admission checks by decision.
pub(crate) const RATE_LIMIT_ADMISSIONS: &str = "rate_limit.admissions";
/// Latency of one store round trip in milliseconds.
pub(crate) const RATE_LIMIT_STORE_DURATION: &str = "rate_limit.store.duration";

/// How an admission check was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Allowed,
    Denied,
    /// No store or no policy for the bucket.
    Unlimited,
    /// The store failed and the check failed open.
    StoreError,
}

impl Decision {
    fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Unlimited => "unlimited",
            Self::StoreError => "store_error",
        }
    }
}

pub(crate) struct AdmissionMetrics {
    admissions: Counter<u64>,
    store_duration: Histogram<f64>,
}

impl AdmissionMetrics {
    pub(crate) fn new() -> Self {
        let meter = opentelemetry::global::meter(METER_NAME);

        Self {
            admissions: meter.u64_counter(RATE_LIMIT_ADMISSIONS).build(),
            store_duration: meter.f64_histogram(RATE_LIMIT_STORE_DURATION).with_unit("ms").build(),
        }
    }

    pub(crate) fn count(&self, key: &str, decision: Decision) {
        let attributes = [
            namespace_attribute(key),
            KeyValue::new(Key::from("rate_limit.decision"), Value::from(decision.as_str())),
        ];

        self.admissions.add(1, &attributes);
    }

    /// Records the store round trip that started at `start`.
    pub(crate) fn record_store(&self, key: &str, start: Instant) {
        let duration = start.elapsed().as_secs_f64() * 1000.0;
        self.store_duration.record(duration, &[namespace_attribute(key)]);
    }
}

fn namespace_attribute(key: &str) -> KeyValue {
    KeyValue::new(Key::from("rate_limit.namespace"), Value::from(namespace(key).to_string()))
}

/// The provider part of a bucket key, without the credential hash.
fn namespace(key: &str) -> &str {
    key.split_once(':').map(|(namespace, _)| namespace).unwrap_or("other")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_drops_the_credential_hash() {
        assert_eq!(namespace("groq:0123abcd"), "groq");
        assert_eq!(namespace("openrouter:default"), "openrouter");
        assert_eq!(namespace("plain"), "other");
    }

    #[test]
    fn decisions_have_stable_labels() {
        let labels: Vec<_> = [Decision::Allowed, Decision::Denied, Decision::Unlimited, Decision::StoreError]
            .into_iter()
            .map(Decision::as_str)
            .collect();

        assert_eq!(labels, vec!["allowed", "denied", "unlimited", "store_error"]);
    }
}

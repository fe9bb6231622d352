//! OpenTelemetry instruments of the dispatch loop.
//!
//! Instruments record into the global meter provider. Nothing is exported until
//! the embedding application installs one.

use std::time::Instant;

use opentelemetry::{
    Key, KeyValue, Value,
    metrics::{Counter, Histogram, Meter},
};

use crate::{error::FailureKind, messages::Usage, quality::Outcome};

const METER_NAME: &str = "dispatcher";

/// Duration of one upstream chat call in milliseconds.
pub(crate) const GEN_AI_CLIENT_OPERATION_DURATION: &str = "gen_ai.client.operation.duration";
/// Prompt tokens reported by successful calls.
pub(crate) const GEN_AI_CLIENT_INPUT_TOKEN_USAGE: &str = "gen_ai.client.input.token.usage";
/// Completion tokens reported by successful calls.
pub(crate) const GEN_AI_CLIENT_OUTPUT_TOKEN_USAGE: &str = "gen_ai.client.output.token.usage";
/// Total tokens reported by successful calls.
pub(crate) const GEN_AI_CLIENT_TOTAL_TOKEN_USAGE: &str = "gen_ai.client.total.token.usage";
/// Candidate attempts by outcome, including those that never reached upstream.
pub(crate) const DISPATCH_ATTEMPTS: &str = "dispatch.attempts";

fn meter() -> Meter {
    opentelemetry::global::meter(METER_NAME)
}

/// Times an operation into a histogram in milliseconds.
pub(crate) struct Recorder {
    start: Instant,
    histogram: Histogram<f64>,
    attributes: Vec<KeyValue>,
}

impl Recorder {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            histogram: meter().f64_histogram(name).with_unit("ms").build(),
            attributes: Vec::new(),
        }
    }

    pub(crate) fn push_attribute<K, V>(&mut self, key: K, value: V)
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        self.attributes.push(KeyValue::new(key, value));
    }

    pub(crate) fn record(self) {
        let duration = self.start.elapsed().as_secs_f64() * 1000.0;
        self.histogram.record(duration, &self.attributes);
    }
}

/// Counters shared by every dispatch of one client.
pub(crate) struct DispatchMetrics {
    attempts: Counter<u64>,
    input_token_counter: Counter<u64>,
    output_token_counter: Counter<u64>,
    total_token_counter: Counter<u64>,
}

impl DispatchMetrics {
    pub(crate) fn new() -> Self {
        let meter = meter();

        Self {
            attempts: meter.u64_counter(DISPATCH_ATTEMPTS).build(),
            input_token_counter: meter.u64_counter(GEN_AI_CLIENT_INPUT_TOKEN_USAGE).build(),
            output_token_counter: meter.u64_counter(GEN_AI_CLIENT_OUTPUT_TOKEN_USAGE).build(),
            total_token_counter: meter.u64_counter(GEN_AI_CLIENT_TOTAL_TOKEN_USAGE).build(),
        }
    }

    /// Starts timing one upstream call.
    pub(crate) fn operation(&self, provider: &str, model: &str) -> Recorder {
        let mut recorder = Recorder::new(GEN_AI_CLIENT_OPERATION_DURATION);

        recorder.push_attribute("gen_ai.system", provider.to_string());
        recorder.push_attribute("gen_ai.operation.name", "chat");
        recorder.push_attribute("gen_ai.request.model", model.to_string());

        recorder
    }

    /// Finishes the timing of one upstream call and counts its tokens.
    pub(crate) fn finish_operation(&self, mut recorder: Recorder, provider: &str, model: &str, outcome: &Outcome) {
        match outcome {
            Outcome::Success { model: answered, usage, .. } => {
                recorder.push_attribute("gen_ai.response.model", answered.clone());

                if let Some(usage) = usage {
                    self.count_tokens(provider, model, usage);
                }
            }
            other => recorder.push_attribute("error.type", error_type(other)),
        }

        recorder.record();
    }

    /// Counts one candidate attempt. `None` is a success.
    pub(crate) fn count_attempt(&self, provider: &str, model: &str, failure: Option<FailureKind>) {
        let outcome = failure.map(FailureKind::as_str).unwrap_or("success");
        let mut attributes = base_attributes(provider, model);

        attributes.push(KeyValue::new(Key::from("dispatch.outcome"), Value::from(outcome)));

        self.attempts.add(1, &attributes);
    }

    fn count_tokens(&self, provider: &str, model: &str, usage: &Usage) {
        let attributes = base_attributes(provider, model);

        let input = u64::from(usage.prompt_tokens);
        let output = u64::from(usage.completion_tokens);
        let total = match usage.total_tokens {
            0 => input + output,
            total => u64::from(total),
        };

        self.input_token_counter.add(input, &attributes);
        self.output_token_counter.add(output, &attributes);
        self.total_token_counter.add(total, &attributes);
    }
}

fn base_attributes(provider: &str, model: &str) -> Vec<KeyValue> {
    vec![
        KeyValue::new(Key::from("gen_ai.system"), Value::from(provider.to_string())),
        KeyValue::new(Key::from("gen_ai.request.model"), Value::from(model.to_string())),
    ]
}

/// The `error.type` attribute of a failed call.
fn error_type(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Success { .. } => "none",
        Outcome::Refusal { .. } => "refusal",
        Outcome::LowQuality(_) => "low_quality",
        Outcome::RateLimited { .. } => "rate_limited",
        Outcome::ClientError { .. } => "client_error",
        Outcome::ServerError { .. } => "server_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::LowQuality;

    #[test]
    fn failed_calls_are_labeled() {
        let outcomes = [
            Outcome::RateLimited { retry_after: None },
            Outcome::ClientError {
                status: 400,
                message: "bad".to_string(),
            },
            Outcome::ServerError {
                status: None,
                message: "timeout".to_string(),
            },
            Outcome::LowQuality(LowQuality::TooShort),
        ];

        let labels: Vec<_> = outcomes.iter().map(error_type).collect();

        assert_eq!(labels, vec!["rate_limited", "client_error", "server_error", "low_quality"]);
    }

    #[test]
    fn instruments_accept_every_outcome_without_a_provider() {
        let metrics = DispatchMetrics::new();

        let success = Outcome::Success {
            content: "fine".to_string(),
            model: "m1".to_string(),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 0,
            }),
        };

        let recorder = metrics.operation("groq", "m1");
        metrics.finish_operation(recorder, "groq", "m1", &success);

        metrics.count_attempt("groq", "m1", None);
        metrics.count_attempt("groq", "m1", Some(FailureKind::LimiterDenied));
    }
}

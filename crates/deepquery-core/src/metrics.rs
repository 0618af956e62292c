use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct ResearchMetrics {
    dispatches: Counter<u64>,
    dispatch_ms: Histogram<f64>,
    rounds: Counter<u64>,
    sessions: Counter<u64>,
}

static METRICS: OnceCell<ResearchMetrics> = OnceCell::new();

fn handles() -> &'static ResearchMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("deepquery.research");
        ResearchMetrics {
            dispatches: meter
                .u64_counter("query_dispatches_total")
                .with_description("Search dispatches by outcome status")
                .init(),
            dispatch_ms: meter
                .f64_histogram("query_dispatch_duration_ms")
                .with_description("Search dispatch latency in milliseconds")
                .init(),
            rounds: meter
                .u64_counter("research_rounds_total")
                .with_description("Completed retrieval rounds")
                .init(),
            sessions: meter
                .u64_counter("research_sessions_total")
                .with_description("Finished research sessions by outcome")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("DEEPQUERY_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "DEEPQUERY_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export research metrics."
        );
    }
}

/// Record a single search dispatch (no-op if no provider installed).
pub fn record_dispatch(status: &str, duration_ms: u64) {
    let metrics = handles();
    let attrs = [KeyValue::new("status", status.to_string())];

    metrics.dispatches.add(1, &attrs);
    metrics.dispatch_ms.record(duration_ms as f64, &attrs);
}

pub fn record_round(round: u32, succeeded: usize, failed: usize) {
    handles().rounds.add(
        1,
        &[
            KeyValue::new("round", i64::from(round)),
            KeyValue::new("succeeded", succeeded as i64),
            KeyValue::new("failed", failed as i64),
        ],
    );
}

pub fn record_session(outcome: &str) {
    handles()
        .sessions
        .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
}

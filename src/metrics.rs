use crate::models::{FailureKind, OutcomeState};
use tracing::trace;

// Counters are emitted as trace events; the Prometheus recorder only serves
// whatever the exporter has registered.

pub fn inc_requests(route: &'static str) {
    trace!(target = "delist.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "delist.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn outcome(state: OutcomeState) {
    trace!(target = "delist.metrics", state = ?state, "product_outcome_inc");
}

pub fn bootstrap(cache_used: bool) {
    trace!(target = "delist.metrics", cache_used, "session_bootstrap_inc");
}

pub fn pipeline_failure(stage: &'static str, kind: FailureKind) {
    trace!(target = "delist.metrics", stage, kind = ?kind, "pipeline_failure_inc");
}

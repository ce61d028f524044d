// Prometheus metrics for the evaluation API
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Evaluations by outcome: passed, failed or rejected
    pub static ref EVALUATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("codelab_evaluations_total", "Evaluations handled, by result"),
        &["result"]
    )
    .expect("valid metric definition");

    pub static ref EVALUATION_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "codelab_evaluation_duration_seconds",
            "Wall-clock time of one evaluation call"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .expect("valid metric definition");

    pub static ref EVALUATIONS_IN_FLIGHT: IntGauge = IntGauge::new(
        "codelab_evaluations_in_flight",
        "Evaluations currently running or waiting for the grader"
    )
    .expect("valid metric definition");
}

pub fn register() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(EVALUATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EVALUATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(EVALUATIONS_IN_FLIGHT.clone()))?;
    Ok(())
}

/// Text exposition of everything registered
pub fn render() -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

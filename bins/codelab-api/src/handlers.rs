// HTTP route handlers for the codelab API

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use codelab_common::config::ConfigOverrides;
use codelab_common::types::{TestCase, Verdict};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
    /// Lesson-level overrides on top of the server's grader config
    #[serde(default)]
    pub config: Option<ConfigOverrides>,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub evaluation_id: Uuid,
    pub evaluated_at: DateTime<Utc>,
    pub verdict: Verdict,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub in_progress: bool,
    pub has_verdict: bool,
}

fn result_label(verdict: &Verdict) -> &'static str {
    if verdict.success {
        "passed"
    } else {
        "failed"
    }
}

/// POST /evaluate - Grade a submission against its test cases
pub async fn evaluate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EvaluateRequest>,
) -> Response {
    let evaluation_id = Uuid::new_v4();
    let overrides = payload.config.unwrap_or_default();

    metrics::EVALUATIONS_IN_FLIGHT.inc();
    let timer = metrics::EVALUATION_DURATION.start_timer();
    let result = state
        .grader
        .evaluate_with(&payload.source_code, &payload.test_cases, &overrides)
        .await;
    timer.observe_duration();
    metrics::EVALUATIONS_IN_FLIGHT.dec();

    match result {
        Ok(verdict) => {
            metrics::EVALUATIONS_TOTAL
                .with_label_values(&[result_label(&verdict)])
                .inc();
            info!(
                evaluation_id = %evaluation_id,
                score = verdict.score,
                success = verdict.success,
                "Evaluation served"
            );
            (
                StatusCode::OK,
                Json(EvaluateResponse {
                    evaluation_id,
                    evaluated_at: Utc::now(),
                    verdict,
                }),
            )
                .into_response()
        }
        Err(e) => {
            metrics::EVALUATIONS_TOTAL
                .with_label_values(&["rejected"])
                .inc();
            warn!(evaluation_id = %evaluation_id, error = %e, "Rejected evaluation request");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": e.to_string()
                })),
            )
                .into_response()
        }
    }
}

/// GET /status - Grader activity flags
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusResponse {
        in_progress: state.grader.in_progress(),
        has_verdict: state.grader.last_verdict().is_some(),
    })
}

/// GET /verdict/last - Most recent verdict, if any
pub async fn last_verdict(State(state): State<Arc<AppState>>) -> Response {
    match state.grader.last_verdict() {
        Some(verdict) => (StatusCode::OK, Json(verdict)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "No evaluation has completed yet"
            })),
        )
            .into_response(),
    }
}

/// GET /health - Liveness probe
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_text() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

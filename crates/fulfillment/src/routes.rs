//! Operational endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use store::{OutboxStatus, Store};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox_pending: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox_failed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /health: liveness plus the outbox backlog.
///
/// Answers 503 when the system of record cannot be queried.
pub async fn health(State(store): State<Arc<dyn Store>>) -> impl IntoResponse {
    let counts = async {
        let pending = store.count_outbox(OutboxStatus::Pending).await?;
        let failed = store.count_outbox(OutboxStatus::Failed).await?;
        Ok::<_, store::StoreError>((pending, failed))
    };

    match counts.await {
        Ok((pending, failed)) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                outbox_pending: Some(pending),
                outbox_failed: Some(failed),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    outbox_pending: None,
                    outbox_failed: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}

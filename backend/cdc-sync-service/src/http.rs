//! Operational HTTP endpoints: liveness, readiness and Prometheus metrics
use actix_web::{web, HttpResponse};
use std::sync::Arc;

use crate::metrics::CdcMetrics;
use crate::services::cdc::ConsumerErrorState;

#[derive(Clone)]
pub struct HttpState {
    pub error_state: Arc<ConsumerErrorState>,
    pub metrics: CdcMetrics,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready))
        .route("/metrics", web::get().to(serve_metrics));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

async fn ready(state: web::Data<HttpState>) -> HttpResponse {
    if state.error_state.is_healthy() {
        HttpResponse::Ok().body("READY")
    } else {
        HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "unhealthy",
            "consecutive_failed_batches": state.error_state.consecutive_errors(),
            "seconds_since_success": state.error_state.time_since_success().as_secs(),
        }))
    }
}

async fn serve_metrics(state: web::Data<HttpState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.metrics.render())
}

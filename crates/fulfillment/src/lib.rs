//! Fulfillment service.
//!
//! Runs the order saga against the configured backends and exposes
//! `/health` and `/metrics` for operators. Orders enter through
//! [`saga::OrderSaga::place_order`] on the [`Runtime`].

pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use store::Store;
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError, LogFormat};
pub use error::{FulfillmentError, Result};
pub use runtime::{Backends, Runtime};

/// Creates the operational router.
pub fn create_app(store: Arc<dyn Store>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health))
        .with_state(store)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}

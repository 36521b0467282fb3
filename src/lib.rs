// Library exports for the API binary, tools and tests
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use middleware::auth::JwtSecret;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
}

/// Uploaded transfer documents are capped at 10 MB; leave room for the multipart envelope.
const BODY_LIMIT: usize = 12 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    // Local development origins are always accepted.
    let base = state.config.app_base_url.clone();
    let cors_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let Ok(o) = origin.to_str() else {
            return false;
        };
        o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1") || o == base
    });

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
        ]))
        .allow_origin(cors_origin);

    let jwt_secret = JwtSecret(state.config.jwt_secret.clone());

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::metrics_handler))
        // Students
        .route("/students", get(routes::students::list_students))
        .route("/students/{id}", get(routes::students::get_student))
        // Transfers
        .route("/transfers", get(routes::transfers::list_transfers).post(routes::transfers::create_transfer))
        .route("/transfers/export", get(routes::transfers::export_transfers))
        .route("/transfers/bulk", post(routes::transfers::bulk_transition))
        .route("/transfers/{id}", get(routes::transfers::get_transfer))
        .route("/transfers/{id}/transition", post(routes::transfers::transition_transfer))
        .route("/transfers/{id}/documents", put(routes::transfers::update_documents))
        .route("/transfers/{id}/documents/{doc_id}/upload", post(routes::transfers::upload_document))
        .route("/transfers/{id}/fees", put(routes::transfers::update_fees))
        .route("/transfers/{id}/comments", post(routes::transfers::add_comment))
        // Reports
        .route("/reports/evaluations", get(routes::reports::evaluation_report))
        .route("/reports/payroll", get(routes::reports::payroll_report))
        .route("/reports/transfers", get(routes::reports::transfer_report))
        .layer(axum::Extension(jwt_secret))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use cloudpool_engine::CloudPool;

use crate::handlers::{lifecycle, pool, service};
use crate::state::ApiState;

/// Create the API router with all routes and middleware.
///
/// # Routes
///
/// ## Service
/// - `GET /health` - Pool condition, always 200 while serving
/// - `GET /metadata` - Backend identifier and supported API versions
///
/// ## Lifecycle
/// - `GET /config` - Last applied configuration
/// - `POST /config` - Apply a configuration
/// - `GET /status` - Configured and started flags
/// - `POST /start` - Start fetching and reconciliation
/// - `POST /stop` - Stop fetching and reconciliation
///
/// ## Pool
/// - `GET /pool` - Latest machine pool snapshot
/// - `GET /pool/size` - Desired, allocated and pending counts
/// - `POST /pool/size` - Set the desired size
/// - `POST /pool/terminate` - Terminate a machine
/// - `POST /pool/attach` - Attach a machine
/// - `POST /pool/detach` - Detach a machine
/// - `POST /pool/serviceState` - Set a machine's service state
/// - `POST /pool/membershipStatus` - Set a machine's membership status
pub fn create_router<P>(state: ApiState<P>) -> Router
where
    P: CloudPool + 'static,
{
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout();
    let state = Arc::new(state);

    Router::new()
        .route("/health", get(service::health::<P>))
        .route("/metadata", get(service::metadata::<P>))
        // Lifecycle
        .route(
            "/config",
            get(lifecycle::get_config::<P>).post(lifecycle::set_config::<P>),
        )
        .route("/status", get(lifecycle::get_status::<P>))
        .route("/start", post(lifecycle::start::<P>))
        .route("/stop", post(lifecycle::stop::<P>))
        // Pool
        .route("/pool", get(pool::get_pool::<P>))
        .route(
            "/pool/size",
            get(pool::get_pool_size::<P>).post(pool::set_desired_size::<P>),
        )
        .route("/pool/terminate", post(pool::terminate_machine::<P>))
        .route("/pool/attach", post(pool::attach_machine::<P>))
        .route("/pool/detach", post(pool::detach_machine::<P>))
        .route("/pool/serviceState", post(pool::set_service_state::<P>))
        .route(
            "/pool/membershipStatus",
            post(pool::set_membership_status::<P>),
        )
        // Middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body_bytes))
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

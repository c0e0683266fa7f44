//! Service-level endpoints: health and pool metadata.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use cloudpool_core::CloudPoolMetadata;
use cloudpool_engine::CloudPool;

use crate::error::ApiError;
use crate::state::ApiState;

/// Overall condition of the pool service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Started, with a fresh snapshot.
    Ok,
    /// Started, but no fresh snapshot is available.
    Degraded,
    /// Not started.
    Idle,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Overall condition.
    pub status: Health,
    /// Service version.
    pub version: &'static str,
    /// Whether a configuration has been applied.
    pub configured: bool,
    /// Whether fetching and reconciliation are running.
    pub started: bool,
}

/// Report the pool's condition.
///
/// Always answers 200 while the process serves requests; the body tells a
/// pool that cannot reach its backend apart from one that was never started.
///
/// ```text
/// GET /health
///
/// Response: 200 OK
/// {
///   "status": "degraded",
///   "version": "0.1.0",
///   "configured": true,
///   "started": true
/// }
/// ```
pub async fn health<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
) -> Json<HealthReport> {
    let status = state.pool.status().await;
    let health = if !status.started {
        Health::Idle
    } else if state.pool.machine_pool().await.is_ok() {
        Health::Ok
    } else {
        Health::Degraded
    };

    Json(HealthReport {
        status: health,
        version: env!("CARGO_PKG_VERSION"),
        configured: status.configured,
        started: status.started,
    })
}

/// Return the backend identifier and supported API versions.
///
/// # Errors
///
/// Returns `ApiError::Internal` if the driver's identifier is unusable.
pub async fn metadata<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
) -> Result<Json<CloudPoolMetadata>, ApiError> {
    Ok(Json(state.pool.metadata()?))
}

//! Configuration and lifecycle endpoints.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;

use cloudpool_core::CloudPoolStatus;
use cloudpool_engine::CloudPool;

use crate::error::ApiError;
use crate::state::ApiState;

/// Return the last applied configuration document.
///
/// # Errors
///
/// Returns `ApiError::NotFound` if no configuration has been applied.
pub async fn get_config<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
) -> Result<Json<Value>, ApiError> {
    state
        .pool
        .configuration()
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no configuration has been set".to_string()))
}

/// Apply a configuration document.
///
/// # Errors
///
/// Returns `ApiError::BadRequest` if the document is not JSON or is rejected.
pub async fn set_config<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(document) = payload?;
    state.pool.configure(document).await?;
    Ok(StatusCode::OK)
}

/// Return whether the pool is configured and started.
pub async fn get_status<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
) -> Json<CloudPoolStatus> {
    Json(state.pool.status().await)
}

/// Start the pool.
///
/// # Errors
///
/// Returns `ApiError::NotReady` if the pool is not configured.
pub async fn start<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
) -> Result<StatusCode, ApiError> {
    state.pool.start().await?;
    Ok(StatusCode::OK)
}

/// Stop the pool.
pub async fn stop<P: CloudPool + 'static>(State(state): State<Arc<ApiState<P>>>) -> StatusCode {
    state.pool.stop().await;
    StatusCode::OK
}

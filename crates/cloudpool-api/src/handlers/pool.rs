//! Pool view and machine endpoints.
//!
//! Request bodies use camelCase field names.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use cloudpool_core::{MachinePool, MembershipStatus, PoolSizeSummary, ServiceState};
use cloudpool_engine::CloudPool;

use crate::error::ApiError;
use crate::state::ApiState;

// =============================================================================
// Request Types
// =============================================================================

/// Request to set the desired size.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDesiredSizeBody {
    /// New desired number of active members.
    pub desired_size: i64,
}

/// Request to terminate or detach a machine.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveMachineBody {
    /// The machine to remove.
    pub machine_id: String,
    /// Lower the desired size along with the removal.
    #[serde(default)]
    pub decrement_desired_size: bool,
}

/// Request to attach a machine.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachMachineBody {
    /// The machine to attach.
    pub machine_id: String,
}

/// Request to set a machine's service state.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStateBody {
    /// The machine to tag.
    pub machine_id: String,
    /// Service state name, e.g. `IN_SERVICE`.
    pub service_state: String,
}

/// Request to set a machine's membership status.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipStatusBody {
    /// The machine to tag.
    pub machine_id: String,
    /// The new membership flags.
    pub membership_status: MembershipStatus,
}

// =============================================================================
// Handlers
// =============================================================================

/// Return the latest pool snapshot.
///
/// # Errors
///
/// Returns `ApiError::NotReady` before the pool is started and
/// `ApiError::Unavailable` when no usable snapshot exists.
pub async fn get_pool<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
) -> Result<Json<MachinePool>, ApiError> {
    let pool = state.pool.machine_pool().await?;
    Ok(Json(MachinePool::clone(&pool)))
}

/// Return the desired size next to the allocated and pending counts.
///
/// # Errors
///
/// Same as [`get_pool`].
pub async fn get_pool_size<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
) -> Result<Json<PoolSizeSummary>, ApiError> {
    Ok(Json(state.pool.pool_size().await?))
}

/// Set the desired size.
///
/// # Errors
///
/// Returns `ApiError::BadRequest` for a negative size.
pub async fn set_desired_size<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
    payload: Result<Json<SetDesiredSizeBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = payload?;
    state.pool.set_desired_size(body.desired_size).await?;
    Ok(StatusCode::OK)
}

/// Terminate a machine.
///
/// # Errors
///
/// Returns `ApiError::NotFound` if the machine is not a pool member.
pub async fn terminate_machine<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
    payload: Result<Json<RemoveMachineBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = payload?;
    state
        .pool
        .terminate_machine(&body.machine_id, body.decrement_desired_size)
        .await?;
    Ok(StatusCode::OK)
}

/// Attach a machine.
///
/// # Errors
///
/// Returns `ApiError::NotFound` if the machine does not exist.
pub async fn attach_machine<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
    payload: Result<Json<AttachMachineBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = payload?;
    state.pool.attach_machine(&body.machine_id).await?;
    Ok(StatusCode::OK)
}

/// Detach a machine.
///
/// # Errors
///
/// Returns `ApiError::NotFound` if the machine is not a pool member.
pub async fn detach_machine<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
    payload: Result<Json<RemoveMachineBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = payload?;
    state
        .pool
        .detach_machine(&body.machine_id, body.decrement_desired_size)
        .await?;
    Ok(StatusCode::OK)
}

/// Set a machine's service state.
///
/// # Errors
///
/// Returns `ApiError::BadRequest` for an unknown state name and
/// `ApiError::NotFound` if the machine is not a pool member.
pub async fn set_service_state<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
    payload: Result<Json<ServiceStateBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = payload?;
    let service_state: ServiceState = body
        .service_state
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    state
        .pool
        .set_service_state(&body.machine_id, service_state)
        .await?;
    Ok(StatusCode::OK)
}

/// Set a machine's membership status.
///
/// # Errors
///
/// Returns `ApiError::NotFound` if the machine is not a pool member.
pub async fn set_membership_status<P: CloudPool + 'static>(
    State(state): State<Arc<ApiState<P>>>,
    payload: Result<Json<MembershipStatusBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = payload?;
    state
        .pool
        .set_membership_status(&body.machine_id, body.membership_status)
        .await?;
    Ok(StatusCode::OK)
}

//! Power dispatch and BMC endpoints. Power operations run asynchronously
//! on a bounded task pool; the synchronous response is the pending record
//! and clients poll the operations list for the outcome.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use entity::hardware::BmcInfo;
use entity::machine;
use entity::power_operation::{self, PowerAction, PowerOpStatus};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{Claims, RequireOperator};
use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::state::AppState;

use super::actor;
use super::machines::find_machine;

const OPERATION_HISTORY_LIMIT: u64 = 50;

#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    #[serde(default)]
    pub operation: String,
}

/// `POST /machines/{id}/power`
pub async fn dispatch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    claims: Option<Extension<Claims>>,
    _: RequireOperator,
    ApiJson(req): ApiJson<PowerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let machine = find_machine(&state, &id).await?;
    let bmc = enabled_bmc(&machine)?;
    let action = PowerAction::parse(&req.operation)
        .ok_or_else(|| ApiError::BadRequest("unsupported operation".to_string()))?;

    let operation = power_operation::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        machine_id: Set(machine.id.clone()),
        operation: Set(action),
        status: Set(PowerOpStatus::Pending),
        result: Set(None),
        error: Set(None),
        initiated_by: Set(actor(&claims)),
        created_at: Set(Utc::now()),
        completed_at: Set(None),
    }
    .insert(&state.db)
    .await?;

    let op_id = operation.id.clone();
    let task_state = state.clone();
    tokio::spawn(async move {
        let _permit = task_state.power_permits.clone().acquire_owned().await;

        let outcome = task_state.oob.power(&bmc, action).await;
        let mut update = power_operation::ActiveModel {
            id: Set(op_id.clone()),
            completed_at: Set(Some(Utc::now())),
            ..Default::default()
        };
        match outcome {
            Ok(result) => {
                update.status = Set(PowerOpStatus::Success);
                update.result = Set(Some(result));
            }
            Err(err) => {
                update.status = Set(PowerOpStatus::Failed);
                update.error = Set(Some(err.to_string()));
            }
        }
        if let Err(err) = update.update(&task_state.db).await {
            tracing::warn!(operation_id = %op_id, error = %err, "failed to record power operation outcome");
        }
    });

    Ok(Json(operation))
}

/// `GET /machines/{id}/power/status` — synchronous status probe.
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
) -> Result<Json<serde_json::Value>, ApiError> {
    let machine = find_machine(&state, &id).await?;
    let bmc = enabled_bmc(&machine)?;

    let status = state
        .oob
        .power_status(&bmc)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to get power status: {e}")))?;

    Ok(Json(json!({
        "machine_id": machine.id,
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

pub async fn operations(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
) -> Result<Json<Vec<power_operation::Model>>, ApiError> {
    find_machine(&state, &id).await?;
    let operations = power_operation::Entity::find()
        .filter(power_operation::Column::MachineId.eq(id))
        .order_by_desc(power_operation::Column::CreatedAt)
        .limit(OPERATION_HISTORY_LIMIT)
        .all(&state.db)
        .await?;
    Ok(Json(operations))
}

/// `POST /machines/{id}/bmc/test`
pub async fn test_bmc(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
) -> Result<impl IntoResponse, ApiError> {
    let machine = find_machine(&state, &id).await?;
    let bmc = enabled_bmc(&machine)?;

    match state.oob.test_connection(&bmc).await {
        Ok(()) => Ok(Json(json!({
            "machine_id": machine.id,
            "status": "success",
            "timestamp": Utc::now().to_rfc3339(),
        }))),
        Err(err) => Err(ApiError::BadRequest(format!("BMC test failed: {err}"))),
    }
}

pub async fn bmc_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
) -> Result<Json<serde_json::Value>, ApiError> {
    let machine = find_machine(&state, &id).await?;
    let bmc = enabled_bmc(&machine)?;

    let info = state
        .oob
        .controller_info(&bmc)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to get BMC info: {e}")))?;
    Ok(Json(serde_json::to_value(info).unwrap_or_default()))
}

pub async fn sensors(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
) -> Result<Json<serde_json::Value>, ApiError> {
    let machine = find_machine(&state, &id).await?;
    let bmc = enabled_bmc(&machine)?;

    let sensors = state
        .oob
        .sensors(&bmc)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to get sensor readings: {e}")))?;
    Ok(Json(serde_json::to_value(sensors).unwrap_or_default()))
}

fn enabled_bmc(machine: &machine::Model) -> Result<BmcInfo, ApiError> {
    let bmc = machine
        .bmc_info
        .clone()
        .ok_or_else(|| ApiError::BadRequest("BMC is not configured for this machine".to_string()))?;
    if !bmc.enabled {
        return Err(ApiError::BadRequest(
            "BMC is not enabled for this machine".to_string(),
        ));
    }
    Ok(bmc)
}

//! Bulk operations over a machine list or a whole group. Per-item
//! failures accumulate; partial success is not an error.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use entity::build::{self, BuildStatus};
use entity::machine::{self, StatusEvent};
use entity::{group_membership, machine_event, machine_metrics, power_operation};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{Claims, RequireOperator};
use crate::error::ApiError;
use crate::events;
use crate::extract::ApiJson;
use crate::state::AppState;

use super::actor;
use super::groups::group_machines;

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub machine_ids: Vec<String>,
    pub group_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Default, Serialize)]
pub struct BulkResult {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub errors: Vec<String>,
}

impl BulkResult {
    fn ok(&mut self) {
        self.success += 1;
    }

    fn fail(&mut self, id: &str, message: impl std::fmt::Display) {
        self.failure += 1;
        self.errors.push(format!("machine {id}: {message}"));
    }
}

pub async fn execute(
    State(state): State<AppState>,
    claims: Option<Extension<Claims>>,
    _: RequireOperator,
    ApiJson(req): ApiJson<BulkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.operation.is_empty() {
        return Err(ApiError::BadRequest("operation is required".to_string()));
    }

    let machine_ids: Vec<String> = if let Some(group_id) = &req.group_id {
        group_machines(&state, group_id)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect()
    } else if !req.machine_ids.is_empty() {
        req.machine_ids.clone()
    } else {
        return Err(ApiError::BadRequest(
            "either machine_ids or group_id is required".to_string(),
        ));
    };

    if machine_ids.is_empty() {
        return Err(ApiError::BadRequest("no machines to operate on".to_string()));
    }

    let by = actor(&claims);
    let result = match req.operation.as_str() {
        "update" => bulk_update(&state, &machine_ids, &req.data, &by).await,
        "build" => bulk_build(&state, &machine_ids, &by).await,
        "delete" => bulk_delete(&state, &machine_ids).await,
        _ => return Err(ApiError::BadRequest("invalid operation".to_string())),
    };

    tracing::info!(
        operation = %req.operation,
        total = result.total,
        success = result.success,
        "bulk operation finished"
    );
    Ok(Json(result))
}

async fn bulk_update(
    state: &AppState,
    machine_ids: &[String],
    data: &serde_json::Value,
    by: &str,
) -> BulkResult {
    let mut result = BulkResult {
        total: machine_ids.len(),
        ..Default::default()
    };

    let hostname = data.get("hostname").and_then(|v| v.as_str());
    let description = data.get("description").and_then(|v| v.as_str());
    let nixos_config = data.get("nixos_config").and_then(|v| v.as_str());

    for id in machine_ids {
        let machine = match machine::Entity::find_by_id(id.clone()).one(&state.db).await {
            Ok(Some(machine)) => machine,
            Ok(None) => {
                result.fail(id, "not found");
                continue;
            }
            Err(err) => {
                result.fail(id, err);
                continue;
            }
        };

        let old_status = machine.status;
        let mut new_status = old_status;
        let mut active = machine.into_active_model();
        if let Some(hostname) = hostname.filter(|h| !h.is_empty()) {
            active.hostname = Set(Some(hostname.to_string()));
        }
        if let Some(description) = description {
            active.description = Set(Some(description.to_string()));
        }
        if let Some(config) = nixos_config.filter(|c| !c.is_empty()) {
            active.nixos_config = Set(Some(config.to_string()));
            new_status = old_status.apply(StatusEvent::ConfigSet);
        }
        active.status = Set(new_status);
        active.updated_at = Set(Utc::now());

        match active.update(&state.db).await {
            Ok(updated) => {
                if new_status != old_status {
                    events::emit(
                        state,
                        &updated.id,
                        events::MACHINE_STATUS_CHANGED,
                        json!({
                            "machine_id": updated.id,
                            "old_status": old_status,
                            "new_status": new_status,
                        }),
                        Some(by.to_string()),
                    )
                    .await;
                }
                result.ok();
            }
            Err(err) => result.fail(id, err),
        }
    }

    result
}

async fn bulk_build(state: &AppState, machine_ids: &[String], by: &str) -> BulkResult {
    let mut result = BulkResult {
        total: machine_ids.len(),
        ..Default::default()
    };

    for id in machine_ids {
        let machine = match machine::Entity::find_by_id(id.clone()).one(&state.db).await {
            Ok(Some(machine)) => machine,
            Ok(None) => {
                result.fail(id, "not found");
                continue;
            }
            Err(err) => {
                result.fail(id, err);
                continue;
            }
        };

        let Some(config) = machine.nixos_config.clone().filter(|c| !c.is_empty()) else {
            result.fail(id, "no configuration");
            continue;
        };

        let build = build::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            machine_id: Set(machine.id.clone()),
            status: Set(BuildStatus::Pending),
            config: Set(config),
            log_output: Set(None),
            error: Set(None),
            artifact_url: Set(None),
            created_at: Set(Utc::now()),
            completed_at: Set(None),
        };
        let build = match build.insert(&state.db).await {
            Ok(build) => build,
            Err(err) => {
                result.fail(id, err);
                continue;
            }
        };

        let old_status = machine.status;
        let mut active = machine.into_active_model();
        active.status = Set(old_status.apply(StatusEvent::BuildRequested));
        active.last_build_id = Set(Some(build.id.clone()));
        active.updated_at = Set(Utc::now());
        match active.update(&state.db).await {
            Ok(updated) => {
                events::emit(
                    state,
                    &updated.id,
                    events::MACHINE_BUILD_STARTED,
                    json!({ "machine_id": updated.id, "build_id": build.id }),
                    Some(by.to_string()),
                )
                .await;
                result.ok();
            }
            Err(err) => result.fail(id, err),
        }
    }

    result
}

async fn bulk_delete(state: &AppState, machine_ids: &[String]) -> BulkResult {
    let mut result = BulkResult {
        total: machine_ids.len(),
        ..Default::default()
    };

    for id in machine_ids {
        match machine::Entity::find_by_id(id.clone()).one(&state.db).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                result.fail(id, "not found");
                continue;
            }
            Err(err) => {
                result.fail(id, err);
                continue;
            }
        }

        let cascade = async {
            machine_event::Entity::delete_many()
                .filter(machine_event::Column::MachineId.eq(id.clone()))
                .exec(&state.db)
                .await?;
            machine_metrics::Entity::delete_many()
                .filter(machine_metrics::Column::MachineId.eq(id.clone()))
                .exec(&state.db)
                .await?;
            power_operation::Entity::delete_many()
                .filter(power_operation::Column::MachineId.eq(id.clone()))
                .exec(&state.db)
                .await?;
            group_membership::Entity::delete_many()
                .filter(group_membership::Column::MachineId.eq(id.clone()))
                .exec(&state.db)
                .await?;
            machine::Entity::delete_by_id(id.clone())
                .exec(&state.db)
                .await
        };

        match cascade.await {
            Ok(_) => result.ok(),
            Err(err) => result.fail(id, err),
        }
    }

    result
}

//! Machine lifecycle: enrollment, listing/search, updates, build
//! requests, deletion, and the per-machine read endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use entity::build::{self, BuildStatus};
use entity::hardware::{BmcInfo, HardwareInfo};
use entity::machine::{self, MachineStatus, StatusEvent};
use entity::{group, group_membership, machine_event, machine_metrics, power_operation};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{Claims, RequireAdmin, RequireOperator};
use crate::error::ApiError;
use crate::events;
use crate::extract::ApiJson;
use crate::search::{self, MachineFilter};
use crate::state::AppState;

use super::actor;

#[derive(Debug, Deserialize)]
pub struct EnrollmentRequest {
    #[serde(default)]
    pub service_tag: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub hardware: HardwareInfo,
}

/// `POST /enroll` — idempotent by service tag. Re-enrollment refreshes
/// `last_seen_at` only and never creates a duplicate row.
pub async fn enroll(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<EnrollmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.service_tag.is_empty() || req.mac_address.is_empty() {
        return Err(ApiError::BadRequest(
            "service_tag and mac_address are required".to_string(),
        ));
    }

    let existing = machine::Entity::find()
        .filter(machine::Column::ServiceTag.eq(req.service_tag.clone()))
        .one(&state.db)
        .await?;

    if let Some(existing) = existing {
        let mut active = existing.into_active_model();
        active.last_seen_at = Set(Some(Utc::now()));
        let refreshed = active.update(&state.db).await?;
        return Ok((StatusCode::OK, Json(refreshed)));
    }

    let now = Utc::now();
    let model = machine::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        service_tag: Set(req.service_tag),
        mac_address: Set(req.mac_address),
        status: Set(MachineStatus::Enrolled),
        hostname: Set(None),
        description: Set(None),
        hardware: Set(req.hardware),
        nixos_config: Set(None),
        last_build_id: Set(None),
        last_build_time: Set(None),
        bmc_info: Set(None),
        enrolled_at: Set(now),
        updated_at: Set(now),
        last_seen_at: Set(None),
    };
    let created = model.insert(&state.db).await?;

    tracing::info!(
        machine_id = %created.id,
        service_tag = %created.service_tag,
        "enrolled new machine"
    );
    events::emit(
        &state,
        &created.id,
        events::MACHINE_ENROLLED,
        serde_json::to_value(&created).unwrap_or_default(),
        None,
    )
    .await;

    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /machines` — dispatches to filtered search when any query
/// parameter is present, otherwise lists all by `enrolled_at DESC`.
pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<MachineFilter>,
) -> Result<Json<Vec<machine::Model>>, ApiError> {
    if filter.is_empty() {
        let machines = machine::Entity::find()
            .order_by_desc(machine::Column::EnrolledAt)
            .all(&state.db)
            .await?;
        return Ok(Json(machines));
    }

    if filter.limit == Some(0) {
        return Err(ApiError::BadRequest("limit must be at least 1".to_string()));
    }

    let machines = search::search_machines(&state.db, &filter).await?;
    Ok(Json(machines))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<machine::Model>, ApiError> {
    let machine = find_machine(&state, &id).await?;
    Ok(Json(machine))
}

/// Public lookup used by the chain-boot dispatcher to decide between the
/// registration and machine boot scripts.
pub async fn get_by_service_tag(
    State(state): State<AppState>,
    Path(service_tag): Path<String>,
) -> Result<Json<machine::Model>, ApiError> {
    let machine = machine::Entity::find()
        .filter(machine::Column::ServiceTag.eq(service_tag))
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("machine not found".to_string()))?;
    Ok(Json(machine))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateMachineRequest {
    pub hostname: Option<String>,
    pub description: Option<String>,
    pub nixos_config: Option<String>,
    pub bmc_info: Option<BmcInfo>,
}

/// `PUT /machines/{id}` — partial patch. A non-empty `nixos_config`
/// moves the machine to `configured`; any status change is emitted as
/// `machine.status_changed`.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    claims: Option<Extension<Claims>>,
    _: RequireOperator,
    ApiJson(req): ApiJson<UpdateMachineRequest>,
) -> Result<Json<machine::Model>, ApiError> {
    let machine = find_machine(&state, &id).await?;
    let old_status = machine.status;
    let mut new_status = old_status;

    let mut active = machine.into_active_model();
    if let Some(hostname) = req.hostname.filter(|h| !h.is_empty()) {
        active.hostname = Set(Some(hostname));
    }
    if let Some(description) = req.description {
        active.description = Set(Some(description));
    }
    if let Some(config) = req.nixos_config.filter(|c| !c.is_empty()) {
        active.nixos_config = Set(Some(config));
        new_status = old_status.apply(StatusEvent::ConfigSet);
    }
    if let Some(bmc_info) = req.bmc_info {
        active.bmc_info = Set(Some(bmc_info));
    }
    active.status = Set(new_status);
    active.updated_at = Set(Utc::now());

    let updated = active.update(&state.db).await?;

    if new_status != old_status {
        events::emit(
            &state,
            &updated.id,
            events::MACHINE_STATUS_CHANGED,
            json!({
                "machine_id": updated.id,
                "old_status": old_status,
                "new_status": new_status,
            }),
            Some(actor(&claims)),
        )
        .await;
    }

    Ok(Json(updated))
}

/// `POST /machines/{id}/build` — snapshots the configuration into a
/// pending build, marks the machine `building`, and nudges the builder.
pub async fn request_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
    claims: Option<Extension<Claims>>,
    _: RequireOperator,
) -> Result<impl IntoResponse, ApiError> {
    let machine = find_machine(&state, &id).await?;
    let config = machine
        .nixos_config
        .clone()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("machine has no configuration".to_string()))?;

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
    }
    .insert(&state.db)
    .await?;

    let old_status = machine.status;
    let mut active = machine.into_active_model();
    active.status = Set(old_status.apply(StatusEvent::BuildRequested));
    active.last_build_id = Set(Some(build.id.clone()));
    active.updated_at = Set(Utc::now());
    let updated = active.update(&state.db).await?;

    tracing::info!(machine_id = %updated.id, build_id = %build.id, "build requested");
    events::emit(
        &state,
        &updated.id,
        events::MACHINE_BUILD_STARTED,
        json!({ "machine_id": updated.id, "build_id": build.id }),
        Some(actor(&claims)),
    )
    .await;

    // Best-effort wake-up so the builder does not wait for its next tick.
    if let Some(builder_url) = state.config.builder_url.clone() {
        let client = state.http.clone();
        let body = json!({ "build_id": build.id, "machine_id": updated.id });
        tokio::spawn(async move {
            let url = format!("{}/build", builder_url.trim_end_matches('/'));
            if let Err(err) = client.post(&url).json(&body).send().await {
                tracing::debug!(error = %err, "builder nudge failed");
            }
        });
    }

    Ok((StatusCode::CREATED, Json(build)))
}

/// `DELETE /machines/{id}` — cascades events, metrics, power operations,
/// and group memberships; build rows survive for audit.
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireAdmin,
) -> Result<StatusCode, ApiError> {
    find_machine(&state, &id).await?;

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
    machine::Entity::delete_by_id(id).exec(&state.db).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_builds(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<build::Model>>, ApiError> {
    find_machine(&state, &id).await?;
    let builds = build::Entity::find()
        .filter(build::Column::MachineId.eq(id))
        .order_by_desc(build::Column::CreatedAt)
        .all(&state.db)
        .await?;
    Ok(Json(builds))
}

pub async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<build::Model>, ApiError> {
    let build = build::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("build not found".to_string()))?;
    Ok(Json(build))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<u64>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<machine_event::Model>>, ApiError> {
    find_machine(&state, &id).await?;
    let events = machine_event::Entity::find()
        .filter(machine_event::Column::MachineId.eq(id))
        .order_by_desc(machine_event::Column::CreatedAt)
        .limit(query.limit.unwrap_or(50))
        .all(&state.db)
        .await?;
    Ok(Json(events))
}

/// `GET /events` — fleet-wide audit trail, newest first.
pub async fn list_all_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<machine_event::Model>>, ApiError> {
    let events = machine_event::Entity::find()
        .order_by_desc(machine_event::Column::CreatedAt)
        .limit(query.limit.unwrap_or(50))
        .all(&state.db)
        .await?;
    Ok(Json(events))
}

pub async fn list_groups(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<group::Model>>, ApiError> {
    find_machine(&state, &id).await?;
    let group_ids: Vec<String> = group_membership::Entity::find()
        .filter(group_membership::Column::MachineId.eq(id))
        .all(&state.db)
        .await?
        .into_iter()
        .map(|m| m.group_id)
        .collect();

    let groups = if group_ids.is_empty() {
        Vec::new()
    } else {
        group::Entity::find()
            .filter(group::Column::Id.is_in(group_ids))
            .order_by_asc(group::Column::Name)
            .all(&state.db)
            .await?
    };
    Ok(Json(groups))
}

pub async fn find_machine(state: &AppState, id: &str) -> Result<machine::Model, ApiError> {
    machine::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("machine not found".to_string()))
}

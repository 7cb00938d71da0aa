//! Machine groups and group membership.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use entity::types::StringList;
use entity::{group, group_membership, machine};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::{RequireAdmin, RequireOperator};
use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::state::AppState;

use super::machines::find_machine;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn create(
    State(state): State<AppState>,
    _: RequireOperator,
    ApiJson(req): ApiJson<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }

    let existing = group::Entity::find()
        .filter(group::Column::Name.eq(req.name.clone()))
        .one(&state.db)
        .await?;
    if existing.is_some() {
        return Err(ApiError::Conflict(
            "group with this name already exists".to_string(),
        ));
    }

    let now = Utc::now();
    let created = group::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        name: Set(req.name),
        description: Set(req.description),
        tags: Set(StringList(req.tags)),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<group::Model>>, ApiError> {
    let groups = group::Entity::find()
        .order_by_asc(group::Column::Name)
        .all(&state.db)
        .await?;
    Ok(Json(groups))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<group::Model>, ApiError> {
    let group = find_group(&state, &id).await?;
    Ok(Json(group))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateGroupRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
    ApiJson(req): ApiJson<UpdateGroupRequest>,
) -> Result<Json<group::Model>, ApiError> {
    let group = find_group(&state, &id).await?;

    if let Some(name) = &req.name {
        if !name.is_empty() && *name != group.name {
            let existing = group::Entity::find()
                .filter(group::Column::Name.eq(name.clone()))
                .one(&state.db)
                .await?;
            if existing.is_some() {
                return Err(ApiError::Conflict(
                    "group with this name already exists".to_string(),
                ));
            }
        }
    }

    let mut active = group.into_active_model();
    if let Some(name) = req.name.filter(|n| !n.is_empty()) {
        active.name = Set(name);
    }
    if let Some(description) = req.description {
        active.description = Set(Some(description));
    }
    if let Some(tags) = req.tags {
        active.tags = Set(StringList(tags));
    }
    active.updated_at = Set(Utc::now());

    let updated = active.update(&state.db).await?;
    Ok(Json(updated))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireAdmin,
) -> Result<StatusCode, ApiError> {
    find_group(&state, &id).await?;
    group_membership::Entity::delete_many()
        .filter(group_membership::Column::GroupId.eq(id.clone()))
        .exec(&state.db)
        .await?;
    group::Entity::delete_by_id(id).exec(&state.db).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /groups/{id}/machines/{machine_id}` — idempotent add.
pub async fn add_machine(
    State(state): State<AppState>,
    Path((group_id, machine_id)): Path<(String, String)>,
    _: RequireOperator,
) -> Result<StatusCode, ApiError> {
    find_group(&state, &group_id).await?;
    find_machine(&state, &machine_id).await?;

    let existing = group_membership::Entity::find_by_id((group_id.clone(), machine_id.clone()))
        .one(&state.db)
        .await?;
    if existing.is_some() {
        return Ok(StatusCode::NO_CONTENT);
    }

    group_membership::ActiveModel {
        group_id: Set(group_id),
        machine_id: Set(machine_id),
        added_at: Set(Utc::now()),
    }
    .insert(&state.db)
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_machine(
    State(state): State<AppState>,
    Path((group_id, machine_id)): Path<(String, String)>,
    _: RequireOperator,
) -> Result<StatusCode, ApiError> {
    find_group(&state, &group_id).await?;
    group_membership::Entity::delete_by_id((group_id, machine_id))
        .exec(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_machines(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<machine::Model>>, ApiError> {
    find_group(&state, &id).await?;
    let machines = group_machines(&state, &id).await?;
    Ok(Json(machines))
}

pub async fn group_machines(
    state: &AppState,
    group_id: &str,
) -> Result<Vec<machine::Model>, ApiError> {
    let machine_ids: Vec<String> = group_membership::Entity::find()
        .filter(group_membership::Column::GroupId.eq(group_id))
        .all(&state.db)
        .await?
        .into_iter()
        .map(|m| m.machine_id)
        .collect();

    if machine_ids.is_empty() {
        return Ok(Vec::new());
    }

    let machines = machine::Entity::find()
        .filter(machine::Column::Id.is_in(machine_ids))
        .order_by_desc(machine::Column::EnrolledAt)
        .all(&state.db)
        .await?;
    Ok(machines)
}

pub async fn find_group(state: &AppState, id: &str) -> Result<group::Model, ApiError> {
    group::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("group not found".to_string()))
}

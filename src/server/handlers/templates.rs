//! Configuration templates and template application.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use entity::hardware::BmcInfo;
use entity::machine::{self, StatusEvent};
use entity::machine_template;
use entity::types::{StringList, StringMap};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::auth::{Claims, RequireOperator};
use crate::error::ApiError;
use crate::events;
use crate::extract::ApiJson;
use crate::state::AppState;

use super::actor;
use super::machines::find_machine;

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub nixos_config: String,
    pub bmc_config: Option<BmcInfo>,
    pub tags: Option<Vec<String>>,
    pub variables: Option<BTreeMap<String, String>>,
}

pub async fn create(
    State(state): State<AppState>,
    claims: Option<Extension<Claims>>,
    _: RequireOperator,
    ApiJson(req): ApiJson<CreateTemplateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.is_empty() || req.nixos_config.is_empty() {
        return Err(ApiError::BadRequest(
            "name and nixos_config are required".to_string(),
        ));
    }

    let existing = machine_template::Entity::find()
        .filter(machine_template::Column::Name.eq(req.name.clone()))
        .one(&state.db)
        .await?;
    if existing.is_some() {
        return Err(ApiError::Conflict(
            "template with this name already exists".to_string(),
        ));
    }

    let now = Utc::now();
    let created = machine_template::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        name: Set(req.name),
        description: Set(req.description),
        nixos_config: Set(req.nixos_config),
        bmc_config: Set(req.bmc_config),
        tags: Set(req.tags.map(StringList)),
        variables: Set(req.variables.map(StringMap)),
        created_by: Set(actor(&claims)),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list(
    State(state): State<AppState>,
    _: RequireOperator,
) -> Result<Json<Vec<machine_template::Model>>, ApiError> {
    let templates = machine_template::Entity::find()
        .order_by_asc(machine_template::Column::Name)
        .all(&state.db)
        .await?;
    Ok(Json(templates))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
) -> Result<Json<machine_template::Model>, ApiError> {
    let template = find_template(&state, &id).await?;
    Ok(Json(template))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTemplateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub nixos_config: Option<String>,
    pub bmc_config: Option<BmcInfo>,
    pub tags: Option<Vec<String>>,
    pub variables: Option<BTreeMap<String, String>>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
    ApiJson(req): ApiJson<UpdateTemplateRequest>,
) -> Result<Json<machine_template::Model>, ApiError> {
    let template = find_template(&state, &id).await?;

    if let Some(name) = &req.name {
        if !name.is_empty() && *name != template.name {
            let existing = machine_template::Entity::find()
                .filter(machine_template::Column::Name.eq(name.clone()))
                .one(&state.db)
                .await?;
            if existing.is_some() {
                return Err(ApiError::Conflict(
                    "template with this name already exists".to_string(),
                ));
            }
        }
    }

    let mut active = template.into_active_model();
    if let Some(name) = req.name.filter(|n| !n.is_empty()) {
        active.name = Set(name);
    }
    if let Some(description) = req.description {
        active.description = Set(Some(description));
    }
    if let Some(config) = req.nixos_config.filter(|c| !c.is_empty()) {
        active.nixos_config = Set(config);
    }
    if let Some(bmc_config) = req.bmc_config {
        active.bmc_config = Set(Some(bmc_config));
    }
    if let Some(tags) = req.tags {
        active.tags = Set(Some(StringList(tags)));
    }
    if let Some(variables) = req.variables {
        active.variables = Set(Some(StringMap(variables)));
    }
    active.updated_at = Set(Utc::now());

    let updated = active.update(&state.db).await?;
    Ok(Json(updated))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
) -> Result<StatusCode, ApiError> {
    find_template(&state, &id).await?;
    machine_template::Entity::delete_by_id(id)
        .exec(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /machines/{id}/template/{template_id}` — renders the template
/// against the machine, stores the result as the machine's configuration,
/// and moves it to `configured`.
pub async fn apply(
    State(state): State<AppState>,
    Path((machine_id, template_id)): Path<(String, String)>,
    claims: Option<Extension<Claims>>,
    _: RequireOperator,
) -> Result<Json<machine::Model>, ApiError> {
    let machine = find_machine(&state, &machine_id).await?;
    let template = find_template(&state, &template_id).await?;

    let config = render_config(&template, &machine);

    let old_status = machine.status;
    let copy_bmc = machine.bmc_info.is_none();
    let mut active = machine.into_active_model();
    active.nixos_config = Set(Some(config));
    active.status = Set(old_status.apply(StatusEvent::ConfigSet));
    if copy_bmc {
        if let Some(bmc) = template.bmc_config.clone() {
            active.bmc_info = Set(Some(bmc));
        }
    }
    active.updated_at = Set(Utc::now());
    let updated = active.update(&state.db).await?;

    events::emit(
        &state,
        &updated.id,
        events::MACHINE_TEMPLATE_APPLIED,
        json!({ "machine_id": updated.id, "template_id": template.id }),
        Some(actor(&claims)),
    )
    .await;

    Ok(Json(updated))
}

/// `{{name}}` substitution. Machine identity fields win over template
/// defaults; placeholders with no known value stay literal.
pub fn render_config(template: &machine_template::Model, machine: &machine::Model) -> String {
    let mut values: BTreeMap<String, String> = template
        .variables
        .as_ref()
        .map(|v| v.0.clone())
        .unwrap_or_default();

    values.insert("service_tag".to_string(), machine.service_tag.clone());
    values.insert("mac_address".to_string(), machine.mac_address.clone());
    match machine.hostname.as_deref().filter(|h| !h.is_empty()) {
        Some(hostname) => {
            values.insert("hostname".to_string(), hostname.to_string());
        }
        // Fall back to the template's default, when it has one.
        None => {}
    }

    let mut config = template.nixos_config.clone();
    for (name, value) in &values {
        config = config.replace(&format!("{{{{{name}}}}}"), value);
    }
    config
}

async fn find_template(
    state: &AppState,
    id: &str,
) -> Result<machine_template::Model, ApiError> {
    machine_template::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("template not found".to_string()))
}

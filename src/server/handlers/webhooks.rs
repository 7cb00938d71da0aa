//! Webhook configuration CRUD and the delivery log.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use entity::types::{StringList, StringMap};
use entity::{webhook, webhook_delivery};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::auth::RequireOperator;
use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::state::AppState;

const DEFAULT_TIMEOUT_SECONDS: i32 = 30;
const DEFAULT_MAX_RETRIES: i32 = 3;

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub active: Option<bool>,
    pub headers: Option<BTreeMap<String, String>>,
    pub timeout_seconds: Option<i32>,
    pub max_retries: Option<i32>,
}

pub async fn create(
    State(state): State<AppState>,
    _: RequireOperator,
    ApiJson(req): ApiJson<CreateWebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.is_empty() || req.url.is_empty() {
        return Err(ApiError::BadRequest("name and url are required".to_string()));
    }
    if req.events.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one event subscription is required".to_string(),
        ));
    }

    let now = Utc::now();
    let created = webhook::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        name: Set(req.name),
        url: Set(req.url),
        events: Set(StringList(req.events)),
        secret: Set(req.secret.filter(|s| !s.is_empty())),
        active: Set(req.active.unwrap_or(true)),
        headers: Set(req.headers.map(StringMap)),
        timeout_seconds: Set(req.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS)),
        max_retries: Set(req.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)),
        last_success: Set(None),
        last_failure: Set(None),
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
) -> Result<Json<Vec<webhook::Model>>, ApiError> {
    let webhooks = webhook::Entity::find()
        .order_by_asc(webhook::Column::Name)
        .all(&state.db)
        .await?;
    Ok(Json(webhooks))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
) -> Result<Json<webhook::Model>, ApiError> {
    let webhook = find_webhook(&state, &id).await?;
    Ok(Json(webhook))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateWebhookRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub secret: Option<String>,
    pub active: Option<bool>,
    pub headers: Option<BTreeMap<String, String>>,
    pub timeout_seconds: Option<i32>,
    pub max_retries: Option<i32>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireOperator,
    ApiJson(req): ApiJson<UpdateWebhookRequest>,
) -> Result<Json<webhook::Model>, ApiError> {
    let webhook = find_webhook(&state, &id).await?;
    let mut active = webhook.into_active_model();

    if let Some(name) = req.name.filter(|n| !n.is_empty()) {
        active.name = Set(name);
    }
    if let Some(url) = req.url.filter(|u| !u.is_empty()) {
        active.url = Set(url);
    }
    if let Some(events) = req.events.filter(|e| !e.is_empty()) {
        active.events = Set(StringList(events));
    }
    if let Some(secret) = req.secret {
        active.secret = Set(if secret.is_empty() { None } else { Some(secret) });
    }
    if let Some(enabled) = req.active {
        active.active = Set(enabled);
    }
    if let Some(headers) = req.headers {
        active.headers = Set(Some(StringMap(headers)));
    }
    if let Some(timeout_seconds) = req.timeout_seconds {
        active.timeout_seconds = Set(timeout_seconds);
    }
    if let Some(max_retries) = req.max_retries {
        active.max_retries = Set(max_retries);
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
    find_webhook(&state, &id).await?;
    webhook_delivery::Entity::delete_many()
        .filter(webhook_delivery::Column::WebhookId.eq(id.clone()))
        .exec(&state.db)
        .await?;
    webhook::Entity::delete_by_id(id).exec(&state.db).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DeliveriesQuery {
    pub limit: Option<u64>,
}

pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
    _: RequireOperator,
) -> Result<Json<Vec<webhook_delivery::Model>>, ApiError> {
    find_webhook(&state, &id).await?;
    let deliveries = webhook_delivery::Entity::find()
        .filter(webhook_delivery::Column::WebhookId.eq(id))
        .order_by_desc(webhook_delivery::Column::CreatedAt)
        .limit(query.limit.unwrap_or(50))
        .all(&state.db)
        .await?;
    Ok(Json(deliveries))
}

async fn find_webhook(state: &AppState, id: &str) -> Result<webhook::Model, ApiError> {
    webhook::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("webhook not found".to_string()))
}

//! Metric sample intake and history queries.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use entity::machine_metrics;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::state::AppState;

use super::machines::find_machine;

const DEFAULT_HISTORY_LIMIT: u64 = 100;

#[derive(Debug, Deserialize)]
pub struct MetricsSample {
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cpu_usage_percent: f64,
    #[serde(default)]
    pub memory_used_bytes: i64,
    #[serde(default)]
    pub memory_total_bytes: i64,
    #[serde(default)]
    pub disk_used_bytes: i64,
    #[serde(default)]
    pub disk_total_bytes: i64,
    #[serde(default)]
    pub network_rx_bytes: i64,
    #[serde(default)]
    pub network_tx_bytes: i64,
    #[serde(default)]
    pub load_average_1: f64,
    #[serde(default)]
    pub load_average_5: f64,
    #[serde(default)]
    pub load_average_15: f64,
    pub temperature: Option<f64>,
    #[serde(default = "default_power_state")]
    pub power_state: String,
    #[serde(default)]
    pub uptime_seconds: i64,
}

fn default_power_state() -> String {
    "unknown".to_string()
}

/// `POST /machines/{id}/metrics` — appends a sample and refreshes the
/// machine's `last_seen_at`.
pub async fn submit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(sample): ApiJson<MetricsSample>,
) -> Result<impl IntoResponse, ApiError> {
    let machine = find_machine(&state, &id).await?;

    let row = machine_metrics::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        machine_id: Set(machine.id.clone()),
        timestamp: Set(sample.timestamp.unwrap_or_else(Utc::now)),
        cpu_usage_percent: Set(sample.cpu_usage_percent),
        memory_used_bytes: Set(sample.memory_used_bytes),
        memory_total_bytes: Set(sample.memory_total_bytes),
        disk_used_bytes: Set(sample.disk_used_bytes),
        disk_total_bytes: Set(sample.disk_total_bytes),
        network_rx_bytes: Set(sample.network_rx_bytes),
        network_tx_bytes: Set(sample.network_tx_bytes),
        load_average_1: Set(sample.load_average_1),
        load_average_5: Set(sample.load_average_5),
        load_average_15: Set(sample.load_average_15),
        temperature: Set(sample.temperature),
        power_state: Set(sample.power_state),
        uptime_seconds: Set(sample.uptime_seconds),
    }
    .insert(&state.db)
    .await?;

    let mut active = machine.into_active_model();
    active.last_seen_at = Set(Some(Utc::now()));
    active.update(&state.db).await?;

    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn latest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<machine_metrics::Model>, ApiError> {
    find_machine(&state, &id).await?;
    let latest = machine_metrics::Entity::find()
        .filter(machine_metrics::Column::MachineId.eq(id))
        .order_by_desc(machine_metrics::Column::Timestamp)
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("no metrics recorded for machine".to_string()))?;
    Ok(Json(latest))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<machine_metrics::Model>>, ApiError> {
    find_machine(&state, &id).await?;

    let mut find = machine_metrics::Entity::find()
        .filter(machine_metrics::Column::MachineId.eq(id))
        .order_by_desc(machine_metrics::Column::Timestamp)
        .limit(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
    if let Some(since) = query.since {
        find = find.filter(machine_metrics::Column::Timestamp.gte(since));
    }

    let samples = find.all(&state.db).await?;
    Ok(Json(samples))
}

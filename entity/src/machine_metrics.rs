use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only metric samples reported by running machines.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "machine_metrics")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String, // UUID
    pub machine_id: String,
    pub timestamp: DateTimeUtc,
    pub cpu_usage_percent: f64,
    pub memory_used_bytes: i64,
    pub memory_total_bytes: i64,
    pub disk_used_bytes: i64,
    pub disk_total_bytes: i64,
    pub network_rx_bytes: i64,
    pub network_tx_bytes: i64,
    pub load_average_1: f64,
    pub load_average_5: f64,
    pub load_average_15: f64,
    pub temperature: Option<f64>,
    /// on, off, unknown
    pub power_state: String,
    pub uptime_seconds: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One fan-out attempt series against a single webhook; records the final
/// outcome after retries are exhausted or delivery succeeds.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_deliveries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String, // UUID
    pub webhook_id: String,
    pub event: String,
    /// Exact bytes sent in the request body.
    #[sea_orm(column_type = "Text")]
    pub payload: String,
    /// Final HTTP status, 0 when no response was ever received.
    pub status_code: i32,
    pub response: Option<String>,
    pub error: Option<String>,
    pub attempts: i32,
    pub success: bool,
    pub created_at: DateTimeUtc,
    pub completed_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

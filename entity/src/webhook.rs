use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::{StringList, StringMap};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhooks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String, // UUID
    pub name: String,
    pub url: String,
    /// Subscribed event names; "*" matches everything.
    #[sea_orm(column_type = "JsonBinary")]
    pub events: StringList,
    /// HMAC-SHA256 signing key for `X-Webhook-Signature`.
    pub secret: Option<String>,
    pub active: bool,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub headers: Option<StringMap>,
    pub timeout_seconds: i32,
    pub max_retries: i32,
    pub last_success: Option<DateTimeUtc>,
    pub last_failure: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether this webhook subscribes to `event`, honouring the wildcard.
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.contains(event) || self.events.contains("*")
    }
}

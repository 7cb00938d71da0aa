use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::hardware::BmcInfo;
use crate::types::{StringList, StringMap};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "machine_templates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String, // UUID
    #[sea_orm(unique)]
    pub name: String,
    pub description: Option<String>,
    /// Configuration text with `{{name}}` placeholders.
    #[sea_orm(column_type = "Text")]
    pub nixos_config: String,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub bmc_config: Option<BmcInfo>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub tags: Option<StringList>,
    /// Placeholder name -> default value.
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub variables: Option<StringMap>,
    pub created_by: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

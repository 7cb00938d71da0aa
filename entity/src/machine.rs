use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::hardware::{BmcInfo, HardwareInfo};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "machines")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String, // UUID
    #[sea_orm(unique)]
    pub service_tag: String,
    pub mac_address: String,
    pub status: MachineStatus,
    pub hostname: Option<String>,
    pub description: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub hardware: HardwareInfo,

    /// Declarative configuration text, passed verbatim to the builder.
    pub nixos_config: Option<String>,

    pub last_build_id: Option<String>,
    pub last_build_time: Option<DateTimeUtc>,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub bmc_info: Option<BmcInfo>,

    pub enrolled_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub last_seen_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    #[sea_orm(string_value = "unknown")]
    Unknown,
    #[sea_orm(string_value = "enrolled")]
    Enrolled,
    #[sea_orm(string_value = "configured")]
    Configured,
    #[sea_orm(string_value = "building")]
    Building,
    #[sea_orm(string_value = "ready")]
    Ready,
    #[sea_orm(string_value = "provisioned")]
    Provisioned,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Unknown => "unknown",
            MachineStatus::Enrolled => "enrolled",
            MachineStatus::Configured => "configured",
            MachineStatus::Building => "building",
            MachineStatus::Ready => "ready",
            MachineStatus::Provisioned => "provisioned",
            MachineStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<MachineStatus> {
        match value {
            "unknown" => Some(MachineStatus::Unknown),
            "enrolled" => Some(MachineStatus::Enrolled),
            "configured" => Some(MachineStatus::Configured),
            "building" => Some(MachineStatus::Building),
            "ready" => Some(MachineStatus::Ready),
            "provisioned" => Some(MachineStatus::Provisioned),
            "failed" => Some(MachineStatus::Failed),
            _ => None,
        }
    }

    /// Compute the status resulting from a lifecycle event.
    ///
    /// Status is a summary field, not an enforced state machine: every
    /// mutator goes through here instead of assigning strings, and a
    /// machine may move "backwards" (re-editing the configuration of a
    /// `ready` machine returns it to `configured`).
    pub fn apply(self, event: StatusEvent) -> MachineStatus {
        match event {
            StatusEvent::Enrolled => MachineStatus::Enrolled,
            StatusEvent::ConfigSet => MachineStatus::Configured,
            StatusEvent::BuildRequested => MachineStatus::Building,
            StatusEvent::BuildSucceeded => MachineStatus::Ready,
            StatusEvent::BuildFailed => MachineStatus::Failed,
            StatusEvent::ReportedIn => MachineStatus::Provisioned,
        }
    }
}

/// Lifecycle events that drive [`MachineStatus::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    Enrolled,
    ConfigSet,
    BuildRequested,
    BuildSucceeded,
    BuildFailed,
    ReportedIn,
}

//! Hardware inventory and BMC documents stored inside machine rows.
//!
//! These mirror the payload the discovery image POSTs to `/enroll`; the
//! whole tree is kept as a single JSON column and parsed on read.

use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct HardwareInfo {
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub bios_version: String,

    #[serde(default)]
    pub cpu: CpuInfo,
    #[serde(default)]
    pub memory: MemoryInfo,
    #[serde(default)]
    pub disks: Vec<DiskInfo>,
    #[serde(default)]
    pub nics: Vec<NicInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<GpuInfo>,

    /// Raw output from dmidecode, lshw, etc.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub cores: i32,
    #[serde(default)]
    pub threads: i32,
    #[serde(default)]
    pub sockets: i32,
    #[serde(default)]
    pub max_freq_mhz: i32,
    #[serde(default)]
    pub architecture: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    #[serde(default)]
    pub total_bytes: i64,
    #[serde(default)]
    pub total_gb: f64,
    #[serde(default)]
    pub modules: Vec<MemorySlot>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySlot {
    #[serde(default)]
    pub slot: String,
    #[serde(default)]
    pub size_bytes: i64,
    /// DDR4, DDR5, etc.
    #[serde(default, rename = "type")]
    pub kind: String,
    /// MHz
    #[serde(default)]
    pub speed: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub size_gb: f64,
    /// SSD, HDD, NVMe
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wwn: Option<String>,
    #[serde(default)]
    pub rotational: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NicInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub driver: String,
    /// 1Gbps, 10Gbps, etc.
    #[serde(default)]
    pub speed: String,
    #[serde(default)]
    pub pci_address: String,
    /// up, down
    #[serde(default)]
    pub link_status: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub pci_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,
}

/// BMC/IPMI coordinates and credentials for out-of-band management.
///
/// Stored as plaintext JSON; credentials never leave the control plane
/// except through the ipmitool driver, which passes the password via a
/// private temp file rather than argv.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct BmcInfo {
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// IPMI, Redfish, etc.
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub enabled: bool,
}

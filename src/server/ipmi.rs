//! Out-of-band management driver wrapping an external ipmitool-style
//! binary: power control, controller info, and sensor readout.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use entity::hardware::BmcInfo;
use entity::power_operation::PowerAction;
use serde::Serialize;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OobError {
    #[error("BMC command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Command(String),
    #[error("failed to run BMC command: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SensorReading {
    pub name: String,
    pub value: String,
    pub status: String,
}

#[async_trait]
pub trait OutOfBand: Send + Sync {
    /// Run a power sub-command and return the tool's trimmed stdout.
    async fn power(&self, bmc: &BmcInfo, action: PowerAction) -> Result<String, OobError>;

    async fn controller_info(&self, bmc: &BmcInfo) -> Result<BTreeMap<String, String>, OobError>;

    async fn sensors(&self, bmc: &BmcInfo) -> Result<Vec<SensorReading>, OobError>;

    /// Chassis power state parsed into "on", "off", or "unknown".
    async fn power_status(&self, bmc: &BmcInfo) -> Result<String, OobError> {
        let output = self.power(bmc, PowerAction::Status).await?;
        Ok(parse_power_status(&output).to_string())
    }

    async fn test_connection(&self, bmc: &BmcInfo) -> Result<(), OobError> {
        self.power_status(bmc).await.map(|_| ())
    }
}

/// Driver shelling out to `ipmitool` over the lanplus interface.
///
/// The BMC password is handed over through a private 0600 temp file
/// (`-f`), never on argv, so co-tenant processes cannot read it from the
/// process list.
pub struct IpmitoolDriver {
    command: String,
    timeout: Duration,
}

impl IpmitoolDriver {
    pub fn new() -> Self {
        Self {
            command: "ipmitool".to_string(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_command(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }

    async fn run(&self, bmc: &BmcInfo, subcommand: &[&str]) -> Result<String, OobError> {
        if bmc.ip_address.is_empty() {
            return Err(OobError::Command("BMC IP address is required".to_string()));
        }

        // Keep the password file alive until the child exits.
        let (args, password_file) = build_args(bmc, subcommand)?;

        let mut command = tokio::process::Command::new(&self.command);
        command.args(&args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result?,
            // Dropping the in-flight future kills the child (kill_on_drop).
            Err(_) => return Err(OobError::TimedOut(self.timeout)),
        };

        drop(password_file);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OobError::Command(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for IpmitoolDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutOfBand for IpmitoolDriver {
    async fn power(&self, bmc: &BmcInfo, action: PowerAction) -> Result<String, OobError> {
        self.run(bmc, &["power", action.as_str()]).await
    }

    async fn controller_info(&self, bmc: &BmcInfo) -> Result<BTreeMap<String, String>, OobError> {
        let output = self.run(bmc, &["mc", "info"]).await?;
        Ok(parse_controller_info(&output))
    }

    async fn sensors(&self, bmc: &BmcInfo) -> Result<Vec<SensorReading>, OobError> {
        let output = self.run(bmc, &["sdr", "list"]).await?;
        Ok(parse_sensors(&output))
    }
}

/// Assemble the ipmitool argument vector. The password, when present, is
/// written to a 0600 temp file referenced with `-f`; the file must stay
/// alive until the child exits.
fn build_args(
    bmc: &BmcInfo,
    subcommand: &[&str],
) -> Result<(Vec<String>, Option<tempfile::NamedTempFile>), OobError> {
    let mut args: Vec<String> = vec![
        "-I".to_string(),
        "lanplus".to_string(),
        "-H".to_string(),
        bmc.ip_address.clone(),
        "-U".to_string(),
        bmc.username.clone(),
    ];

    let mut password_file = None;
    if let Some(password) = bmc.password.as_deref().filter(|p| !p.is_empty()) {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(password.as_bytes())?;
        file.flush()?;
        args.push("-f".to_string());
        args.push(file.path().to_string_lossy().into_owned());
        password_file = Some(file);
    }

    if let Some(port) = bmc.port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }

    args.extend(subcommand.iter().map(|s| s.to_string()));
    Ok((args, password_file))
}

/// ipmitool prints "Chassis Power is on" / "Chassis Power is off"; match
/// case-insensitively and fall back to "unknown".
pub fn parse_power_status(output: &str) -> &'static str {
    let lowered = output.to_lowercase();
    if lowered.contains("off") {
        "off"
    } else if lowered.contains("on") {
        "on"
    } else {
        "unknown"
    }
}

/// `mc info` output is `Key : Value` per line.
pub fn parse_controller_info(output: &str) -> BTreeMap<String, String> {
    let mut info = BTreeMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            info.insert(key.to_string(), value.trim().to_string());
        }
    }
    info
}

/// `sdr list` output is `name | value | status` per line.
pub fn parse_sensors(output: &str) -> Vec<SensorReading> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() >= 3 {
                Some(SensorReading {
                    name: parts[0].trim().to_string(),
                    value: parts[1].trim().to_string(),
                    status: parts[2].trim().to_string(),
                })
            } else {
                None
            }
        })
        .collect()
}

/// Scripted stand-in for the external tool, for handler tests.
#[cfg(test)]
pub struct MockOutOfBand {
    pub power_output: Result<String, String>,
}

#[cfg(test)]
#[async_trait]
impl OutOfBand for MockOutOfBand {
    async fn power(&self, _bmc: &BmcInfo, _action: PowerAction) -> Result<String, OobError> {
        self.power_output
            .clone()
            .map_err(OobError::Command)
    }

    async fn controller_info(&self, _bmc: &BmcInfo) -> Result<BTreeMap<String, String>, OobError> {
        Ok(parse_controller_info("Device ID : 32\nFirmware Revision : 7.10"))
    }

    async fn sensors(&self, _bmc: &BmcInfo) -> Result<Vec<SensorReading>, OobError> {
        Ok(parse_sensors("CPU Temp | 45 degrees C | ok"))
    }
}

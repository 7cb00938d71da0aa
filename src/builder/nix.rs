//! Driver for the external declarative-system image builder.
//!
//! The builder is an opaque command: it reads `configuration.nix` from
//! the scratch directory and, on success, leaves `result/kernel` and
//! `result/initrd` behind. Everything else about it is out of scope.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Non-zero exit; carries the combined stdout+stderr.
    #[error("builder exited with an error")]
    Failed { log: String },
    #[error("builder timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to run builder: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image described by `<scratch>/configuration.nix`,
    /// returning the combined build log. Artifacts land under
    /// `<scratch>/result/`.
    async fn build(&self, scratch: &Path) -> Result<String, BuildError>;
}

pub struct NixBuilder {
    command: String,
    timeout: Duration,
}

impl NixBuilder {
    pub fn new(timeout: Duration) -> Self {
        Self {
            command: "nix-build".to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ImageBuilder for NixBuilder {
    async fn build(&self, scratch: &Path) -> Result<String, BuildError> {
        let config_path = scratch.join("configuration.nix");
        let result_path = scratch.join("result");

        let mut command = tokio::process::Command::new(&self.command);
        command
            .arg("<nixpkgs/nixos>")
            .arg("-A")
            .arg("config.system.build.netbootRamdisk")
            .arg("-I")
            .arg(format!("nixos-config={}", config_path.display()))
            .arg("-o")
            .arg(&result_path)
            .current_dir(scratch)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(BuildError::TimedOut(self.timeout)),
        };

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&stderr);
        }

        if output.status.success() {
            Ok(log)
        } else {
            Err(BuildError::Failed { log })
        }
    }
}

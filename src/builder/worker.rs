//! The build worker: a single background loop that drains pending
//! builds FIFO, one per tick, and reconciles build and machine status.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use entity::build::{self, BuildStatus};
use entity::machine::{self, StatusEvent};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::nix::{BuildError, ImageBuilder};

const TICK_PERIOD: Duration = Duration::from_secs(10);

pub struct Worker {
    db: DatabaseConnection,
    builder: Arc<dyn ImageBuilder>,
    build_dir: PathBuf,
    output_dir: PathBuf,
    notify: Arc<Notify>,
}

impl Worker {
    pub fn new(
        db: DatabaseConnection,
        builder: Arc<dyn ImageBuilder>,
        build_dir: PathBuf,
        output_dir: PathBuf,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            db,
            builder,
            build_dir,
            output_dir,
            notify,
        }
    }

    /// Run forever: one pending build per tick, woken early by the
    /// `/build` nudge endpoint.
    pub async fn run(self) {
        tracing::info!("build worker started");
        let mut interval = tokio::time::interval(TICK_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "build tick failed");
            }
        }
    }

    /// Process the oldest pending build, if any.
    pub async fn tick(&self) -> Result<(), sea_orm::DbErr> {
        let Some(pending) = build::Entity::find()
            .filter(build::Column::Status.eq(BuildStatus::Pending))
            .order_by_asc(build::Column::CreatedAt)
            .one(&self.db)
            .await?
        else {
            return Ok(());
        };

        tracing::info!(build_id = %pending.id, machine_id = %pending.machine_id, "processing build");
        let mut active = pending.clone().into_active_model();
        active.status = Set(BuildStatus::Building);
        let building = active.update(&self.db).await?;

        self.process(building).await;
        Ok(())
    }

    async fn process(&self, build: build::Model) {
        let machine = match machine::Entity::find_by_id(build.machine_id.clone())
            .one(&self.db)
            .await
        {
            Ok(Some(machine)) => machine,
            Ok(None) => {
                self.fail(build, "machine not found".to_string(), None).await;
                return;
            }
            Err(err) => {
                self.fail(build, format!("failed to load machine: {err}"), None)
                    .await;
                return;
            }
        };

        let scratch = self.build_dir.join(&build.id);
        if let Err(err) = create_dir_private(&scratch) {
            self.fail(build, format!("failed to create build directory: {err}"), None)
                .await;
            return;
        }

        // Clean up the scratch directory on every exit path.
        let result = self.execute(&build, &machine, &scratch).await;
        if let Err(err) = std::fs::remove_dir_all(&scratch) {
            tracing::warn!(scratch = %scratch.display(), error = %err, "failed to remove build directory");
        }

        match result {
            Ok(log) => self.succeed(build, machine, log).await,
            Err((error, log)) => {
                let machine_id = machine.id.clone();
                self.fail(build, error, log).await;
                self.reconcile_machine(machine_id, StatusEvent::BuildFailed, None)
                    .await;
            }
        }
    }

    /// Write the config, run the builder, publish artifacts. Returns the
    /// build log on success, or an error string plus any captured log.
    async fn execute(
        &self,
        build: &build::Model,
        machine: &machine::Model,
        scratch: &Path,
    ) -> Result<String, (String, Option<String>)> {
        let config_path = scratch.join("configuration.nix");
        if let Err(err) = tokio::fs::write(&config_path, build.config.as_bytes()).await {
            return Err((format!("failed to write configuration: {err}"), None));
        }

        tracing::info!(service_tag = %machine.service_tag, "building system image");
        let log = match self.builder.build(scratch).await {
            Ok(log) => log,
            Err(BuildError::Failed { log }) => {
                return Err(("build failed".to_string(), Some(log)));
            }
            Err(err) => return Err((format!("build failed: {err}"), None)),
        };

        let publish_dir = self.output_dir.join("machines").join(&machine.service_tag);
        if let Err(err) = tokio::fs::create_dir_all(&publish_dir).await {
            return Err((format!("failed to create output directory: {err}"), Some(log)));
        }

        let result_dir = scratch.join("result");
        if let Err(err) = publish(&result_dir.join("kernel"), &publish_dir.join("bzImage")).await {
            return Err((format!("failed to copy kernel: {err}"), Some(log)));
        }
        if let Err(err) = publish(&result_dir.join("initrd"), &publish_dir.join("initrd")).await {
            return Err((format!("failed to copy initrd: {err}"), Some(log)));
        }

        Ok(log)
    }

    async fn succeed(&self, build: build::Model, machine: machine::Model, log: String) {
        let now = Utc::now();
        let build_id = build.id.clone();
        let machine_id = machine.id.clone();
        let artifact_url = format!("/images/machines/{}", machine.service_tag);

        let mut active = build.into_active_model();
        active.status = Set(BuildStatus::Success);
        active.log_output = Set(Some(log));
        active.artifact_url = Set(Some(artifact_url));
        active.completed_at = Set(Some(now));
        if let Err(err) = active.update(&self.db).await {
            tracing::error!(build_id = %build_id, error = %err, "failed to record build success");
            return;
        }

        self.reconcile_machine(machine_id, StatusEvent::BuildSucceeded, Some(build_id.clone()))
            .await;
        tracing::info!(build_id = %build_id, "build completed successfully");
    }

    async fn fail(&self, build: build::Model, error: String, log: Option<String>) {
        tracing::warn!(build_id = %build.id, error = %error, "build failed");
        let mut active = build.into_active_model();
        active.status = Set(BuildStatus::Failed);
        active.error = Set(Some(error));
        if let Some(log) = log {
            active.log_output = Set(Some(log));
        }
        active.completed_at = Set(Some(Utc::now()));
        if let Err(err) = active.update(&self.db).await {
            tracing::error!(error = %err, "failed to record build failure");
        }
    }

    /// Update the machine after a finished build and write the audit
    /// event row.
    async fn reconcile_machine(
        &self,
        machine_id: String,
        event: StatusEvent,
        build_id: Option<String>,
    ) {
        let machine = match machine::Entity::find_by_id(machine_id.clone())
            .one(&self.db)
            .await
        {
            Ok(Some(machine)) => machine,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(machine_id = %machine_id, error = %err, "failed to load machine for reconciliation");
                return;
            }
        };

        let now = Utc::now();
        let old_status = machine.status;
        let new_status = old_status.apply(event);
        let mut active = machine.into_active_model();
        active.status = Set(new_status);
        active.updated_at = Set(now);
        if let Some(build_id) = &build_id {
            active.last_build_id = Set(Some(build_id.clone()));
            active.last_build_time = Set(Some(now));
        }
        if let Err(err) = active.update(&self.db).await {
            tracing::error!(machine_id = %machine_id, error = %err, "failed to update machine after build");
            return;
        }

        let event_name = match event {
            StatusEvent::BuildSucceeded => "machine.build_completed",
            _ => "machine.build_failed",
        };
        let row = entity::machine_event::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            machine_id: Set(machine_id.clone()),
            event: Set(event_name.to_string()),
            data: Set(serde_json::json!({
                "machine_id": machine_id,
                "build_id": build_id,
                "old_status": old_status,
                "new_status": new_status,
            })),
            created_at: Set(now),
            created_by: Set(None),
        };
        if let Err(err) = row.insert(&self.db).await {
            tracing::warn!(machine_id = %machine_id, error = %err, "failed to record build event");
        }
    }
}

/// Scratch directories hold machine configurations; keep them private.
fn create_dir_private(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Copy to a temporary name in the target directory, then rename, so the
/// chain-boot dispatcher never observes a partially written artifact.
async fn publish(src: &Path, dst: &Path) -> std::io::Result<()> {
    let tmp = dst.with_extension("tmp");
    tokio::fs::copy(src, &tmp).await?;
    tokio::fs::rename(&tmp, dst).await
}

//! Machine event catalogue and the dual-path emitter: a durable
//! `machine_events` row plus a webhook fan-out. The two paths are
//! independent; neither failure rolls back the other or the caller.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

use crate::state::AppState;

pub const MACHINE_ENROLLED: &str = "machine.enrolled";
pub const MACHINE_STATUS_CHANGED: &str = "machine.status_changed";
pub const MACHINE_BUILD_STARTED: &str = "machine.build_started";
pub const MACHINE_TEMPLATE_APPLIED: &str = "machine.template_applied";

pub async fn emit(
    state: &AppState,
    machine_id: &str,
    event: &str,
    data: serde_json::Value,
    created_by: Option<String>,
) {
    let row = entity::machine_event::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        machine_id: Set(machine_id.to_string()),
        event: Set(event.to_string()),
        data: Set(data.clone()),
        created_at: Set(Utc::now()),
        created_by: Set(created_by),
    };
    if let Err(err) = row.insert(&state.db).await {
        tracing::warn!(machine_id, event, error = %err, "failed to record machine event");
    }

    state.dispatcher.trigger_event(event, data);
}

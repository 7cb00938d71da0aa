pub mod bulk;
pub mod groups;
pub mod machines;
pub mod metrics;
pub mod power;
pub mod templates;
pub mod users;
pub mod webhooks;

use axum::Extension;
use chrono::Utc;
use serde_json::json;

use crate::auth::Claims;

/// Identity attached to audit records: the authenticated user, or
/// "system" when authentication is disabled.
pub fn actor(claims: &Option<Extension<Claims>>) -> String {
    claims
        .as_ref()
        .map(|Extension(c)| c.user_id.clone())
        .unwrap_or_else(|| "system".to_string())
}

pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "healthy",
        "time": Utc::now().to_rfc3339(),
    }))
}

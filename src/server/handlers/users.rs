//! Login, token refresh, and admin-only user management.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use entity::user::{self, UserRole};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{self, Claims, RequireAdmin};
use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub user: user::Model,
}

/// `POST /login`. Unknown-user and wrong-password attempts produce the
/// same 401 body, with a dummy hash verification keeping latency
/// comparable.
pub async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".to_string(),
        ));
    }

    let user = user::Entity::find()
        .filter(user::Column::Username.eq(req.username.clone()))
        .one(&state.db)
        .await?;

    let Some(user) = user else {
        auth::verify_dummy_password(&req.password);
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    };

    if !user.active {
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    }
    if !auth::verify_password(&req.password, &user.password_hash) {
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    }

    let (token, expires_at) = state
        .jwt
        .issue(&user)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to issue token: {e}")))?;

    let mut active = user.clone().into_active_model();
    active.last_login_at = Set(Some(Utc::now()));
    let user = active.update(&state.db).await?;

    tracing::info!(username = %user.username, "user logged in");
    Ok(Json(LoginResponse {
        token,
        expires_at,
        user,
    }))
}

/// `POST /auth/refresh` — re-issues the presented token with its expiry
/// moved forward.
pub async fn refresh(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = auth::bearer_token(&headers)
        .ok_or_else(|| ApiError::Unauthorized("missing authorization header".to_string()))?;
    let (token, expires_at) = state
        .jwt
        .refresh(token)
        .map_err(|e| ApiError::Unauthorized(e.to_string()))?;
    Ok(Json(json!({ "token": token, "expires_at": expires_at })))
}

/// `GET /auth/me`
pub async fn me(
    State(state): State<AppState>,
    claims: Option<Extension<Claims>>,
) -> Result<Json<user::Model>, ApiError> {
    let Some(Extension(claims)) = claims else {
        return Err(ApiError::Unauthorized("unauthorized".to_string()));
    };
    let user = user::Entity::find_by_id(claims.user_id)
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub role: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    _: RequireAdmin,
    ApiJson(req): ApiJson<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.username.is_empty() || req.email.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username, email, and password are required".to_string(),
        ));
    }
    let role = match req.role.as_deref() {
        None | Some("") => UserRole::Viewer,
        Some(value) => {
            UserRole::parse(value).ok_or_else(|| ApiError::BadRequest("invalid role".to_string()))?
        }
    };

    let existing = user::Entity::find()
        .filter(
            sea_orm::Condition::any()
                .add(user::Column::Username.eq(req.username.clone()))
                .add(user::Column::Email.eq(req.email.clone())),
        )
        .one(&state.db)
        .await?;
    if existing.is_some() {
        return Err(ApiError::Conflict(
            "username or email already exists".to_string(),
        ));
    }

    let now = Utc::now();
    let user = user::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        username: Set(req.username),
        email: Set(req.email),
        password_hash: Set(auth::hash_password(&req.password)?),
        role: Set(role),
        active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        last_login_at: Set(None),
    }
    .insert(&state.db)
    .await?;

    tracing::info!(username = %user.username, role = user.role.as_str(), "created user");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn list(
    State(state): State<AppState>,
    _: RequireAdmin,
) -> Result<Json<Vec<user::Model>>, ApiError> {
    let users = user::Entity::find()
        .order_by_asc(user::Column::Username)
        .all(&state.db)
        .await?;
    Ok(Json(users))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireAdmin,
) -> Result<Json<user::Model>, ApiError> {
    let user = find_user(&state, &id).await?;
    Ok(Json(user))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub role: Option<String>,
    pub active: Option<bool>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _: RequireAdmin,
    ApiJson(req): ApiJson<UpdateUserRequest>,
) -> Result<Json<user::Model>, ApiError> {
    let user = find_user(&state, &id).await?;
    let mut active = user.into_active_model();

    if let Some(email) = req.email.filter(|e| !e.is_empty()) {
        active.email = Set(email);
    }
    if let Some(password) = req.password.filter(|p| !p.is_empty()) {
        active.password_hash = Set(auth::hash_password(&password)?);
    }
    if let Some(role) = req.role.filter(|r| !r.is_empty()) {
        let role =
            UserRole::parse(&role).ok_or_else(|| ApiError::BadRequest("invalid role".to_string()))?;
        active.role = Set(role);
    }
    if let Some(enabled) = req.active {
        active.active = Set(enabled);
    }
    active.updated_at = Set(Utc::now());

    let updated = active.update(&state.db).await?;
    Ok(Json(updated))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    claims: Option<Extension<Claims>>,
    _: RequireAdmin,
) -> Result<StatusCode, ApiError> {
    if let Some(Extension(claims)) = &claims {
        if claims.user_id == id {
            return Err(ApiError::BadRequest("cannot delete yourself".to_string()));
        }
    }
    find_user(&state, &id).await?;
    user::Entity::delete_by_id(id).exec(&state.db).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn find_user(state: &AppState, id: &str) -> Result<user::Model, ApiError> {
    user::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))
}

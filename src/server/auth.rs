//! Password hashing, bearer-token issuance/validation, and the auth
//! middleware layers.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use entity::user::{self, UserRole};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

pub const TOKEN_ISSUER: &str = "metal-enrollment";

/// The placeholder secret shipped in deployment examples. Refused at
/// startup when authentication is enabled.
pub const DEFAULT_SECRET_MARKER: &str = "change-me-in-production";

/// Minimum signing-secret length accepted when authentication is enabled.
pub const MIN_SECRET_BYTES: usize = 32;

/// A valid argon2 hash of a random throwaway password. Login attempts for
/// unknown usernames verify against this so the response timing matches a
/// wrong-password attempt.
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$uFQhU0OyUJN8aIsTv0wpeA$9pzf0Jx7B34/AySNHyC1c5MzJk93T2DGeEBV1diSX4Q";

pub fn hash_password(plain: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hash failed: {e}")))
}

pub fn verify_password(plain: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Equalise timing for logins against unknown usernames.
pub fn verify_dummy_password(plain: &str) {
    let _ = verify_password(plain, DUMMY_HASH);
}

/// Token claims carried in every bearer token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    pub role: UserRole,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub iss: String,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn is_operator(&self) -> bool {
        matches!(self.role, UserRole::Admin | UserRole::Operator)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("malformed token")]
    Malformed,
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                TokenError::InvalidSignature
            }
            _ => TokenError::Malformed,
        }
    }
}

/// Issues and validates HS256 bearer tokens.
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry: Duration,
}

impl JwtManager {
    pub fn new(secret: &[u8], expiry_secs: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            expiry: Duration::seconds(expiry_secs),
        }
    }

    pub fn issue(&self, user: &user::Model) -> Result<(String, DateTime<Utc>), TokenError> {
        let now = Utc::now();
        let expires_at = now + self.expiry;
        let claims = Claims {
            user_id: user.id.clone(),
            username: user.username.clone(),
            role: user.role,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: TOKEN_ISSUER.to_string(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok((token, expires_at))
    }

    /// Rejects any token not signed with HS256 under our secret.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "iss"]);
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }

    /// Re-issue a token with `iat`/`nbf`/`exp` moved forward; the user and
    /// role are copied from the original.
    pub fn refresh(&self, token: &str) -> Result<(String, DateTime<Utc>), TokenError> {
        let mut claims = self.validate(token)?;
        let now = Utc::now();
        let expires_at = now + self.expiry;
        claims.iat = now.timestamp();
        claims.nbf = now.timestamp();
        claims.exp = expires_at.timestamp();
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok((token, expires_at))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Requires a valid `Authorization: Bearer <token>` header; inserts the
/// claims into request extensions for downstream handlers.
pub async fn auth_required(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = match bearer_token(req.headers()) {
        Some(token) => token,
        None => {
            return ApiError::Unauthorized("missing authorization header".to_string())
                .into_response();
        }
    };

    match state.jwt.validate(token) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(err) => ApiError::Unauthorized(err.to_string()).into_response(),
    }
}

/// Parses a bearer token when present; never rejects. Used when auth is
/// disabled so a supplied token still attributes audit records.
pub async fn optional_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if let Some(claims) = bearer_token(req.headers()).and_then(|t| state.jwt.validate(t).ok()) {
        req.extensions_mut().insert(claims);
    }
    next.run(req).await
}

/// Guard extractor: 403 unless the authenticated role is operator or
/// admin. A no-op when authentication is disabled.
pub struct RequireOperator;

#[axum::async_trait]
impl axum::extract::FromRequestParts<AppState> for RequireOperator {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if !state.config.enable_auth {
            return Ok(Self);
        }
        match parts.extensions.get::<Claims>() {
            Some(claims) if claims.is_operator() => Ok(Self),
            Some(_) => Err(ApiError::Forbidden("insufficient permissions".to_string())),
            None => Err(ApiError::Unauthorized("unauthorized".to_string())),
        }
    }
}

/// Guard extractor: 403 unless the authenticated role is admin. A no-op
/// when authentication is disabled.
pub struct RequireAdmin;

#[axum::async_trait]
impl axum::extract::FromRequestParts<AppState> for RequireAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if !state.config.enable_auth {
            return Ok(Self);
        }
        match parts.extensions.get::<Claims>() {
            Some(claims) if claims.is_admin() => Ok(Self),
            Some(_) => Err(ApiError::Forbidden("insufficient permissions".to_string())),
            None => Err(ApiError::Unauthorized("unauthorized".to_string())),
        }
    }
}

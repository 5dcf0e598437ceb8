use std::ops::RangeInclusive;
use std::sync::Arc;

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{debug, info};
use uuid::Uuid;

use streak_db::Database;
use streak_gateway::Dispatcher;
use streak_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::with_db;

const USERNAME_CHARS: RangeInclusive<usize> = 3..=32;
const MIN_PASSWORD_CHARS: usize = 8;
const TOKEN_TTL_DAYS: i64 = 30;

pub type AppState = Arc<AppStateInner>;

/// Shared by every handler: storage, the signing secret for realtime and
/// REST tokens, and the dispatcher new messages are published to.
pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub dispatcher: Dispatcher,
}

/// Create an account and hand back a token usable on both the REST routes
/// and the `/realtime` gateway.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if !USERNAME_CHARS.contains(&req.username.chars().count())
        || req.password.chars().count() < MIN_PASSWORD_CHARS
    {
        return Err(StatusCode::BAD_REQUEST);
    }

    let username = req.username.clone();
    let created = with_db(&state, move |db| {
        if db.get_user_by_username(&req.username)?.is_some() {
            return Ok(None);
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("hashing password: {}", e))?
            .to_string();
        let user_id = Uuid::new_v4();
        db.create_user(&user_id.to_string(), &req.username, &hash)?;
        Ok(Some(user_id))
    })
    .await?;

    let Some(user_id) = created else {
        debug!("Username {} already taken", username);
        return Err(StatusCode::CONFLICT);
    };

    let token = issue(&state, user_id, &username)?;
    info!("Registered {} ({})", username, user_id);
    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

/// Exchange a username and password for a token. Unknown users and wrong
/// passwords are indistinguishable to the caller.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let verified = with_db(&state, move |db| {
        let Some(row) = db.get_user_by_username(&req.username)? else {
            return Ok(None);
        };
        let hash = PasswordHash::new(&row.password)
            .map_err(|e| anyhow::anyhow!("stored hash for {} is corrupt: {}", row.username, e))?;
        if Argon2::default().verify_password(req.password.as_bytes(), &hash).is_err() {
            return Ok(None);
        }
        Ok(Some((row.id.parse::<Uuid>()?, row.username)))
    })
    .await?;

    let (user_id, username) = verified.ok_or(StatusCode::UNAUTHORIZED)?;
    let token = issue(&state, user_id, &username)?;
    debug!("{} logged in", username);
    Ok(Json(LoginResponse {
        user_id,
        username,
        token,
    }))
}

fn issue(state: &AppState, user_id: Uuid, username: &str) -> Result<String, StatusCode> {
    create_token(&state.jwt_secret, user_id, username).map_err(|e| {
        tracing::error!("Signing token for {} failed: {}", username, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Issue an HS256 token for `user_id`, valid for thirty days.
fn create_token(secret: &str, user_id: Uuid, username: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (Utc::now() + Duration::days(TOKEN_TTL_DAYS)).timestamp() as usize,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::debug;

use streak_types::api::{Claims, MarkReadRequest};
use streak_types::models::ConversationKey;

use crate::auth::AppState;
use crate::with_db;

/// The caller's memberships with their read marks.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = claims.sub;
    let memberships = with_db(&state, move |db| db.memberships(user_id)).await?;
    Ok(Json(memberships))
}

/// Move the caller's read mark for one conversation.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(key): Path<ConversationKey>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = claims.sub;
    let updated = with_db(&state, move |db| {
        if let ConversationKey::Group(_) = key {
            if !db.is_member(key, user_id)? {
                return Ok(false);
            }
        }
        db.update_last_read_at(key, user_id, req.read_at)?;
        Ok(true)
    })
    .await?;

    if !updated {
        return Err(StatusCode::FORBIDDEN);
    }
    debug!("{} read {} up to {}", claims.username, key, req.read_at);
    Ok(StatusCode::NO_CONTENT)
}

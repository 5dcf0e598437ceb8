use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use streak_types::api::{Claims, SendMessageRequest};
use streak_types::events::ChangeEvent;
use streak_types::models::{ConversationKey, Message, Recipient};

use crate::auth::AppState;
use crate::with_db;

const MAX_CONTENT_LEN: usize = 4000;

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Only messages created strictly after this instant.
    pub after: Option<DateTime<Utc>>,
}

/// Send a direct or group message and publish it to realtime subscribers.
/// Group messages require membership; a direct recipient must exist.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let content = req
        .content
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    if content.is_none() && req.challenge_id.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if content.as_ref().is_some_and(|c| c.len() > MAX_CONTENT_LEN) {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.recipient == Recipient::User(claims.sub) {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Stored timestamps keep microseconds; match them so every view agrees.
    let message = Message {
        id: Uuid::new_v4(),
        sender_id: claims.sub,
        recipient: req.recipient,
        content,
        challenge_id: req.challenge_id,
        created_at: Utc::now().trunc_subsecs(6),
        read_at: None,
    };

    let stored = message.clone();
    let accepted = with_db(&state, move |db| {
        let allowed = match stored.recipient {
            Recipient::User(id) => db.get_user_by_id(&id.to_string())?.is_some(),
            Recipient::Conversation(id) => db.is_member(ConversationKey::Group(id), stored.sender_id)?,
        };
        if allowed {
            db.insert_message(&stored)?;
        }
        Ok(allowed)
    })
    .await?;

    if !accepted {
        return Err(match message.recipient {
            Recipient::User(_) => StatusCode::NOT_FOUND,
            Recipient::Conversation(_) => StatusCode::FORBIDDEN,
        });
    }

    debug!("{} sent message {}", claims.username, message.id);
    state.dispatcher.publish(ChangeEvent {
        message: message.clone(),
        commit_timestamp: Utc::now(),
    });

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(key): Path<ConversationKey>,
    Query(query): Query<MessagesQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = claims.sub;
    let messages = with_db(&state, move |db| {
        if let ConversationKey::Group(_) = key {
            if !db.is_member(key, user_id)? {
                return Ok(None);
            }
        }
        db.messages_after(user_id, key, query.after).map(Some)
    })
    .await?
    .ok_or(StatusCode::FORBIDDEN)?;

    Ok(Json(messages))
}

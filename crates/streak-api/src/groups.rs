use std::collections::BTreeSet;

use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;
use uuid::Uuid;

use streak_gateway::ConnectionNotice;
use streak_types::api::{Claims, CreateGroupRequest, GroupResponse};

use crate::auth::AppState;
use crate::with_db;

/// Create a group conversation. The creator is always a member; every
/// other member must be a registered user.
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.len() > 64 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let member_ids: Vec<Uuid> = req
        .member_ids
        .iter()
        .copied()
        .chain(std::iter::once(claims.sub))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let id = Uuid::new_v4();
    let group_name = name.clone();
    let members = member_ids.clone();
    let created = with_db(&state, move |db| {
        for member in &members {
            if db.get_user_by_id(&member.to_string())?.is_none() {
                return Ok(false);
            }
        }
        db.create_group(id, &group_name, &members)?;
        Ok(true)
    })
    .await?;

    if !created {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Live inbox subscriptions only resolved their groups at subscribe time.
    for member in &member_ids {
        state
            .dispatcher
            .notify_user(*member, ConnectionNotice::JoinedGroup(id))
            .await;
    }

    info!("{} created group {} ({} members)", claims.username, id, member_ids.len());
    Ok((
        StatusCode::CREATED,
        Json(GroupResponse {
            id,
            name,
            member_ids,
        }),
    ))
}

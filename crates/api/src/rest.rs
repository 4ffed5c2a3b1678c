//! REST handlers that mutate room state: permission changes and suggestion
//! approval. Both may create the room on demand and both gate on the
//! caller's effective role.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{SecondsFormat, Utc};
use coderoom_core::{validate_room_id, Role, UserIdentity};

use crate::{error_response, ApiState};

pub(crate) async fn set_permission(
    State(state): State<ApiState>,
    Path(room_id): Path<String>,
    Extension(caller): Extension<UserIdentity>,
    body: Json<serde_json::Value>,
) -> Response {
    if validate_room_id(&room_id).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "invalid project id");
    }

    let user_id = body
        .get("userId")
        .and_then(|value| value.as_str())
        .filter(|user_id| !user_id.is_empty());
    let role = body
        .get("role")
        .and_then(|value| value.as_str())
        .and_then(|role| role.parse::<Role>().ok());
    let (Some(user_id), Some(role)) = (user_id, role) else {
        return error_response(StatusCode::BAD_REQUEST, "userId and role are required");
    };

    let room = match state.registry.get_or_create(&room_id).await {
        Ok(room) => room,
        Err(error) => {
            tracing::error!(room = %room_id, %error, "room acquisition failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "room unavailable");
        }
    };
    if room.effective_role(&caller) != Role::Admin {
        return error_response(StatusCode::FORBIDDEN, "admin role required");
    }

    // In-memory first: the new role gates SYNC authorization as soon as we
    // respond, regardless of store availability.
    room.set_permission(user_id, role);
    if let Err(error) = state
        .store
        .set_project_permission(&room_id, user_id, role)
        .await
    {
        tracing::warn!(room = %room_id, %error, "permission write to store failed");
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "ok": true, "userId": user_id, "role": role })),
    )
        .into_response()
}

pub(crate) async fn approve_suggestion(
    State(state): State<ApiState>,
    Path((room_id, suggestion_id)): Path<(String, String)>,
    Extension(caller): Extension<UserIdentity>,
) -> Response {
    if validate_room_id(&room_id).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "invalid project id");
    }

    let room = match state.registry.get_or_create(&room_id).await {
        Ok(room) => room,
        Err(error) => {
            tracing::error!(room = %room_id, %error, "room acquisition failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "room unavailable");
        }
    };
    if room.effective_role(&caller) != Role::Admin {
        return error_response(StatusCode::FORBIDDEN, "admin role required");
    }

    let approved_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    if !room
        .approve_suggestion(&suggestion_id, &caller.user_id, &approved_at)
        .await
    {
        return error_response(StatusCode::NOT_FOUND, "suggestion not found");
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "ok": true, "suggestionId": suggestion_id })),
    )
        .into_response()
}

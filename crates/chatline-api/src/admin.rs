use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use chatline_types::api::{
    CacheCleared, FixTriggered, HealthResponse, KickQuery, PhantomQuery, RoomClosed, UserKicked, WorkerPoolsResponse,
};
use chatline_types::events::ServerEvent;
use chatline_types::models::{RestrictionKind, RoomState};

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_PHANTOM_RANGE: Duration = Duration::from_secs(60 * 60);
const DEFAULT_PHANTOM_LIMIT: usize = 100;
const MAX_PHANTOM_LIMIT: usize = 1000;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("health: store ping failed: {}", e);
            false
        }
    };
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if store_ok { "ok" } else { "degraded" }.to_string(),
            node_id: state.node_id.clone(),
            store_ok,
            timestamp: Utc::now(),
        }),
    )
}

pub async fn clear_cache(State(state): State<AppState>, Path(room_id): Path<Uuid>) -> Json<CacheCleared> {
    let cleared = state.cache.clear(room_id);
    info!("admin: cache cleared for room {} (had entries: {})", room_id, cleared);
    Json(CacheCleared { room_id, cleared })
}

pub async fn close_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<RoomClosed>, ApiError> {
    if !state.store.set_room_state(room_id, RoomState::Closed).await? {
        return Err(ApiError::NotFound(format!("room {room_id}")));
    }

    let event = ServerEvent::RoomDeactivated {
        room_id,
        reason: "room closed by an administrator".into(),
    };
    // other instances disconnect their clients when the event reaches them
    if let Err(e) = state.bridge.fan_out(room_id, event).await {
        warn!(room_id = %room_id, "admin: deactivation publish failed: {}", e);
    }
    let disconnected = state.hub.disconnect_room(room_id).await;

    info!("admin: room {} closed, {} local connections dropped", room_id, disconnected);
    Ok(Json(RoomClosed {
        room_id,
        disconnected,
    }))
}

/// Drops a user's live sockets in the room on every instance, optionally
/// banning them first so the gate refuses them on reconnect.
pub async fn kick_user(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<KickQuery>,
) -> Result<Json<UserKicked>, ApiError> {
    if query.duration.is_some() && !query.ban {
        return Err(ApiError::BadRequest("duration only applies to a ban".into()));
    }
    let ban_for = query
        .duration
        .as_deref()
        .map(humantime::parse_duration)
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("invalid duration: {e}")))?;
    if state.store.room(room_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("room {room_id}")));
    }

    let ban_expires_at = match ban_for {
        Some(length) => Some(
            Utc::now()
                + chrono::Duration::from_std(length)
                    .map_err(|_| ApiError::BadRequest("ban duration too long".into()))?,
        ),
        None => None,
    };
    if query.ban {
        state
            .store
            .restrict(room_id, user_id, RestrictionKind::Ban, ban_expires_at)
            .await?;
    }

    let event = ServerEvent::Kicked {
        room_id,
        user_id,
        banned: query.ban,
    };
    if let Err(e) = state.bridge.fan_out(room_id, event).await {
        warn!(room_id = %room_id, "admin: kick publish failed: {}", e);
    }
    let disconnected = state.hub.disconnect_user(room_id, user_id).await;

    info!(
        "admin: user {} kicked from room {} (banned: {}), {} local connections dropped",
        user_id, room_id, query.ban, disconnected
    );
    Ok(Json(UserKicked {
        room_id,
        user_id,
        banned: query.ban,
        ban_expires_at,
        disconnected,
    }))
}

pub async fn room_status(State(state): State<AppState>, Path(room_id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.gate.room_status(room_id).await?))
}

pub async fn worker_pools(State(state): State<AppState>) -> Json<WorkerPoolsResponse> {
    Json(WorkerPoolsResponse {
        delivery_workers: state.pipeline.pool_status(),
        phantom_detector: state.reconciler.status(),
    })
}

pub async fn phantom_messages(
    State(state): State<AppState>,
    Query(query): Query<PhantomQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let window = match query.time_range.as_deref() {
        None | Some("") => DEFAULT_PHANTOM_RANGE,
        Some(raw) => humantime::parse_duration(raw)
            .map_err(|e| ApiError::BadRequest(format!("invalid timeRange {raw:?}: {e}")))?,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PHANTOM_LIMIT)
        .clamp(1, MAX_PHANTOM_LIMIT);

    Ok(Json(state.reconciler.scan(window, limit).await?))
}

/// Starts a fix pass in the background and answers right away.
pub async fn fix_phantom_messages(State(state): State<AppState>) -> impl IntoResponse {
    let reconciler = state.reconciler.clone();
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = reconciler.fix() => match result {
                Ok(summary) => info!(
                    repaired = summary.repaired,
                    still_pending = summary.still_pending,
                    "admin: manual phantom fix finished"
                ),
                Err(e) => error!("admin: manual phantom fix failed: {}", e),
            },
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(FixTriggered {
            message: "phantom message fix started".into(),
            timestamp: Utc::now(),
        }),
    )
}

pub async fn message_status(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .store
        .status(message_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("delivery status for {message_id}")))?;
    Ok(Json(status))
}

pub mod admin;
pub mod error;
pub mod middleware;
pub mod session;
pub mod state;

use axum::Router;
use axum::routing::{get, post};

pub use error::ApiError;
pub use state::{AppState, AppStateInner, CoreConfig};

/// Every HTTP and WebSocket route. Layers such as CORS and tracing are left
/// to the binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(admin::health))
        .route("/ws/{room_id}/{user_id}", get(session::ws_upgrade))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/admin/rooms/{room_id}/cache/clear", post(admin::clear_cache))
        .route("/admin/rooms/{room_id}/close", post(admin::close_room))
        .route("/admin/rooms/{room_id}/status", get(admin::room_status))
        .route("/admin/rooms/{room_id}/users/{user_id}/kick", post(admin::kick_user))
        .route("/admin/fix-phantom-messages", post(admin::fix_phantom_messages))
        .route("/admin/message-status/{message_id}", get(admin::message_status))
        .route("/health/worker-pools", get(admin::worker_pools))
        .route("/health/phantom-messages", get(admin::phantom_messages))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::require_admin))
        .with_state(state);

    Router::new().merge(public_routes).merge(admin_routes)
}

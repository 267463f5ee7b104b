use crate::server::RelayState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use relay_core::{EventKind, RelayEvent, ThreadId};
use std::sync::Arc;
use tokio::time::Instant;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/relay/status", get(get_status))
        .route(
            "/api/v1/relay/locks/{thread_id}/release",
            post(release_lock),
        )
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(state): Extension<Arc<RelayState>>) -> Json<serde_json::Value> {
    let now = Instant::now();
    let dispatcher = &state.dispatcher;
    Json(serde_json::json!({
        "destinations": dispatcher.governor().snapshot(now),
        "locks": dispatcher.locks().held(),
        "stats": state.stats.snapshot(),
        "streaming": dispatcher.config(),
    }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn release_lock(
    Extension(state): Extension<Arc<RelayState>>,
    Path(thread_id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let thread_id = ThreadId::new(thread_id);
    let Some(released) = state.dispatcher.locks().force_release(&thread_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "not_found",
                "thread_id": thread_id,
            })),
        );
    };

    let held_for_ms = released.held_for.as_millis() as u64;
    state.dispatcher.events().emit(
        RelayEvent::new(EventKind::LockForceReleased { held_for_ms })
            .session(released.owner)
            .thread(&released.thread_id),
    );
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "released",
            "thread_id": released.thread_id,
            "owner": released.owner,
            "held_for_ms": held_for_ms,
        })),
    )
}

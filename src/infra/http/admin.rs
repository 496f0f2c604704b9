use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::load::LoadMonitor;
use crate::store::EphemeralStore;

#[derive(Clone)]
pub struct AdminState {
    pub load: LoadMonitor,
    pub cache: CacheStore,
    pub store: Arc<dyn EphemeralStore>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    overloaded: bool,
    lag_ms: u64,
    store: &'static str,
}

#[derive(Debug, Deserialize)]
struct InvalidateBody {
    prefix: String,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(admin_health))
        .route("/cache/invalidate", post(invalidate_cache))
        .route("/cache/clear", post(clear_cache))
        .with_state(state)
}

async fn admin_health(State(state): State<AdminState>) -> Json<HealthBody> {
    let store = match state.store.ping().await {
        Ok(()) => "ok",
        Err(err) => {
            warn!(
                target: "soffio_guard::store",
                op = "ping",
                error = %err,
                "store health check failed"
            );
            "unavailable"
        }
    };

    Json(HealthBody {
        overloaded: state.load.is_overloaded(),
        lag_ms: state.load.lag_ms(),
        store,
    })
}

async fn invalidate_cache(
    State(state): State<AdminState>,
    Json(body): Json<InvalidateBody>,
) -> Response {
    let removed = state.cache.invalidate(&body.prefix).await;
    info!(
        target: "soffio_guard::cache",
        prefix = %body.prefix,
        removed,
        "cache invalidated via admin"
    );
    StatusCode::NO_CONTENT.into_response()
}

async fn clear_cache(State(state): State<AdminState>) -> Response {
    state.cache.clear().await;
    info!(target: "soffio_guard::cache", "cache cleared via admin");
    StatusCode::NO_CONTENT.into_response()
}

mod admin;
mod middleware;
mod proxy;

pub use admin::{AdminState, build_admin_router};
pub use middleware::{RequestContext, log_responses, set_request_context};
pub use proxy::{UpstreamProxy, proxy_request};

use axum::{Router, middleware::from_fn, middleware::from_fn_with_state};

use crate::pipeline::{RequestPipeline, guard_layer};

/// Public router: every request passes the guard before being proxied upstream.
pub fn build_router(pipeline: RequestPipeline, proxy: UpstreamProxy) -> Router {
    Router::new()
        .fallback(proxy_request)
        .with_state(proxy)
        .layer(from_fn_with_state(pipeline, guard_layer))
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
}

//! Axum middleware running the guard in front of the wrapped router.
//!
//! Only `2xx` JSON responses without `set-cookie` are captured for the cache, and
//! only when their body fits `cache.max_body_bytes`.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::cache::CachedResponse;
use crate::error::ErrorReport;
use crate::rate_limit::{Admission, Verdict};

use super::{CachePlan, CacheStatus, GuardRequest, Rejection, RequestPipeline};

pub const CACHE_STATUS_HEADER: &str = "x-cache";
const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

const OVERLOADED_MESSAGE: &str = "Server is under heavy load, please retry shortly.";

/// Outcome label attached to response extensions for request logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardOutcome(pub &'static str);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitedBody<'a> {
    error: &'a str,
    retry_after_seconds: u64,
}

#[derive(Serialize)]
struct OverloadedBody<'a> {
    error: &'a str,
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn guard_layer(
    State(pipeline): State<RequestPipeline>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let config = pipeline.request_config();
    if !config.trust_identity_header {
        // Client-supplied identity must not reach the origin either.
        parts.headers.remove(config.identity_header.as_str());
    }
    let guard_request = GuardRequest::from_parts(&parts, config);
    let request = Request::from_parts(parts, body);

    let admission = match pipeline.admit(&guard_request).await {
        Ok(admission) => admission,
        Err(rejection) => return rejection.into_response(),
    };

    let plan = pipeline.plan_cache(&guard_request);
    if let Some(cached) = pipeline.lookup(&plan).await {
        debug!(target: "soffio_guard::pipeline", outcome = "hit", "serving cached response");
        let mut response = cached_response(cached);
        finish(&mut response, &admission, CacheStatus::Hit, "served_from_cache");
        return response;
    }

    let response = next.run(request).await;
    let (mut response, status) = match &plan {
        CachePlan::Lookup { .. } => (capture(&pipeline, &plan, response).await, CacheStatus::Miss),
        CachePlan::Skip | CachePlan::Bypass => (response, CacheStatus::Bypass),
    };
    finish(&mut response, &admission, status, "served_from_origin");
    response
}

fn finish(response: &mut Response, admission: &Admission, cache: CacheStatus, outcome: &'static str) {
    if let Some(verdict) = admission.most_constrained() {
        insert_rate_headers(response.headers_mut(), verdict);
    }
    response.headers_mut().insert(
        CACHE_STATUS_HEADER,
        HeaderValue::from_static(cache.as_str()),
    );
    response.extensions_mut().insert(GuardOutcome(outcome));
}

fn insert_rate_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(verdict.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(verdict.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(verdict.reset_secs));
}

fn cached_response(cached: CachedResponse) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    (status, Json(cached.body)).into_response()
}

fn is_capturable(response: &Response, max_body_bytes: usize) -> bool {
    if !response.status().is_success() || response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }

    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    if !is_json {
        return false;
    }

    // Unknown length is checked again after buffering.
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .is_none_or(|length| length <= max_body_bytes)
}

/// Buffer a successful JSON origin response and hand it to the cache.
async fn capture(pipeline: &RequestPipeline, plan: &CachePlan, response: Response) -> Response {
    let Some(max_body_bytes) = pipeline.cache().map(|cache| cache.config().max_body_bytes) else {
        return response;
    };
    if !is_capturable(&response, max_body_bytes) {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            debug!(
                target: "soffio_guard::pipeline",
                error = %err,
                "failed to buffer origin response; not caching"
            );
            let mut response = Response::from_parts(parts, Body::empty());
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            ErrorReport::from_message(
                "pipeline::capture",
                StatusCode::BAD_GATEWAY,
                format!("origin body failed: {err}"),
            )
            .attach(&mut response);
            return response;
        }
    };

    if bytes.len() <= max_body_bytes {
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(body) => {
                pipeline.populate(plan, &CachedResponse::new(parts.status.as_u16(), body));
            }
            Err(err) => debug!(
                target: "soffio_guard::pipeline",
                error = %err,
                "origin body is not valid JSON; not caching"
            ),
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let (mut response, retry_after_secs, detail) = match &self {
            Rejection::Overloaded { retry_after_secs } => (
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(OverloadedBody {
                        error: OVERLOADED_MESSAGE,
                    }),
                )
                    .into_response(),
                *retry_after_secs,
                format!("overloaded: retry_after={retry_after_secs}"),
            ),
            Rejection::RateLimited {
                retry_after_secs,
                message,
                verdict,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(RateLimitedBody {
                        error: message,
                        retry_after_seconds: *retry_after_secs,
                    }),
                )
                    .into_response();
                let tier = verdict.as_ref().map_or("", |verdict| verdict.tier.as_str());
                if let Some(verdict) = verdict {
                    insert_rate_headers(response.headers_mut(), verdict);
                }
                (
                    response,
                    *retry_after_secs,
                    format!("rate_limited: tier={tier} retry_after={retry_after_secs}"),
                )
            }
        };

        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        let outcome = match self {
            Rejection::Overloaded { .. } => "rejected_overloaded",
            Rejection::RateLimited { .. } => "rejected_rate_limited",
        };
        response.extensions_mut().insert(GuardOutcome(outcome));
        let status = response.status();
        ErrorReport::from_message("pipeline::guard", status, detail).attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_response(status: StatusCode, length: Option<usize>) -> Response {
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(length) = length {
            builder = builder.header(header::CONTENT_LENGTH, length);
        }
        builder.body(Body::from("{}")).unwrap()
    }

    #[test]
    fn capturable_requires_small_successful_json() {
        assert!(is_capturable(&json_response(StatusCode::OK, None), 1024));
        assert!(is_capturable(&json_response(StatusCode::OK, Some(10)), 1024));
        assert!(!is_capturable(&json_response(StatusCode::OK, Some(4096)), 1024));
        assert!(!is_capturable(&json_response(StatusCode::NOT_FOUND, None), 1024));

        let html = Response::builder()
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::empty())
            .unwrap();
        assert!(!is_capturable(&html, 1024));

        let mut cookie = json_response(StatusCode::OK, None);
        cookie
            .headers_mut()
            .insert(header::SET_COOKIE, HeaderValue::from_static("a=b"));
        assert!(!is_capturable(&cookie, 1024));
    }

    #[tokio::test]
    async fn rate_limited_rejection_shape() {
        let response = Rejection::RateLimited {
            retry_after_secs: 7,
            message: "slow down".to_string(),
            verdict: None,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
        assert!(response.extensions().get::<ErrorReport>().is_some());

        let body = BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "error": "slow down", "retryAfterSeconds": 7 })
        );
    }

    #[tokio::test]
    async fn overloaded_rejection_shape() {
        let response = Rejection::Overloaded {
            retry_after_secs: 1,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert_eq!(
            response.extensions().get::<GuardOutcome>(),
            Some(&GuardOutcome("rejected_overloaded"))
        );
    }
}

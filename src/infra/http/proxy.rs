//! Forwarding handler that relays guarded requests to the upstream origin.

use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderMap, HeaderName, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::error::ErrorReport;
use crate::infra::error::InfraError;

const MAX_FORWARD_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct UpstreamProxy {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamProxy {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn target_url(&self, request: &Request<Body>) -> String {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map_or("/", |value| value.as_str());
        format!("{}{}", self.base_url, path_and_query)
    }

    async fn forward(&self, request: Request<Body>) -> Result<Response, InfraError> {
        let url = self.target_url(&request);
        let (parts, body) = request.into_parts();
        let body = to_bytes(body, MAX_FORWARD_BODY_BYTES)
            .await
            .map_err(|err| InfraError::upstream(format!("failed to read request body: {err}")))?;

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(strip_hop_by_hop(parts.headers))
            .body(body)
            .send()
            .await
            .map_err(|err| InfraError::upstream(format!("{url}: {err}")))?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers().clone());
        let bytes = upstream
            .bytes()
            .await
            .map_err(|err| InfraError::upstream(format!("{url}: failed to read body: {err}")))?;

        debug!(
            target: "soffio_guard::http::proxy",
            url = %url,
            status = status.as_u16(),
            bytes = bytes.len(),
            "upstream responded"
        );

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}

pub async fn proxy_request(State(proxy): State<UpstreamProxy>, request: Request<Body>) -> Response {
    match proxy.forward(request).await {
        Ok(response) => response,
        Err(err) => {
            let mut response = (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response();
            ErrorReport::from_error("infra::http::proxy", StatusCode::BAD_GATEWAY, &err)
                .attach(&mut response);
            response
        }
    }
}

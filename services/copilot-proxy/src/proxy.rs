//! Completion API forwarding
//!
//! Each inbound request is dispatched through the failover coordinator: the
//! coordinator picks the credential and bearer, this module makes the
//! outbound call and reports how it went. Success bodies are streamed back
//! as they arrive, completion bodies through a usage meter; failures are
//! buffered so they can be classified.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use copilot_auth::EDITOR_VERSION_HEADER;
use copilot_pool::{Attempt, CallOutcome, FailoverCoordinator, classify_response};
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use crate::error::ProxyError;
use crate::limits::RequestLimiter;
use crate::metrics;
use crate::usage::{UsageLedger, UsageMeter, metered};

/// Headers to strip from relayed responses (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Maximum accepted request body
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Which upstream API a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ChatCompletions,
    Models,
}

impl Route {
    fn path(self) -> &'static str {
        match self {
            Route::ChatCompletions => "/chat/completions",
            Route::Models => "/models",
        }
    }
}

/// Shared state for the proxy handlers
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub coordinator: FailoverCoordinator,
    pub chat_completions_url: String,
    pub models_url: String,
    pub editor_version: String,
    pub limiter: Arc<RequestLimiter>,
    pub usage: Arc<UsageLedger>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

impl ProxyState {
    /// Upstream URL for `route`, preferring the endpoint the bearer advertises.
    fn url_for(&self, route: Route, attempt: &Attempt) -> String {
        match &attempt.bearer.api_endpoint {
            Some(api) => format!("{api}{}", route.path()),
            None => match route {
                Route::ChatCompletions => self.chat_completions_url.clone(),
                Route::Models => self.models_url.clone(),
            },
        }
    }
}

#[derive(Deserialize)]
struct CompletionRequest {
    #[serde(default)]
    model: String,
}

/// POST /chat/completions
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn chat_completions(state: &ProxyState, body: Bytes, request_id: String) -> Response {
    let start = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match forward_completion(state, body).await {
        Ok(response) => response,
        Err(e) => fail(state, e, &request_id),
    };
    metrics::record_request(
        response.status().as_u16(),
        Method::POST.as_str(),
        start.elapsed().as_secs_f64(),
    );
    response
}

async fn forward_completion(state: &ProxyState, body: Bytes) -> Result<Response, ProxyError> {
    let request: CompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("body is not valid JSON: {e}")))?;

    let waited = state
        .limiter
        .acquire(&request.model)
        .await
        .map_err(|e| ProxyError::RateLimited(e.to_string()))?;
    if !waited.is_zero() {
        info!(model = %request.model, waited_ms = waited.as_millis() as u64, "request delayed by rate limit");
    }

    let dispatched = state
        .coordinator
        .dispatch(|attempt| {
            let url = state.url_for(Route::ChatCompletions, &attempt);
            let outbound = state
                .client
                .post(url)
                .bearer_auth(&attempt.bearer.token)
                .header(EDITOR_VERSION_HEADER, &state.editor_version)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .body(body.clone());
            let meter = UsageMeter::new(request.model.as_str(), state.usage.clone());
            send(outbound, attempt, Some(meter))
        })
        .await?;

    info!(
        model = %request.model,
        credential = dispatched.index,
        hops = dispatched.hops,
        status = dispatched.value.status().as_u16(),
        "completion forwarded"
    );
    Ok(dispatched.value)
}

/// GET /models
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn models(state: &ProxyState, request_id: String) -> Response {
    let start = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let result = state
        .coordinator
        .dispatch(|attempt| {
            let url = state.url_for(Route::Models, &attempt);
            let outbound = state
                .client
                .get(url)
                .bearer_auth(&attempt.bearer.token)
                .header(EDITOR_VERSION_HEADER, &state.editor_version)
                .header(reqwest::header::ACCEPT, "application/json");
            send(outbound, attempt, None)
        })
        .await;

    let response = match result {
        Ok(dispatched) => dispatched.value,
        Err(e) => fail(state, e.into(), &request_id),
    };
    metrics::record_request(
        response.status().as_u16(),
        Method::GET.as_str(),
        start.elapsed().as_secs_f64(),
    );
    response
}

fn fail(state: &ProxyState, err: ProxyError, request_id: &str) -> Response {
    state.errors_total.fetch_add(1, Ordering::Relaxed);
    match &err {
        ProxyError::PoolExhausted(_) | ProxyError::Internal(_) => {
            error!(error = %err, "request failed")
        }
        _ => warn!(error = %err, "request rejected"),
    }
    err.into_response_with_id(request_id)
}

/// Make one outbound call and classify the outcome.
async fn send(
    request: reqwest::RequestBuilder,
    attempt: Attempt,
    meter: Option<UsageMeter>,
) -> CallOutcome<Response> {
    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            metrics::record_upstream_error(metrics::transport_error_type(&e));
            return CallOutcome::Transient(format!("upstream request failed: {e}"));
        }
    };

    let status = upstream.status();
    let headers = upstream.headers().clone();
    if status.is_success() {
        let stream = Box::pin(upstream.bytes_stream());
        let body = match meter {
            Some(meter) => Body::from_stream(metered(stream, meter)),
            None => Body::from_stream(stream),
        };
        return CallOutcome::Success(relay(status, &headers, body));
    }

    let text = match upstream.text().await {
        Ok(text) => text,
        Err(e) => {
            metrics::record_upstream_error(metrics::transport_error_type(&e));
            return CallOutcome::Transient(format!("upstream response read error: {e}"));
        }
    };
    let verdict = classify_response(status.as_u16(), &text);
    if !matches!(verdict, copilot_pool::Verdict::Healthy) {
        metrics::record_upstream_error(&format!("status_{}", status.as_u16()));
        warn!(
            credential = attempt.index,
            status = status.as_u16(),
            try_number = attempt.try_number,
            "upstream rejected call"
        );
    }
    CallOutcome::from_verdict(verdict, relay(status, &headers, Body::from(text)))
}

/// Build the client response, copying upstream headers except hop-by-hop ones.
fn relay(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response.body(body).unwrap_or_else(|e| {
        ProxyError::Internal(format!("response build error: {e}")).into_response_with_id("-")
    })
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("X-Request-Id"));
    }

    #[test]
    fn relay_strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("x-upstream", "yes".parse().unwrap());
        let resp = relay(StatusCode::IM_A_TEAPOT, &headers, Body::empty());
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
        assert!(resp.headers().get("connection").is_none());
        assert_eq!(resp.headers()["x-upstream"], "yes");
    }
}

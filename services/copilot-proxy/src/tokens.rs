//! Credential dashboard API
//!
//! Endpoints:
//! - GET  /tokens               — snapshot of every credential
//! - POST /tokens/{index}       — make `index` current
//! - POST /tokens/{index}/reset — clear `Error` on `index`
//!
//! Snapshots never carry refresh credentials, only their public id.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use copilot_pool::StatusApi;
use tracing::{info, warn};

use crate::error::TokenApiError;

/// Build the `/tokens` router. Generic over the outer router's state so it
/// can be merged into the main app.
pub fn router<S>(status: StatusApi) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/tokens", get(list_tokens))
        .route("/tokens/{index}", post(switch_token))
        .route("/tokens/{index}/reset", post(reset_token))
        .with_state(status)
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn to_json<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => TokenApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("failed to serialize response: {e}"),
            error_details: None,
        }
        .into_response(),
    }
}

fn parse_index(raw: &str) -> Result<usize, TokenApiError> {
    raw.parse().map_err(|_| TokenApiError {
        status: StatusCode::BAD_REQUEST,
        message: format!("token index must be a non-negative integer, got: {raw}"),
        error_details: None,
    })
}

/// GET /tokens
async fn list_tokens(State(status): State<StatusApi>) -> Response {
    to_json(&status.list().await)
}

/// POST /tokens/{index}
async fn switch_token(State(status): State<StatusApi>, Path(raw): Path<String>) -> Response {
    let index = match parse_index(&raw) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };
    match status.switch_to(index).await {
        Ok(view) => {
            info!(index, "token switched via API");
            to_json(&view)
        }
        Err(e) => {
            warn!(index, error = %e, "token switch rejected");
            TokenApiError::from(e).into_response()
        }
    }
}

/// POST /tokens/{index}/reset
async fn reset_token(State(status): State<StatusApi>, Path(raw): Path<String>) -> Response {
    let index = match parse_index(&raw) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };
    match status.reset(index).await {
        Ok(view) => {
            info!(index, "token reset via API");
            to_json(&view)
        }
        Err(e) => TokenApiError::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use copilot_auth::{ErrorKind, TokenClient, UpstreamErrorBody};
    use copilot_pool::{Pool, PoolConfig, Rejection};
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Pool whose token endpoint is never reached by these tests.
    fn test_pool(secrets: &[&str]) -> Pool {
        let client = TokenClient::new(reqwest::Client::new(), "http://127.0.0.1:1/token", "vscode/test");
        let config = PoolConfig::new(secrets.iter().map(|s| (*s).into()).collect());
        Pool::new(config, Arc::new(client)).unwrap()
    }

    fn app(pool: &Pool) -> Router {
        router(pool.status().clone())
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn list_returns_public_snapshot() {
        let pool = test_pool(&["gho_aaaaaaaaaaaa", "gho_bbbbbbbbbbbb"]);
        let (status, json) = call(app(&pool), "GET", "/tokens").await;

        assert_eq!(status, StatusCode::OK);
        let tokens = json.as_array().unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0]["id"], "gho_aaaa...");
        assert_eq!(tokens[0]["status"], "Active");
        assert_eq!(tokens[0]["is_current"], true);
        assert_eq!(tokens[1]["status"], "Inactive");
        assert!(tokens[1]["expiration"].is_null());
        assert!(!json.to_string().contains("gho_aaaaaaaaaaaa"));
    }

    #[tokio::test]
    async fn switch_returns_updated_snapshot() {
        let pool = test_pool(&["a", "b", "c"]);
        let (status, json) = call(app(&pool), "POST", "/tokens/2").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["index"], 2);
        assert_eq!(json["is_current"], true);

        let (_, list) = call(app(&pool), "GET", "/tokens").await;
        let current: Vec<u64> = list
            .as_array()
            .unwrap()
            .iter()
            .filter(|t| t["is_current"] == true)
            .map(|t| t["index"].as_u64().unwrap())
            .collect();
        assert_eq!(current, vec![2]);
    }

    #[tokio::test]
    async fn switch_to_errored_token_is_409_with_details() {
        let pool = test_pool(&["a", "b"]);
        let rejection = Rejection::new(
            ErrorKind::RateLimited,
            UpstreamErrorBody::Structured {
                message: "Rate limit exceeded".into(),
                url: Some("https://docs.example/limits".into()),
                title: Some("Too many requests".into()),
            },
        );
        pool.coordinator().report_failure(1, &rejection).await.unwrap();

        let (status, json) = call(app(&pool), "POST", "/tokens/1").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["message"].as_str().unwrap().contains("credential 1"));
        assert_eq!(json["error_details"]["url"], "https://docs.example/limits");
        assert_eq!(pool.store().current_index().await, 0);

        let (_, list) = call(app(&pool), "GET", "/tokens").await;
        assert_eq!(list[1]["status"], "Error");
        assert_eq!(list[1]["error_message"]["kind"], "rate_limited");
    }

    #[tokio::test]
    async fn bad_index_is_400_with_message() {
        let pool = test_pool(&["a"]);

        let (status, json) = call(app(&pool), "POST", "/tokens/7").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["message"].is_string());

        let (status, json) = call(app(&pool), "POST", "/tokens/first").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["message"].as_str().unwrap().contains("first"));
    }

    #[tokio::test]
    async fn reset_clears_error() {
        let pool = test_pool(&["a", "b"]);
        let rejection = Rejection::new(ErrorKind::Revoked, UpstreamErrorBody::opaque("revoked"));
        pool.coordinator().report_failure(1, &rejection).await.unwrap();

        let (status, json) = call(app(&pool), "POST", "/tokens/1/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "Inactive");
        assert!(json.get("error_message").is_none());

        let (status, _) = call(app(&pool), "POST", "/tokens/1").await;
        assert_eq!(status, StatusCode::OK);
    }
}

//! Token usage accounting
//!
//! Completion responses carry a `usage` object (`prompt_tokens`,
//! `completion_tokens`), either in the final SSE event of a stream or in the
//! JSON body of a non-streaming reply. `UsageMeter` watches the relayed body
//! as it passes through and records the totals in the `UsageLedger` once the
//! body ends. The ledger is in-memory only and keeps a bounded history; it
//! backs token rate limits and `GET /usage`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::TokenApiError;
use crate::metrics;

/// Minimum history kept for `GET /usage`.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Bodies and event lines larger than this are not inspected for usage.
const MAX_BUFFERED_BODY: usize = 1024 * 1024;

/// Token totals over some period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub record_count: u64,
}

impl TokenUsage {
    fn add(&mut self, input: u64, output: u64) {
        self.input_tokens += input;
        self.output_tokens += output;
        self.total_tokens += input + output;
        self.record_count += 1;
    }
}

#[derive(Debug)]
struct UsageRecord {
    at: Instant,
    model: String,
    input: u64,
    output: u64,
}

/// Recent per-model token usage.
pub struct UsageLedger {
    retention: Duration,
    records: Mutex<VecDeque<UsageRecord>>,
}

impl UsageLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn record(&self, model: &str, input: u64, output: u64) {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        while records
            .front()
            .is_some_and(|r| now.duration_since(r.at) > self.retention)
        {
            records.pop_front();
        }
        records.push_back(UsageRecord {
            at: now,
            model: model.to_string(),
            input,
            output,
        });
        drop(records);

        metrics::record_token_usage(model, input, output);
        info!(model, input_tokens = input, output_tokens = output, "token usage recorded");
    }

    /// Usage of `model` within the last `window`.
    pub async fn usage_within(&self, model: &str, window: Duration) -> TokenUsage {
        let now = Instant::now();
        let records = self.records.lock().await;
        let mut usage = TokenUsage::default();
        for r in records
            .iter()
            .rev()
            .take_while(|r| now.duration_since(r.at) <= window)
            .filter(|r| r.model == model)
        {
            usage.add(r.input, r.output);
        }
        usage
    }

    /// Per-model usage within the last `window`.
    pub async fn summary(&self, window: Duration) -> BTreeMap<String, TokenUsage> {
        let now = Instant::now();
        let records = self.records.lock().await;
        let mut by_model: BTreeMap<String, TokenUsage> = BTreeMap::new();
        for r in records
            .iter()
            .rev()
            .take_while(|r| now.duration_since(r.at) <= window)
        {
            by_model.entry(r.model.clone()).or_default().add(r.input, r.output);
        }
        by_model
    }
}

/// Watches one completion body for its `usage` totals.
pub struct UsageMeter {
    model: String,
    ledger: Arc<UsageLedger>,
    line: Vec<u8>,
    saw_events: bool,
    /// Whole body, kept until the first SSE event shows it is a stream
    body: Option<Vec<u8>>,
    input: u64,
    output: u64,
    found: bool,
}

impl UsageMeter {
    pub fn new(model: impl Into<String>, ledger: Arc<UsageLedger>) -> Self {
        Self {
            model: model.into(),
            ledger,
            line: Vec::new(),
            saw_events: false,
            body: Some(Vec::new()),
            input: 0,
            output: 0,
            found: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if let Some(body) = self.body.as_mut() {
            if body.len() + chunk.len() > MAX_BUFFERED_BODY {
                self.body = None;
            } else {
                body.extend_from_slice(chunk);
            }
        }
        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.event_line(&line);
            } else if self.line.len() < MAX_BUFFERED_BODY {
                self.line.push(byte);
            }
        }
    }

    fn event_line(&mut self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            return;
        };
        let Some(payload) = line.trim_end_matches('\r').strip_prefix("data:") else {
            return;
        };
        self.saw_events = true;
        self.body = None;
        let payload = payload.trim();
        if payload == "[DONE]" {
            return;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
            self.add_usage(&value);
        }
    }

    fn add_usage(&mut self, value: &serde_json::Value) {
        let Some(usage) = value.get("usage").filter(|u| u.is_object()) else {
            return;
        };
        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        self.input += field("prompt_tokens");
        self.output += field("completion_tokens");
        self.found = true;
    }

    /// Totals seen so far, `None` if the body carried no usage.
    pub fn totals(&mut self) -> Option<(u64, u64)> {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.event_line(&line);
        }
        if !self.saw_events
            && let Some(body) = self.body.take()
            && let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body)
        {
            self.add_usage(&value);
        }
        self.found.then_some((self.input, self.output))
    }

    async fn finish(mut self) {
        match self.totals() {
            Some((input, output)) => self.ledger.record(&self.model, input, output).await,
            None => debug!(model = %self.model, "completion carried no usage"),
        }
    }
}

/// Pass `inner` through unchanged, recording usage when it ends.
///
/// A body that is dropped before its end (client went away) records nothing.
pub fn metered<S, E>(inner: S, meter: UsageMeter) -> impl Stream<Item = Result<Bytes, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    futures_util::stream::unfold(
        (inner, Some(meter)),
        |(mut inner, mut meter)| async move {
            match inner.next().await {
                Some(item) => {
                    if let (Ok(bytes), Some(m)) = (&item, meter.as_mut()) {
                        m.feed(bytes);
                    }
                    Some((item, (inner, meter)))
                }
                None => {
                    if let Some(m) = meter.take() {
                        m.finish().await;
                    }
                    None
                }
            }
        },
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageReport {
    pub hours: u64,
    pub models: BTreeMap<String, TokenUsage>,
    pub total: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct UsageParams {
    hours: Option<String>,
    model: Option<String>,
}

/// `GET /usage?hours=N&model=M`
pub fn router<S>(ledger: Arc<UsageLedger>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/usage", get(usage_report))
        .with_state(ledger)
}

fn bad_request(message: String) -> Response {
    TokenApiError {
        status: StatusCode::BAD_REQUEST,
        message,
        error_details: None,
    }
    .into_response()
}

async fn usage_report(
    State(ledger): State<Arc<UsageLedger>>,
    Query(params): Query<UsageParams>,
) -> Response {
    let max_hours = ledger.retention().as_secs() / 3600;
    let hours = match params.hours.as_deref().map(str::parse::<u64>) {
        None => 1,
        Some(Ok(h)) if (1..=max_hours).contains(&h) => h,
        Some(_) => {
            return bad_request(format!(
                "hours must be an integer between 1 and {max_hours}"
            ));
        }
    };

    let mut models = ledger.summary(Duration::from_secs(hours * 3600)).await;
    if let Some(model) = params.model.as_deref() {
        models.retain(|name, _| name == model);
    }
    let mut total = TokenUsage::default();
    for usage in models.values() {
        total.input_tokens += usage.input_tokens;
        total.output_tokens += usage.output_tokens;
        total.total_tokens += usage.total_tokens;
        total.record_count += usage.record_count;
    }

    let report = UsageReport {
        hours,
        models,
        total,
    };
    match serde_json::to_string(&report) {
        Ok(body) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => TokenApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("failed to serialize response: {e}"),
            error_details: None,
        }
        .into_response(),
    }
}

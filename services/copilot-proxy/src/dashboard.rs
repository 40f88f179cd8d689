//! Dashboard client for the `/tokens` API
//!
//! Used by the `tokens` and `switch` subcommands and by anything that wants a
//! periodically refreshed view of the pool. The server's state is
//! authoritative; the client only reads snapshots and asks for switches.

use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::usage::UsageReport;

/// Default address of a locally running proxy.
pub const DEFAULT_URL: &str = "http://127.0.0.1:15432";

/// Snapshot entry as returned by `GET /tokens`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenInfo {
    pub id: String,
    pub index: usize,
    pub status: String,
    pub is_current: bool,
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<serde_json::Value>,
}

impl TokenInfo {
    pub fn is_error(&self) -> bool {
        self.status == "Error"
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    error_details: Option<ApiErrorDetails>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetails {
    message: String,
    #[serde(default)]
    url: Option<String>,
}

/// Outcome of a cascading switch.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchReport {
    /// Index that became current
    pub index: usize,
    /// Indices tried and refused before it, with the server's reason
    pub skipped: Vec<(usize, String)>,
}

#[derive(Clone)]
pub struct DashboardClient {
    http: reqwest::Client,
    base_url: String,
}

impl DashboardClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn list(&self) -> anyhow::Result<Vec<TokenInfo>> {
        let response = self
            .http
            .get(format!("{}/tokens", self.base_url))
            .send()
            .await
            .context("failed to reach proxy")?;
        if !response.status().is_success() {
            bail!("listing tokens failed: HTTP {}", response.status());
        }
        response.json().await.context("invalid /tokens response")
    }

    /// Ask the server to make `index` current.
    pub async fn switch_to(&self, index: usize) -> anyhow::Result<TokenInfo> {
        let response = self
            .http
            .post(format!("{}/tokens/{index}", self.base_url))
            .send()
            .await
            .context("failed to reach proxy")?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.context("invalid switch response");
        }
        let text = response.text().await.unwrap_or_default();
        let reason = match serde_json::from_str::<ApiErrorBody>(&text) {
            Ok(ApiErrorBody {
                error_details: Some(details),
                ..
            }) => match details.url {
                Some(url) => format!("{} ({url})", details.message),
                None => details.message,
            },
            Ok(body) => body.message,
            Err(_) => format!("HTTP {status}: {text}"),
        };
        bail!("{reason}")
    }

    /// Token usage over the last `hours`, optionally for one model.
    pub async fn usage(&self, hours: u64, model: Option<&str>) -> anyhow::Result<UsageReport> {
        let mut query = vec![("hours", hours.to_string())];
        if let Some(model) = model {
            query.push(("model", model.to_string()));
        }
        let response = self
            .http
            .get(format!("{}/usage", self.base_url))
            .query(&query)
            .send()
            .await
            .context("failed to reach proxy")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|body| body.message)
                .unwrap_or(text);
            bail!("usage query failed: HTTP {status}: {reason}");
        }
        response.json().await.context("invalid /usage response")
    }

    /// Switch to `index`, moving on to the next non-`Error` index whenever
    /// the server refuses. Tries at most pool-size indices.
    pub async fn switch_with_cascade(&self, index: usize) -> anyhow::Result<SwitchReport> {
        let tokens = self.list().await?;
        let size = tokens.len();
        if size == 0 {
            bail!("proxy reports an empty pool");
        }
        if index >= size {
            bail!("token index {index} is out of range (pool size {size})");
        }

        let mut skipped = Vec::new();
        let mut candidate = index;
        for _ in 0..size {
            if tokens[candidate].is_error() && candidate != index {
                candidate = (candidate + 1) % size;
                continue;
            }
            match self.switch_to(candidate).await {
                Ok(info) => {
                    info!(index = info.index, skipped = skipped.len(), "switched token");
                    return Ok(SwitchReport {
                        index: info.index,
                        skipped,
                    });
                }
                Err(e) => {
                    warn!(index = candidate, error = %e, "switch refused, trying next token");
                    skipped.push((candidate, e.to_string()));
                    candidate = (candidate + 1) % size;
                }
            }
        }
        bail!("no token could be made current after {size} attempt(s)")
    }
}

/// Render a snapshot as a plain-text table.
pub fn render_table(tokens: &[TokenInfo]) -> String {
    let mut out = format!(
        "{:<5} {:<12} {:<9} {:<7} {:<25} {}\n",
        "INDEX", "ID", "STATUS", "CURRENT", "EXPIRES", "ERROR"
    );
    for t in tokens {
        let expires = t
            .expiration
            .map(|e| e.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        let error = t
            .error_message
            .as_ref()
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("");
        out.push_str(&format!(
            "{:<5} {:<12} {:<9} {:<7} {:<25} {}\n",
            t.index,
            t.id,
            t.status,
            if t.is_current { "*" } else { "" },
            expires,
            error
        ));
    }
    out
}

/// Render a usage report as a plain-text table with a total row.
pub fn render_usage(report: &UsageReport) -> String {
    let mut out = format!("Token usage over the last {} hour(s)\n", report.hours);
    out.push_str(&format!(
        "{:<30} {:>12} {:>12} {:>12} {:>9}\n",
        "MODEL", "INPUT", "OUTPUT", "TOTAL", "REQUESTS"
    ));
    let rows = report
        .models
        .iter()
        .map(|(model, usage)| (model.as_str(), usage))
        .chain(std::iter::once(("TOTAL", &report.total)));
    for (model, usage) in rows {
        out.push_str(&format!(
            "{:<30} {:>12} {:>12} {:>12} {:>9}\n",
            model, usage.input_tokens, usage.output_tokens, usage.total_tokens, usage.record_count
        ));
    }
    out
}

/// Poll `GET /tokens` on an interval and publish snapshots that differ from
/// the last one.
///
/// Failed polls keep the previous snapshot. The task stops once every
/// receiver is gone.
pub fn spawn_poller(
    client: DashboardClient,
    interval: Duration,
) -> (watch::Receiver<Vec<TokenInfo>>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(Vec::new());
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                debug!("no dashboard subscribers left, stopping poller");
                return;
            }
            match client.list().await {
                Ok(tokens) => {
                    tx.send_if_modified(|current| {
                        if *current == tokens {
                            false
                        } else {
                            *current = tokens;
                            true
                        }
                    });
                }
                Err(e) => warn!(error = %e, "token poll failed"),
            }
        }
    });
    (rx, handle)
}

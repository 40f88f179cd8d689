//! Per-model rate limits
//!
//! A rule caps requests and/or tokens for one model over a window of minutes.
//! Request counts are sliding windows keyed by `(model, window)`. Token limits
//! compare the window's recorded usage (see `usage`) against the cap. A rule
//! either rejects the request once a cap is reached or delays it: until the
//! oldest counted request leaves the window for request caps, or in proportion
//! to the overshoot for token caps. Models without rules are not limited.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::usage::{DEFAULT_RETENTION, TokenUsage, UsageLedger};

/// Longest wait a token overshoot can impose on one request.
pub const MAX_TOKEN_DELAY: Duration = Duration::from_secs(60);

/// What to do when a window is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitBehavior {
    /// Reject with 429
    #[default]
    Error,
    /// Wait for room in the window
    Delay,
}

/// One `[[rate_limits]]` entry. At least one cap must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitRule {
    pub model: String,
    pub window_minutes: u64,
    #[serde(default)]
    pub requests: Option<usize>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub behavior: LimitBehavior,
}

impl RateLimitRule {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.is_empty() {
            return Err("rate_limits entry has an empty model".into());
        }
        if self.window_minutes == 0 {
            return Err(format!("rate limit for {} has window_minutes = 0", self.model));
        }
        if self.requests.is_none() && self.token_caps().next().is_none() {
            return Err(format!(
                "rate limit for {} sets none of requests, input_tokens, output_tokens, total_tokens",
                self.model
            ));
        }
        if self.requests == Some(0) {
            return Err(format!("rate limit for {} has requests = 0", self.model));
        }
        if let Some((kind, _)) = self.token_caps().find(|(_, cap)| *cap == 0) {
            return Err(format!("rate limit for {} has {kind}_tokens = 0", self.model));
        }
        Ok(())
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_minutes * 60)
    }

    /// Configured token caps, total first.
    fn token_caps(&self) -> impl Iterator<Item = (&'static str, u64)> {
        [
            ("total", self.total_tokens),
            ("input", self.input_tokens),
            ("output", self.output_tokens),
        ]
        .into_iter()
        .filter_map(|(kind, cap)| cap.map(|c| (kind, c)))
    }

    /// First token cap the usage reaches, with the amount used.
    fn reached_token_cap(&self, usage: &TokenUsage) -> Option<(&'static str, u64, u64)> {
        self.token_caps().find_map(|(kind, cap)| {
            let used = match kind {
                "total" => usage.total_tokens,
                "input" => usage.input_tokens,
                _ => usage.output_tokens,
            };
            (used >= cap).then_some((kind, used, cap))
        })
    }
}

/// How long the usage ledger must remember for these rules.
pub fn retention_for(rules: &[RateLimitRule]) -> Duration {
    rules
        .iter()
        .map(RateLimitRule::window)
        .fold(DEFAULT_RETENTION, Duration::max)
}

/// Wait imposed by a token overshoot: the window scaled by how far usage
/// went past the cap (at most double), capped at `MAX_TOKEN_DELAY`.
fn token_delay(window: Duration, used: u64, cap: u64) -> Duration {
    let ratio = (used as f64 / cap as f64).min(2.0);
    let delay = window.mul_f64((ratio - 1.0).max(0.0));
    delay.min(MAX_TOKEN_DELAY)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitExceeded {
    #[error(
        "request limit exceeded for model {model} in {window_minutes}min window: {count}/{limit} requests"
    )]
    Requests {
        model: String,
        window_minutes: u64,
        count: usize,
        limit: usize,
    },

    #[error(
        "{kind} token limit exceeded for model {model} in {window_minutes}min window: {used}/{limit} tokens"
    )]
    Tokens {
        model: String,
        window_minutes: u64,
        kind: &'static str,
        used: u64,
        limit: u64,
    },
}

pub struct RequestLimiter {
    rules: HashMap<String, Vec<RateLimitRule>>,
    windows: Mutex<HashMap<(String, u64), VecDeque<Instant>>>,
    usage: Arc<UsageLedger>,
}

impl RequestLimiter {
    pub fn new(rules: &[RateLimitRule], usage: Arc<UsageLedger>) -> Self {
        let mut by_model: HashMap<String, Vec<RateLimitRule>> = HashMap::new();
        for rule in rules {
            info!(
                model = %rule.model,
                window_minutes = rule.window_minutes,
                requests = ?rule.requests,
                input_tokens = ?rule.input_tokens,
                output_tokens = ?rule.output_tokens,
                total_tokens = ?rule.total_tokens,
                behavior = ?rule.behavior,
                "rate limit configured"
            );
            by_model.entry(rule.model.clone()).or_default().push(rule.clone());
        }
        Self {
            rules: by_model,
            windows: Mutex::new(HashMap::new()),
            usage,
        }
    }

    /// Admit one request for `model`, waiting if a `Delay` rule requires it.
    ///
    /// Returns the total time spent waiting. The request is counted against
    /// every request window of the model once admitted.
    pub async fn acquire(&self, model: &str) -> Result<Duration, LimitExceeded> {
        let Some(rules) = self.rules.get(model) else {
            return Ok(Duration::ZERO);
        };

        let mut waited = self.check_tokens(model, rules).await?;
        if !waited.is_zero() {
            debug!(model, delay_ms = waited.as_millis() as u64, "token limit delay");
            tokio::time::sleep(waited).await;
        }

        loop {
            let delay = {
                let mut windows = self.windows.lock().await;
                let now = Instant::now();
                let mut delay = Duration::ZERO;

                for rule in rules {
                    let Some(limit) = rule.requests else {
                        continue;
                    };
                    let window = rule.window();
                    let entries = windows
                        .entry((model.to_string(), rule.window_minutes))
                        .or_default();
                    while entries
                        .front()
                        .is_some_and(|t| now.duration_since(*t) >= window)
                    {
                        entries.pop_front();
                    }

                    let count = entries.len();
                    if count < limit {
                        continue;
                    }
                    match rule.behavior {
                        LimitBehavior::Error => {
                            return Err(LimitExceeded::Requests {
                                model: model.to_string(),
                                window_minutes: rule.window_minutes,
                                count,
                                limit,
                            });
                        }
                        LimitBehavior::Delay => {
                            // Oldest entry that must leave for the count to drop below the limit
                            let blocking = entries[count - limit];
                            delay = delay.max((blocking + window).saturating_duration_since(now));
                        }
                    }
                }

                if delay.is_zero() {
                    for rule in rules.iter().filter(|r| r.requests.is_some()) {
                        windows
                            .entry((model.to_string(), rule.window_minutes))
                            .or_default()
                            .push_back(now);
                    }
                    return Ok(waited);
                }
                delay
            };

            debug!(model, delay_ms = delay.as_millis() as u64, "request limit delay");
            tokio::time::sleep(delay).await;
            waited += delay;
        }
    }

    /// Token caps are checked once per request against recorded usage.
    async fn check_tokens(
        &self,
        model: &str,
        rules: &[RateLimitRule],
    ) -> Result<Duration, LimitExceeded> {
        let mut delay = Duration::ZERO;
        for rule in rules {
            if rule.token_caps().next().is_none() {
                continue;
            }
            let usage = self.usage.usage_within(model, rule.window()).await;
            let Some((kind, used, limit)) = rule.reached_token_cap(&usage) else {
                continue;
            };
            match rule.behavior {
                LimitBehavior::Error => {
                    return Err(LimitExceeded::Tokens {
                        model: model.to_string(),
                        window_minutes: rule.window_minutes,
                        kind,
                        used,
                        limit,
                    });
                }
                LimitBehavior::Delay => {
                    delay = delay.max(token_delay(rule.window(), used, limit));
                }
            }
        }
        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(model: &str, requests: usize, behavior: LimitBehavior) -> RateLimitRule {
        RateLimitRule {
            model: model.into(),
            window_minutes: 1,
            requests: Some(requests),
            behavior,
            ..Default::default()
        }
    }

    fn limiter(rules: &[RateLimitRule]) -> (RequestLimiter, Arc<UsageLedger>) {
        let ledger = Arc::new(UsageLedger::new(retention_for(rules)));
        (RequestLimiter::new(rules, ledger.clone()), ledger)
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_model_passes_through() {
        let (limiter, _) = limiter(&[rule("gpt-4o", 1, LimitBehavior::Error)]);
        for _ in 0..10 {
            assert_eq!(limiter.acquire("claude-3.5-sonnet").await.unwrap(), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_behavior_rejects_when_window_full() {
        let (limiter, _) = limiter(&[rule("gpt-4o", 2, LimitBehavior::Error)]);
        limiter.acquire("gpt-4o").await.unwrap();
        limiter.acquire("gpt-4o").await.unwrap();

        let err = limiter.acquire("gpt-4o").await.unwrap_err();
        assert!(matches!(
            err,
            LimitExceeded::Requests { count: 2, limit: 2, .. }
        ));
        assert!(err.to_string().contains("gpt-4o"));

        // The window slides
        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.acquire("gpt-4o").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delay_behavior_waits_for_oldest_to_expire() {
        let (limiter, _) = limiter(&[rule("gpt-4o", 2, LimitBehavior::Delay)]);
        limiter.acquire("gpt-4o").await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        limiter.acquire("gpt-4o").await.unwrap();

        let start = Instant::now();
        let waited = limiter.acquire("gpt-4o").await.unwrap();
        assert_eq!(waited, Duration::from_secs(40));
        assert!(start.elapsed() >= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn token_cap_rejects_once_usage_reaches_it() {
        let tokens = RateLimitRule {
            model: "gpt-4o".into(),
            window_minutes: 10,
            total_tokens: Some(1000),
            ..Default::default()
        };
        let (limiter, ledger) = limiter(&[tokens]);

        ledger.record("gpt-4o", 300, 200).await;
        limiter.acquire("gpt-4o").await.unwrap();
        ledger.record("gpt-4o", 400, 100).await;

        let err = limiter.acquire("gpt-4o").await.unwrap_err();
        assert_eq!(
            err,
            LimitExceeded::Tokens {
                model: "gpt-4o".into(),
                window_minutes: 10,
                kind: "total",
                used: 1000,
                limit: 1000,
            }
        );
        // Other models are unaffected by gpt-4o usage
        limiter.acquire("o1").await.unwrap();

        tokio::time::advance(Duration::from_secs(601)).await;
        limiter.acquire("gpt-4o").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn token_cap_checks_each_direction() {
        let output_only = RateLimitRule {
            model: "gpt-4o".into(),
            window_minutes: 1,
            output_tokens: Some(50),
            ..Default::default()
        };
        let (limiter, ledger) = limiter(&[output_only]);

        ledger.record("gpt-4o", 10_000, 10).await;
        limiter.acquire("gpt-4o").await.unwrap();
        ledger.record("gpt-4o", 0, 40).await;
        let err = limiter.acquire("gpt-4o").await.unwrap_err();
        assert!(matches!(err, LimitExceeded::Tokens { kind: "output", used: 50, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn token_delay_scales_with_overshoot() {
        let delayed = RateLimitRule {
            model: "gpt-4o".into(),
            window_minutes: 1,
            input_tokens: Some(100),
            behavior: LimitBehavior::Delay,
            ..Default::default()
        };
        let (limiter, ledger) = limiter(&[delayed]);

        ledger.record("gpt-4o", 125, 0).await;
        let waited = limiter.acquire("gpt-4o").await.unwrap();
        assert_eq!(waited, Duration::from_secs(15));
    }

    #[test]
    fn token_delay_is_bounded() {
        let hour = Duration::from_secs(3600);
        assert_eq!(token_delay(hour, 100, 100), Duration::ZERO);
        assert_eq!(token_delay(hour, 150, 100), MAX_TOKEN_DELAY);
        assert_eq!(
            token_delay(Duration::from_secs(60), 1_000_000, 100),
            Duration::from_secs(60)
        );
        assert_eq!(
            token_delay(Duration::from_secs(20), 150, 100),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn rule_validation() {
        assert!(rule("gpt-4o", 1, LimitBehavior::Error).validate().is_ok());
        assert!(rule("gpt-4o", 0, LimitBehavior::Error).validate().is_err());
        assert!(rule("", 1, LimitBehavior::Error).validate().is_err());
        let zero_window = RateLimitRule {
            window_minutes: 0,
            ..rule("gpt-4o", 1, LimitBehavior::Delay)
        };
        assert!(zero_window.validate().is_err());

        let no_caps = RateLimitRule {
            model: "gpt-4o".into(),
            window_minutes: 5,
            ..Default::default()
        };
        assert!(no_caps.validate().unwrap_err().contains("sets none"));

        let tokens_only = RateLimitRule {
            total_tokens: Some(10),
            ..no_caps.clone()
        };
        assert!(tokens_only.validate().is_ok());
        let zero_tokens = RateLimitRule {
            input_tokens: Some(0),
            ..tokens_only
        };
        assert!(zero_tokens.validate().unwrap_err().contains("input_tokens = 0"));
    }

    #[test]
    fn retention_covers_longest_window() {
        assert_eq!(retention_for(&[]), DEFAULT_RETENTION);
        let two_days = RateLimitRule {
            window_minutes: 48 * 60,
            ..rule("gpt-4o", 1, LimitBehavior::Error)
        };
        assert_eq!(retention_for(&[two_days]), Duration::from_secs(48 * 3600));
    }

    #[test]
    fn behavior_defaults_to_error() {
        let parsed: RateLimitRule =
            toml::from_str("model = \"o1\"\nwindow_minutes = 5\nrequests = 3\n").unwrap();
        assert_eq!(parsed.behavior, LimitBehavior::Error);
        assert_eq!(parsed.requests, Some(3));
        assert_eq!(parsed.total_tokens, None);
    }
}

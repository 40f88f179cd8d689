//! Randomized delay before outbound completion calls
//!
//! Spreads requests out so bursts from one credential look less mechanical.
//! The delay is drawn uniformly from `[min, max]`; `0..0` disables the gate.

use std::time::Duration;

use rand::RngExt;
use tracing::trace;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateGate {
    min: Duration,
    max: Duration,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RateGate {
    /// Build a gate from bounds in seconds.
    ///
    /// Both bounds must be finite and non-negative, and `max >= min`.
    pub fn new(min_secs: f64, max_secs: f64) -> Result<Self> {
        for (name, value) in [("min_delay_seconds", min_secs), ("max_delay_seconds", max_secs)] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidDelay(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if max_secs < min_secs {
            return Err(Error::InvalidDelay(format!(
                "max_delay_seconds ({max_secs}) must not be less than min_delay_seconds ({min_secs})"
            )));
        }
        Ok(Self {
            min: to_duration("min_delay_seconds", min_secs)?,
            max: to_duration("max_delay_seconds", max_secs)?,
        })
    }

    pub fn disabled() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.max.is_zero()
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Draw a delay from `[min, max]`.
    pub fn sample(&self) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        let nanos = rand::rng().random_range(self.min.as_nanos()..=self.max.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Sleep for a sampled delay. Returns the delay slept.
    pub async fn wait(&self) -> Duration {
        let delay = self.sample();
        if !delay.is_zero() {
            trace!(delay_ms = delay.as_millis() as u64, "rate gate delay");
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

fn to_duration(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::InvalidDelay(format!("{name} is out of range ({secs}): {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn rejects_inverted_bounds() {
        assert!(matches!(RateGate::new(5.0, 1.0), Err(Error::InvalidDelay(_))));
    }

    #[test]
    fn rejects_negative_and_non_finite() {
        assert!(RateGate::new(-1.0, 1.0).is_err());
        assert!(RateGate::new(0.0, f64::NAN).is_err());
        assert!(RateGate::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn rejects_delay_too_large_for_duration() {
        match RateGate::new(0.0, 1e20) {
            Err(Error::InvalidDelay(message)) => assert!(message.contains("max_delay_seconds")),
            other => panic!("expected InvalidDelay, got {other:?}"),
        }
    }

    #[test]
    fn samples_stay_within_bounds() {
        let gate = RateGate::new(0.5, 1.5).unwrap();
        for _ in 0..500 {
            let d = gate.sample();
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500), "{d:?}");
        }
    }

    #[test]
    fn equal_bounds_yield_fixed_delay() {
        let gate = RateGate::new(2.0, 2.0).unwrap();
        assert_eq!(gate.sample(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_for_at_least_min() {
        let gate = RateGate::new(5.0, 5.0).unwrap();
        let start = Instant::now();
        let slept = gate.wait().await;
        assert_eq!(slept, Duration::from_secs(5));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_gate_does_not_sleep() {
        let gate = RateGate::disabled();
        assert!(gate.is_disabled());
        let start = Instant::now();
        assert_eq!(gate.wait().await, Duration::ZERO);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}

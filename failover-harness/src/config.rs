//! Timing configuration.
//!
//! All windows are environment-tunable so the same script runs under slow or
//! loaded environments. A percentage factor scales every duration, and each
//! window can be overridden individually.

use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};

/// Percentage applied to every duration (100 = unchanged).
pub const TIMEOUT_FACTOR_ENV: &str = "FAILOVER_TIMEOUT_FACTOR";
/// Override for [`TimingConfig::stability_window`], in milliseconds.
pub const STABILITY_ENV: &str = "FAILOVER_STABILITY_MS";
/// Override for [`TimingConfig::outage_window`], in milliseconds.
pub const OUTAGE_ENV: &str = "FAILOVER_OUTAGE_MS";
/// Override for [`TimingConfig::invocation_period`], in milliseconds.
pub const PERIOD_ENV: &str = "FAILOVER_PERIOD_MS";
/// Override for [`TimingConfig::convergence_window`], in milliseconds.
pub const CONVERGENCE_ENV: &str = "FAILOVER_CONVERGENCE_MS";
/// Override for [`TimingConfig::grace_period`], in milliseconds.
pub const GRACE_ENV: &str = "FAILOVER_GRACE_MS";

/// Durations that drive a scripted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Failure-free interval before the first toggle and the baseline checkpoint.
    pub stability_window: Duration,
    /// How long a stopped node is kept down.
    pub outage_window: Duration,
    /// Fixed delay between the end of one invocation and the start of the next.
    pub invocation_period: Duration,
    /// Wait for the client's topology view to settle: once after acquisition,
    /// and after every restart.
    pub convergence_window: Duration,
    /// Time a node is allowed to drain in-flight work when stopped.
    pub grace_period: Duration,
    /// Per-invocation deadline; an expired call is recorded as a failure.
    pub invocation_timeout: Option<Duration>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stability_window: Duration::from_millis(5000),
            outage_window: Duration::from_millis(5000),
            invocation_period: Duration::from_millis(100),
            convergence_window: Duration::from_millis(5000),
            grace_period: Duration::from_millis(1000),
            invocation_timeout: None,
        }
    }
}

impl TimingConfig {
    /// Defaults, adjusted by the process environment.
    pub fn from_env() -> HarnessResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults, adjusted by values from `lookup`.
    ///
    /// Per-window overrides replace the default first; the factor then scales
    /// the result.
    pub fn from_lookup<F>(lookup: F) -> HarnessResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let overrides: [(&str, &mut Duration); 5] = [
            (STABILITY_ENV, &mut config.stability_window),
            (OUTAGE_ENV, &mut config.outage_window),
            (PERIOD_ENV, &mut config.invocation_period),
            (CONVERGENCE_ENV, &mut config.convergence_window),
            (GRACE_ENV, &mut config.grace_period),
        ];
        for (key, slot) in overrides {
            if let Some(raw) = lookup(key) {
                *slot = Duration::from_millis(parse_u64(key, &raw)?);
            }
        }

        let factor = match lookup(TIMEOUT_FACTOR_ENV) {
            Some(raw) => parse_u64(TIMEOUT_FACTOR_ENV, &raw)?,
            None => 100,
        };
        let config = config.scaled(factor);
        config.validate()?;
        Ok(config)
    }

    /// Every duration multiplied by `percent / 100`.
    pub fn scaled(&self, percent: u64) -> Self {
        let scale = |d: Duration| {
            let millis = d.as_millis().saturating_mul(u128::from(percent)) / 100;
            Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
        };
        Self {
            stability_window: scale(self.stability_window),
            outage_window: scale(self.outage_window),
            invocation_period: scale(self.invocation_period),
            convergence_window: scale(self.convergence_window),
            grace_period: scale(self.grace_period),
            invocation_timeout: self.invocation_timeout.map(scale),
        }
    }

    /// Set the stability window.
    pub fn with_stability_window(mut self, window: Duration) -> Self {
        self.stability_window = window;
        self
    }

    /// Set the outage window.
    pub fn with_outage_window(mut self, window: Duration) -> Self {
        self.outage_window = window;
        self
    }

    /// Set the invocation period.
    pub fn with_invocation_period(mut self, period: Duration) -> Self {
        self.invocation_period = period;
        self
    }

    /// Set the convergence window.
    pub fn with_convergence_window(mut self, window: Duration) -> Self {
        self.convergence_window = window;
        self
    }

    /// Set the node grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the per-invocation timeout.
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }

    /// Check that every window is non-zero and the period fits in a stability window.
    pub fn validate(&self) -> HarnessResult<()> {
        let named = [
            ("stability window", self.stability_window),
            ("outage window", self.outage_window),
            ("invocation period", self.invocation_period),
            ("convergence window", self.convergence_window),
            ("grace period", self.grace_period),
        ];
        for (name, value) in named {
            if value.is_zero() {
                return Err(HarnessError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.invocation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(HarnessError::InvalidConfig(
                "invocation timeout must be non-zero".into(),
            ));
        }
        if self.invocation_period >= self.stability_window {
            return Err(HarnessError::InvalidConfig(format!(
                "invocation period {:?} must be shorter than the stability window {:?}",
                self.invocation_period, self.stability_window
            )));
        }
        Ok(())
    }
}

fn parse_u64(key: &str, raw: &str) -> HarnessResult<u64> {
    raw.trim()
        .parse()
        .map_err(|e| HarnessError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}

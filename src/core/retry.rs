//! Bounded retry for the three adapter steps (poll, transform, deliver).
//!
//! Each attempt is capped by a per-step timeout. Between attempts the
//! runner backs off exponentially. Exhausting the attempts yields a
//! `StepError` which the orchestrator turns into a failed item or a
//! skipped source.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::shutdown::Shutdown;

/// The adapter step being retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Poll,
    Transform,
    Deliver,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::Poll => "poll",
            StepKind::Transform => "transform",
            StepKind::Deliver => "deliver",
        })
    }
}

/// Retry policy for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound for a single attempt, in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_timeout_seconds() -> u64 {
    60
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_seconds: default_timeout_seconds(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Default policy for a step; transforms get a longer timeout
    pub fn for_step(step: StepKind) -> Self {
        let timeout_seconds = match step {
            StepKind::Poll => 60,
            StepKind::Transform => 180,
            StepKind::Deliver => 60,
        };
        Self {
            timeout_seconds,
            ..Default::default()
        }
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Retry policies for all three steps.
///
/// Config may set any subset of fields per step; the rest come from that
/// step's own defaults, so a partial `transform` block keeps its 180s timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StepPoliciesConfig")]
pub struct StepPolicies {
    pub poll: RetryPolicy,
    pub transform: RetryPolicy,
    pub deliver: RetryPolicy,
}

/// Retry policy fields as written in config
#[derive(Debug, Default, Deserialize)]
struct PolicyOverrides {
    max_attempts: Option<u32>,
    timeout_seconds: Option<u64>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
}

impl PolicyOverrides {
    fn resolve(self, step: StepKind) -> RetryPolicy {
        let base = RetryPolicy::for_step(step);
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            timeout_seconds: self.timeout_seconds.unwrap_or(base.timeout_seconds),
            initial_delay_ms: self.initial_delay_ms.unwrap_or(base.initial_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(base.backoff_multiplier),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StepPoliciesConfig {
    #[serde(default)]
    poll: PolicyOverrides,
    #[serde(default)]
    transform: PolicyOverrides,
    #[serde(default)]
    deliver: PolicyOverrides,
}

impl From<StepPoliciesConfig> for StepPolicies {
    fn from(config: StepPoliciesConfig) -> Self {
        Self {
            poll: config.poll.resolve(StepKind::Poll),
            transform: config.transform.resolve(StepKind::Transform),
            deliver: config.deliver.resolve(StepKind::Deliver),
        }
    }
}

impl Default for StepPolicies {
    fn default() -> Self {
        StepPoliciesConfig::default().into()
    }
}

impl StepPolicies {
    /// Same policy for every step
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            poll: policy.clone(),
            transform: policy.clone(),
            deliver: policy,
        }
    }

    pub fn get(&self, step: StepKind) -> &RetryPolicy {
        match step {
            StepKind::Poll => &self.poll,
            StepKind::Transform => &self.transform,
            StepKind::Deliver => &self.deliver,
        }
    }
}

/// Why a step gave up
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("{step} timed out after {attempts} attempt(s) of {timeout:?}")]
    Timeout {
        step: StepKind,
        attempts: u32,
        timeout: Duration,
    },

    #[error("{step} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        step: StepKind,
        attempts: u32,
        last_error: String,
    },

    #[error("{step} cancelled by shutdown")]
    Cancelled { step: StepKind },
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled { .. })
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 1-indexed attempt number. Shutdown aborts both an
/// in-flight attempt and a pending backoff.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    step: StepKind,
    shutdown: &Shutdown,
    mut op: F,
) -> Result<T, StepError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let timeout = policy.timeout();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = shutdown.triggered() => return Err(StepError::Cancelled { step }),
            result = tokio::time::timeout(timeout, op(attempt)) => result,
        };

        let (error, timed_out) = match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => (format!("{:#}", e), false),
            Err(_) => (format!("attempt timed out after {:?}", timeout), true),
        };

        if !policy.should_retry(attempt) {
            return Err(if timed_out {
                StepError::Timeout {
                    step,
                    attempts: attempt,
                    timeout,
                }
            } else {
                StepError::Exhausted {
                    step,
                    attempts: attempt,
                    last_error: error,
                }
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            %step,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "Step failed, retrying"
        );

        tokio::select! {
            biased;
            _ = shutdown.triggered() => return Err(StepError::Cancelled { step }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

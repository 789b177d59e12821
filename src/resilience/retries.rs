//! Retry logic.
//!
//! # Responsibilities
//! - Determine if a failed attempt may be retried
//! - Compute the backoff before the next attempt
//! - Enforce an optional retry budget (retries per time window)
//! - Track the per-request retry state machine
//!
//! # Design Decisions
//! - Fatal failures are never retried
//! - Non-idempotent requests are retried only if nothing reached the upstream
//! - A streaming body that was already taken cannot be resent
//! - The retry budget is opt-in; without it every retryable request gets
//!   its full attempt count
//!
//! # State Machine
//! ```text
//! Attempting ──success──▶ Succeeded
//!     │
//!   failure
//!     ▼
//! Deciding ──retry──▶ Retrying ──backoff elapsed──▶ Attempting
//!     │
//!  give up
//!     ▼
//!   Failed
//! ```

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::RetryConfig;
use crate::error::ProxyError;
use crate::forward::{AttemptFailure, ForwardRequest};
use crate::resilience::backoff::Backoff;

/// Length of one retry budget window.
pub const BUDGET_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct BudgetWindow {
    started: Instant,
    requests: u64,
    retries: u64,
}

/// Caps retries to a fraction of recent traffic.
///
/// Within each window, at most `max(min_retries, ratio * requests)` retries
/// are granted.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f32,
    min_retries: u32,
    window: Duration,
    state: Mutex<BudgetWindow>,
}

impl RetryBudget {
    pub fn new(ratio: f32, min_retries: u32) -> Self {
        Self::with_window(ratio, min_retries, BUDGET_WINDOW)
    }

    pub fn with_window(ratio: f32, min_retries: u32, window: Duration) -> Self {
        Self {
            ratio: ratio.clamp(0.0, 1.0),
            min_retries,
            window,
            state: Mutex::new(BudgetWindow {
                started: Instant::now(),
                requests: 0,
                retries: 0,
            }),
        }
    }

    fn current(&self) -> std::sync::MutexGuard<'_, BudgetWindow> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.started.elapsed() >= self.window {
            *state = BudgetWindow {
                started: Instant::now(),
                requests: 0,
                retries: 0,
            };
        }
        state
    }

    /// Count one inbound request toward the current window.
    pub fn record_request(&self) {
        self.current().requests += 1;
    }

    /// Take one retry from the budget; false if the window is spent.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.current();
        let by_ratio = (state.requests as f64 * self.ratio as f64).floor() as u64;
        let allowed = by_ratio.max(self.min_retries as u64);
        if state.retries < allowed {
            state.retries += 1;
            true
        } else {
            false
        }
    }
}

/// Result of consulting the policy after a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Sleep for the delay, then try again.
    Retry(Duration),
    /// Stop and report this error.
    GiveUp(ProxyError),
}

impl RetryDecision {
    /// How the failed attempt ended up, as a metric label.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            RetryDecision::Retry(_) => "retried",
            RetryDecision::GiveUp(_) => "failed",
        }
    }
}

/// Retry rules shared by every request of a proxy instance.
#[derive(Debug)]
pub struct RetryPolicy {
    enabled: bool,
    max_retries: u32,
    backoff: Backoff,
    budget: Option<RetryBudget>,
}

impl RetryPolicy {
    pub fn new(
        enabled: bool,
        max_retries: u32,
        backoff: Backoff,
        budget: Option<RetryBudget>,
    ) -> Self {
        Self {
            enabled,
            max_retries,
            backoff,
            budget,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.enabled,
            config.max_retries,
            Backoff::from_config(config),
            config
                .budget_enabled
                .then(|| RetryBudget::new(config.budget_ratio, config.min_retries_per_window)),
        )
    }

    /// Total attempts allowed for one request.
    pub fn max_attempts(&self) -> u32 {
        if self.enabled {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    pub fn budget(&self) -> Option<&RetryBudget> {
        self.budget.as_ref()
    }

    /// Count one inbound request toward the retry budget, if there is one.
    pub fn record_request(&self) {
        if let Some(budget) = &self.budget {
            budget.record_request();
        }
    }

    /// Decide what follows failed attempt number `attempt` (1-based).
    pub fn should_retry(
        &self,
        attempt: u32,
        failure: &AttemptFailure,
        request: &ForwardRequest,
    ) -> RetryDecision {
        let reason = match failure {
            AttemptFailure::Fatal(reason) => {
                return RetryDecision::GiveUp(ProxyError::Fatal(reason.clone()))
            }
            AttemptFailure::Retryable(reason) => reason,
        };

        if !self.enabled {
            return RetryDecision::GiveUp(ProxyError::Fatal(reason.clone()));
        }

        // The body must still be sendable from its first byte.
        if request.body.is_consumed() {
            return RetryDecision::GiveUp(ProxyError::Fatal(reason.clone()));
        }

        if !request.is_idempotent() && reason.request_sent {
            return RetryDecision::GiveUp(ProxyError::Fatal(reason.clone()));
        }

        if attempt >= self.max_attempts() {
            return RetryDecision::GiveUp(ProxyError::RetriesExhausted {
                attempts: attempt,
                last: reason.clone(),
            });
        }

        if self.budget.as_ref().is_some_and(|budget| !budget.try_acquire()) {
            tracing::debug!(attempt, "Retry budget exhausted");
            return RetryDecision::GiveUp(ProxyError::RetriesExhausted {
                attempts: attempt,
                last: reason.clone(),
            });
        }

        RetryDecision::Retry(self.backoff.delay(attempt))
    }
}

/// Where a request is in its retry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting,
    Deciding,
    Retrying,
    Succeeded,
    Failed,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded | RetryState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryState::Attempting => "attempting",
            RetryState::Deciding => "deciding",
            RetryState::Retrying => "retrying",
            RetryState::Succeeded => "succeeded",
            RetryState::Failed => "failed",
        }
    }
}

/// Per-request driver of the retry state machine.
#[derive(Debug)]
pub struct RetryCoordinator<'a> {
    policy: &'a RetryPolicy,
    state: RetryState,
    attempts: u32,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Attempting,
            attempts: 0,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn transition(&mut self, next: RetryState) {
        tracing::trace!(
            from = self.state.as_str(),
            to = next.as_str(),
            attempt = self.attempts,
            "Retry state transition"
        );
        self.state = next;
    }

    /// Start the next attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        debug_assert!(!self.state.is_terminal());
        if self.state != RetryState::Attempting {
            self.transition(RetryState::Attempting);
        }
        self.attempts += 1;
        self.attempts
    }

    pub fn succeeded(&mut self) {
        self.transition(RetryState::Succeeded);
    }

    /// Stop without consulting the policy (pool exhaustion, cancellation).
    pub fn abandon(&mut self) {
        self.transition(RetryState::Failed);
    }

    /// Consult the policy about the attempt that just failed.
    pub fn decide(&mut self, failure: &AttemptFailure, request: &ForwardRequest) -> RetryDecision {
        self.transition(RetryState::Deciding);
        let decision = self.policy.should_retry(self.attempts, failure, request);
        match &decision {
            RetryDecision::Retry(_) => self.transition(RetryState::Retrying),
            RetryDecision::GiveUp(_) => self.transition(RetryState::Failed),
        }
        decision
    }
}

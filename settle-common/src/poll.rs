//! Bounded retry loop shared by the wait and database checkers.
//!
//! [`poll`] runs one evaluation per tick until the condition holds, the
//! attempt budget is spent, the overall deadline passes, or the caller
//! cancels. The first evaluation fires immediately. An evaluation that is
//! still in flight when the deadline passes is abandoned and does not count
//! as an attempt.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CheckError;

/// Default delay between attempts.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default cap on the number of attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Result message when the overall deadline passes.
pub const TIMEOUT_MESSAGE: &str = "timeout waiting for condition";

/// Result message when every attempt completed without satisfaction.
pub const EXHAUSTED_MESSAGE: &str = "max attempts reached";

/// Backend-agnostic polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    /// Total wall-clock budget.
    pub timeout: Duration,
    /// Delay between attempt starts.
    pub interval: Duration,
    /// Hard cap on completed attempts.
    pub max_attempts: u32,
}

impl PollSpec {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Build a spec from optional user settings.
    ///
    /// Zero values fall back to the defaults: a zero interval cannot drive a
    /// ticker and a zero budget would never evaluate anything.
    pub fn from_parts(
        timeout: Option<Duration>,
        interval: Option<Duration>,
        max_attempts: u32,
        default_timeout: Duration,
    ) -> Self {
        let nonzero = |d: Option<Duration>| d.filter(|d| !d.is_zero());
        Self {
            timeout: nonzero(timeout).unwrap_or(default_timeout),
            interval: nonzero(interval).unwrap_or(DEFAULT_INTERVAL),
            max_attempts: if max_attempts == 0 {
                DEFAULT_MAX_ATTEMPTS
            } else {
                max_attempts
            },
        }
    }

    /// A zero interval falls back to [`DEFAULT_INTERVAL`].
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// One completed evaluation: whether the condition held, plus the
/// diagnostic payload the checker wants to report.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation<T> {
    pub satisfied: bool,
    pub detail: T,
}

impl<T> Evaluation<T> {
    pub fn satisfied(detail: T) -> Self {
        Self {
            satisfied: true,
            detail,
        }
    }

    pub fn pending(detail: T) -> Self {
        Self {
            satisfied: false,
            detail,
        }
    }
}

/// Terminal state of a polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Satisfied,
    TimedOut,
    Exhausted,
    Cancelled,
    Failed,
}

impl PollStatus {
    /// Message recorded in a result's `error` field for this status.
    ///
    /// `Failed` carries the attempt's own error instead.
    pub fn message(self) -> Option<&'static str> {
        match self {
            Self::Satisfied | Self::Failed => None,
            Self::TimedOut => Some(TIMEOUT_MESSAGE),
            Self::Exhausted => Some(EXHAUSTED_MESSAGE),
            Self::Cancelled => Some("cancelled while waiting for condition"),
        }
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satisfied => write!(f, "satisfied"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Everything a polling run produced.
#[derive(Debug)]
pub struct PollOutcome<T, E> {
    pub status: PollStatus,
    /// Completed evaluations.
    pub attempts: u32,
    pub elapsed: Duration,
    /// Detail of the most recent completed evaluation.
    pub last: Option<T>,
    /// The hard error that stopped the loop, when `status` is `Failed`.
    pub error: Option<E>,
}

impl<T, E: fmt::Display> PollOutcome<T, E> {
    pub fn is_satisfied(&self) -> bool {
        self.status == PollStatus::Satisfied
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    /// Message for the result's `error` field; `None` on success.
    pub fn error_message(&self) -> Option<String> {
        match (&self.error, self.status.message()) {
            (Some(error), _) => Some(error.to_string()),
            (None, Some(message)) => Some(message.to_string()),
            (None, None) => None,
        }
    }
}

impl<T> PollOutcome<T, CheckError> {
    /// Split into the result-level view and the error surfaced at the call
    /// boundary (hard errors and cancellation only).
    pub fn settle(self) -> Settled<T> {
        let success = self.is_satisfied();
        let message = self.error_message();
        let duration_ms = self.duration_ms();
        let failure = match self.status {
            PollStatus::Failed => self.error,
            PollStatus::Cancelled => Some(CheckError::Cancelled),
            _ => None,
        };
        Settled {
            success,
            attempts: self.attempts,
            duration_ms,
            last: self.last,
            message,
            failure,
        }
    }
}

/// Result-level view of a [`PollOutcome`].
#[derive(Debug)]
pub struct Settled<T> {
    pub success: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub last: Option<T>,
    pub message: Option<String>,
    pub failure: Option<CheckError>,
}

/// Evaluate `attempt` until it is satisfied or the budget in `spec` runs out.
///
/// `attempt` receives the 1-based number of the attempt it performs. An
/// `Err` from `attempt` is a hard error: the loop stops immediately without
/// spending the remaining budget.
pub async fn poll<T, E, F, Fut>(
    spec: &PollSpec,
    cancel: &CancellationToken,
    mut attempt: F,
) -> PollOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Evaluation<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + spec.timeout;
    let mut ticker = interval(spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut attempts = 0u32;
    let mut last = None;
    let mut error = None;

    let status = loop {
        if attempts >= spec.max_attempts {
            break PollStatus::Exhausted;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break PollStatus::Cancelled,
            _ = sleep_until(deadline) => break PollStatus::TimedOut,
            _ = ticker.tick() => {}
        }

        let evaluated = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PollStatus::Cancelled,
            _ = sleep_until(deadline) => break PollStatus::TimedOut,
            evaluated = attempt(attempts + 1) => evaluated,
        };
        attempts += 1;

        match evaluated {
            Ok(evaluation) => {
                debug!(attempt = attempts, satisfied = evaluation.satisfied, "Poll attempt completed");
                last = Some(evaluation.detail);
                if evaluation.satisfied {
                    break PollStatus::Satisfied;
                }
            }
            Err(err) => {
                debug!(attempt = attempts, "Poll attempt failed with a hard error");
                error = Some(err);
                break PollStatus::Failed;
            }
        }
    };

    PollOutcome {
        status,
        attempts,
        elapsed: started.elapsed(),
        last,
        error,
    }
}

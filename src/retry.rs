//! Retry policy for transport failures.
//!
//! Only failures where no response was received are ever retried. The
//! decision is made by a [`RetryStrategy`]; the [`RetryPolicy`] bounds how
//! often and how fast.

use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use crate::{
    error::{AttemptRecord, NetworkErrorCode, RetryInfo},
    util::duration_millis,
    Method, WireRequest,
};

/// Number of retried failures kept in a call's attempt history.
pub const MAX_RECORDED_ATTEMPTS: usize = 16;

/// A single failed attempt, as shown to a [`RetryStrategy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptFailure {
    pub code: NetworkErrorCode,
    pub attempt: u32,
    pub elapsed: Duration,
}

/// What a strategy knows about the call being retried.
#[derive(Clone, Copy, Debug)]
pub struct AttemptContext<'a> {
    pub request: &'a WireRequest,
    pub attempt: u32,
    pub max_attempts: u32,
    /// The call opted in to retries for non-idempotent methods.
    pub retry_on_transient_error: bool,
}

impl AttemptContext<'_> {
    pub fn method(&self) -> Method {
        self.request.method
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
}

impl RetryDecision {
    pub const RETRY: Self = Self { retry: true };
    pub const STOP: Self = Self { retry: false };
}

impl From<bool> for RetryDecision {
    fn from(retry: bool) -> Self {
        Self { retry }
    }
}

/// Decides whether a failed attempt may be repeated.
///
/// Must be pure: the same failure and context always give the same answer.
pub trait RetryStrategy: Send + Sync {
    fn decide(&self, failure: &AttemptFailure, context: &AttemptContext<'_>) -> RetryDecision;
}

/// Default strategy.
///
/// Idempotent methods are retried on the transient codes; other methods only
/// when the call opted in. Failures that never reached the peer are always
/// retried.
#[derive(Clone, Debug)]
pub struct TransientErrorStrategy {
    codes: BTreeSet<NetworkErrorCode>,
}

impl TransientErrorStrategy {
    pub fn with_codes(codes: impl IntoIterator<Item = NetworkErrorCode>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }

    pub fn codes(&self) -> &BTreeSet<NetworkErrorCode> {
        &self.codes
    }
}

impl Default for TransientErrorStrategy {
    fn default() -> Self {
        Self::with_codes([
            NetworkErrorCode::ConnectionReset,
            NetworkErrorCode::ConnectionRefused,
            NetworkErrorCode::TimedOut,
            NetworkErrorCode::HostUnreachable,
            NetworkErrorCode::DnsFailure,
            NetworkErrorCode::BrokenPipe,
        ])
    }
}

impl RetryStrategy for TransientErrorStrategy {
    fn decide(&self, failure: &AttemptFailure, context: &AttemptContext<'_>) -> RetryDecision {
        if failure.code.never_reached_peer() {
            return RetryDecision::RETRY;
        }
        if !self.codes.contains(&failure.code) {
            return RetryDecision::STOP;
        }
        (context.method().is_idempotent() || context.retry_on_transient_error).into()
    }
}

/// Retries every transport failure, whatever the method.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyNetworkErrorStrategy;

impl RetryStrategy for AnyNetworkErrorStrategy {
    fn decide(&self, _failure: &AttemptFailure, _context: &AttemptContext<'_>) -> RetryDecision {
        RetryDecision::RETRY
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NeverRetry;

impl RetryStrategy for NeverRetry {
    fn decide(&self, _failure: &AttemptFailure, _context: &AttemptContext<'_>) -> RetryDecision {
        RetryDecision::STOP
    }
}

/// Wraps a plain function as a strategy.
pub struct FnStrategy<F>(pub F);

impl<F> RetryStrategy for FnStrategy<F>
where
    F: Fn(&AttemptFailure, &AttemptContext<'_>) -> bool + Send + Sync,
{
    fn decide(&self, failure: &AttemptFailure, context: &AttemptContext<'_>) -> RetryDecision {
        (self.0)(failure, context).into()
    }
}

/// Owned by the factory and shared by every client it creates.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    retry_delay: Duration,
    strategy: Arc<dyn RetryStrategy>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            strategy: Arc::new(TransientErrorStrategy::default()),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            retry_delay: Duration::ZERO,
            strategy: Arc::new(NeverRetry),
        }
    }

    /// Total attempts including the first; clamped to at least 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Fixed pause between attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_strategy(mut self, strategy: impl RetryStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    pub fn with_shared_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn strategy(&self) -> &Arc<dyn RetryStrategy> {
        &self.strategy
    }
}

/// Failures of one call that were followed by a retry.
#[derive(Debug, Default)]
pub(crate) struct AttemptHistory {
    records: VecDeque<AttemptRecord>,
    dropped: usize,
}

impl AttemptHistory {
    pub(crate) fn record(&mut self, failure: &AttemptFailure) {
        if self.records.len() == MAX_RECORDED_ATTEMPTS {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(AttemptRecord {
            attempt: failure.attempt,
            code: failure.code,
            elapsed_ms: duration_millis(failure.elapsed),
        });
    }

    pub(crate) fn finish(self, tries: u32, strategy_supported: Option<bool>) -> RetryInfo {
        RetryInfo {
            tries,
            strategy_supported,
            history: self.records.into(),
            history_dropped: self.dropped,
        }
    }
}

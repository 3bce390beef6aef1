/// Pending/target state refresh engine
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Upper bound of the exponential poll interval
pub const MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(10);
/// Lower bound of the exponential poll interval
const MIN_BACKOFF_INTERVAL: Duration = Duration::from_millis(100);

/// Something whose status can be polled
pub trait StatusSubject: fmt::Debug + Send {
    type Status: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync;

    fn status(&self) -> Self::Status;

    /// Why the subject ended up in a failure status, if the backend says
    fn failure_reason(&self) -> Option<String> {
        None
    }
}

/// Outcome of a single refresh
#[derive(Debug, Clone, PartialEq)]
pub enum Refresh<T> {
    Found(T),
    NotFound,
}

impl<T> Refresh<T> {
    /// Turn a not-found lookup error into [`Refresh::NotFound`]
    pub fn from_lookup(result: Result<T>) -> Result<Self> {
        match result {
            Ok(subject) => Ok(Refresh::Found(subject)),
            Err(e) if e.is_not_found() => Ok(Refresh::NotFound),
            Err(e) => Err(e),
        }
    }
}

/// Timing knobs of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimings {
    /// Overall budget
    pub timeout: Duration,
    /// Sleep before the first refresh
    pub delay: Duration,
    /// Floor of every poll interval
    pub min_timeout: Duration,
    /// Fixed poll interval; `None` means exponential from `min_timeout`
    pub poll_interval: Option<Duration>,
}

impl WaitTimings {
    /// Defaults for server status waits
    pub fn server_defaults() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            delay: Duration::from_secs(10),
            min_timeout: Duration::from_secs(5),
            poll_interval: Some(Duration::from_secs(15)),
        }
    }

    /// Defaults for task waits
    pub fn task_defaults() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            delay: Duration::from_secs(5),
            min_timeout: Duration::from_secs(3),
            poll_interval: Some(Duration::from_secs(10)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One deadline shared by the consecutive waits of an operation
#[derive(Debug, Clone)]
pub struct OperationBudget {
    what: String,
    total: Duration,
    deadline: Instant,
}

impl OperationBudget {
    pub fn start(what: impl Into<String>, total: Duration) -> Self {
        Self {
            what: what.into(),
            total,
            deadline: Instant::now() + total,
        }
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Timings of the next wait, cut down to what is left of the budget
    pub fn stage(&self, timings: WaitTimings) -> Result<WaitTimings> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(Error::Timeout {
                what: self.what.clone(),
                timeout: self.total,
                last_status: None,
            });
        }
        Ok(timings.with_timeout(remaining.min(timings.timeout)))
    }
}

/// Error of a wait, with the last subject seen before it
#[derive(Debug)]
pub struct WaitError<T> {
    pub error: Error,
    pub last_observed: Option<T>,
}

impl<T> WaitError<T> {
    fn new(error: Error, last_observed: Option<T>) -> Self {
        Self {
            error,
            last_observed,
        }
    }
}

impl<T> fmt::Display for WaitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl<T: fmt::Debug> std::error::Error for WaitError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

impl<T> From<WaitError<T>> for Error {
    fn from(err: WaitError<T>) -> Self {
        err.error
    }
}

pub type WaitResult<T> = std::result::Result<Option<T>, WaitError<T>>;

/// Builder for [`WaiterConfig`]
pub struct WaiterConfigBuilder<S> {
    what: String,
    pending: HashSet<S>,
    target: HashSet<S>,
    failure: HashSet<S>,
    accept_not_found: bool,
    timings: WaitTimings,
}

impl<S: Clone + Eq + Hash + fmt::Display> WaiterConfigBuilder<S> {
    pub fn pending(mut self, statuses: impl IntoIterator<Item = S>) -> Self {
        self.pending.extend(statuses);
        self
    }

    pub fn target(mut self, statuses: impl IntoIterator<Item = S>) -> Self {
        self.target.extend(statuses);
        self
    }

    pub fn failure(mut self, statuses: impl IntoIterator<Item = S>) -> Self {
        self.failure.extend(statuses);
        self
    }

    /// Treat a vanished subject as success
    pub fn accept_not_found(mut self) -> Self {
        self.accept_not_found = true;
        self
    }

    pub fn timings(mut self, timings: WaitTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn build(self) -> Result<WaiterConfig<S>> {
        let overlap = |a: &HashSet<S>, b: &HashSet<S>, names: &str| -> Result<()> {
            if let Some(status) = a.intersection(b).next() {
                return Err(Error::InvalidConfig(format!(
                    "status '{}' is in both {} sets of the {} waiter",
                    status, names, self.what
                )));
            }
            Ok(())
        };
        overlap(&self.pending, &self.target, "pending and target")?;
        overlap(&self.pending, &self.failure, "pending and failure")?;
        overlap(&self.target, &self.failure, "target and failure")?;

        if self.target.is_empty() && !self.accept_not_found {
            return Err(Error::InvalidConfig(format!(
                "{} waiter has no target status and does not accept not-found",
                self.what
            )));
        }
        if self.timings.timeout.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "{} waiter timeout must be positive",
                self.what
            )));
        }

        Ok(WaiterConfig {
            what: self.what,
            pending: self.pending,
            target: self.target,
            failure: self.failure,
            accept_not_found: self.accept_not_found,
            timings: self.timings,
        })
    }
}

/// Validated wait definition
#[derive(Debug, Clone)]
pub struct WaiterConfig<S> {
    what: String,
    pending: HashSet<S>,
    target: HashSet<S>,
    failure: HashSet<S>,
    accept_not_found: bool,
    timings: WaitTimings,
}

impl<S: Clone + Eq + Hash + fmt::Display + fmt::Debug> WaiterConfig<S> {
    /// Start a waiter definition; `what` names the subject in logs and errors
    pub fn builder(what: impl Into<String>) -> WaiterConfigBuilder<S> {
        WaiterConfigBuilder {
            what: what.into(),
            pending: HashSet::new(),
            target: HashSet::new(),
            failure: HashSet::new(),
            accept_not_found: false,
            timings: WaitTimings::task_defaults(),
        }
    }

    pub fn what(&self) -> &str {
        &self.what
    }

    pub fn timings(&self) -> &WaitTimings {
        &self.timings
    }

    /// Poll `refresh` until the subject reaches a target status.
    ///
    /// Returns `Ok(None)` when the subject disappeared and not-found is
    /// accepted. Refresh errors stop the wait at once.
    pub async fn wait<T, F, Fut>(&self, cancel: &CancellationToken, mut refresh: F) -> WaitResult<T>
    where
        T: StatusSubject<Status = S>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Refresh<T>>>,
    {
        if cancel.is_cancelled() {
            return Err(WaitError::new(Error::Cancelled, None));
        }

        info!("Waiting for {}...", self.what);
        let deadline = Instant::now() + self.timings.timeout;

        if !self.timings.delay.is_zero() {
            let wake = (Instant::now() + self.timings.delay).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::new(Error::Cancelled, None)),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        let mut last_observed: Option<T> = None;
        let mut backoff = self.timings.min_timeout.max(MIN_BACKOFF_INTERVAL);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let refreshed = match refresh().await {
                Ok(refreshed) => refreshed,
                Err(e) => return Err(WaitError::new(e, last_observed)),
            };

            match refreshed {
                Refresh::NotFound => {
                    if self.accept_not_found {
                        info!("✓ {} is gone", self.what);
                        return Ok(None);
                    }
                    return Err(WaitError::new(
                        Error::NotFound {
                            what: self.what.clone(),
                        },
                        last_observed,
                    ));
                }
                Refresh::Found(subject) => {
                    let status = subject.status();
                    if self.target.contains(&status) {
                        info!("✓ {} reached '{}'", self.what, status);
                        return Ok(Some(subject));
                    }
                    if self.failure.contains(&status) {
                        let reason = subject
                            .failure_reason()
                            .unwrap_or_else(|| "no reason reported".to_string());
                        return Err(WaitError::new(
                            Error::Failed {
                                what: self.what.clone(),
                                status: status.to_string(),
                                reason,
                            },
                            Some(subject),
                        ));
                    }
                    if !self.pending.contains(&status) {
                        return Err(WaitError::new(
                            Error::UnexpectedState {
                                what: self.what.clone(),
                                status: status.to_string(),
                            },
                            Some(subject),
                        ));
                    }
                    debug!(attempt, status = %status, "{} still pending", self.what);
                    last_observed = Some(subject);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let last_status = last_observed.as_ref().map(|s| s.status().to_string());
                return Err(WaitError::new(
                    Error::Timeout {
                        what: self.what.clone(),
                        timeout: self.timings.timeout,
                        last_status,
                    },
                    last_observed,
                ));
            }

            let interval = match self.timings.poll_interval {
                Some(interval) => interval.max(self.timings.min_timeout),
                None => {
                    let current = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF_INTERVAL);
                    current
                }
            };
            let wake = (now + interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WaitError::new(Error::Cancelled, last_observed));
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

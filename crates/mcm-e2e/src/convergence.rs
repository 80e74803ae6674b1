//! Fixed-interval polling of an observed count until it reaches a target
//!
//! Unlike [`mcm_e2e_common::kube_utils::poll_until`], a timeout here is an
//! outcome rather than an error: the caller gets the last observed value and
//! decides how to report it.
//!
//! A sampler returns `None` when it could not observe anything (a failed API
//! call). That is never mistaken for a value, in particular not for 0.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Interval between samples of the node count
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Result of one convergence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Convergence {
    pub achieved: bool,
    /// `None` if no sample ever succeeded
    pub last_observed: Option<u32>,
    pub samples: u32,
    pub elapsed: Duration,
}

impl Convergence {
    /// Turn a missed target into [`Error::ConvergenceTimeout`]
    pub fn into_result(self, description: &str, expected: u32) -> Result<Self> {
        if self.achieved {
            Ok(self)
        } else {
            Err(Error::ConvergenceTimeout {
                description: description.to_string(),
                expected,
                last_observed: self.last_observed,
            })
        }
    }
}

/// Sample until the value equals `want` or `timeout` has elapsed.
///
/// The first sample is taken immediately. A failed sample (`None`) keeps the
/// previous observation and polling goes on. The wait never overshoots the
/// deadline: the last sleep is cut short so the final sample lands on it.
/// `sample` must be read-only; it is called from the sequencer while the
/// controllers keep running.
pub async fn await_value<F, Fut>(
    mut sample: F,
    want: u32,
    interval: Duration,
    timeout: Duration,
) -> Convergence
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<u32>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut samples = 0;
    let mut last_observed = None;

    loop {
        let observed = sample().await;
        samples += 1;

        if observed == Some(want) {
            return Convergence {
                achieved: true,
                last_observed: observed,
                samples,
                elapsed: start.elapsed(),
            };
        }
        if observed.is_some() {
            last_observed = observed;
        }

        let now = Instant::now();
        if now >= deadline {
            return Convergence {
                achieved: false,
                last_observed,
                samples,
                elapsed: start.elapsed(),
            };
        }

        debug!(want, observed = ?observed, "Not converged yet");
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// One named convergence assertion
#[derive(Debug, Clone)]
pub struct ConvergenceTarget {
    description: String,
    want: u32,
    interval: Duration,
    timeout: Duration,
}

impl ConvergenceTarget {
    pub fn new(description: impl Into<String>, want: u32, timeout: Duration) -> Self {
        Self {
            description: description.into(),
            want,
            interval: DEFAULT_INTERVAL,
            timeout,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn want(&self) -> u32 {
        self.want
    }

    /// Poll `sample` and log the outcome
    pub async fn poll<F, Fut>(&self, sample: F) -> Convergence
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<u32>>,
    {
        info!(
            target_value = self.want,
            timeout_secs = self.timeout.as_secs(),
            "Waiting for {}",
            self.description
        );
        let outcome = await_value(sample, self.want, self.interval, self.timeout).await;
        if outcome.achieved {
            info!(
                elapsed_secs = outcome.elapsed.as_secs(),
                "{} reached {}", self.description, self.want
            );
        } else {
            warn!(
                expected = self.want,
                last_observed = ?outcome.last_observed,
                "{} did not converge",
                self.description
            );
        }
        outcome
    }

    /// Poll `sample`; missing the target is an error
    pub async fn assert<F, Fut>(&self, sample: F) -> Result<Convergence>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<u32>>,
    {
        self.poll(sample)
            .await
            .into_result(&self.description, self.want)
    }
}

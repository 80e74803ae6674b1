//! Run-all-and-report step execution.
//!
//! A failing or panicking step is recorded and the next step still runs;
//! [`TestHarness::finish`] prints the summary and fails if anything failed.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Longest error text shown per step in the summary
const MAX_ERROR_LEN: usize = 200;

#[derive(Debug, Clone)]
pub struct StepResult {
    pub name: String,
    pub passed: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

pub struct TestHarness {
    suite: String,
    results: Arc<Mutex<Vec<StepResult>>>,
}

impl TestHarness {
    pub fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn run<F, Fut>(&self, name: &str, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        info!(step = %name, "Running step");
        let start = Instant::now();
        let result = AssertUnwindSafe(f()).catch_unwind().await;
        let (passed, error) = match result {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                (false, Some(format!("PANIC: {msg}")))
            }
        };
        if let Some(ref e) = error {
            error!(step = %name, error = %e, "Step failed");
        }
        self.record(name, passed, start.elapsed(), error);
    }

    pub fn record(&self, name: &str, passed: bool, duration: Duration, error: Option<String>) {
        self.results.lock().push(StepResult {
            name: name.to_string(),
            passed,
            duration,
            error,
        });
    }

    pub fn results(&self) -> Vec<StepResult> {
        self.results.lock().clone()
    }

    pub fn finish(&self) -> Result<()> {
        let results = self.results.lock();
        let total_duration: Duration = results.iter().map(|r| r.duration).sum();
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.len() - passed;

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in results.iter() {
            let tag = if r.passed { "PASS" } else { "FAIL" };
            info!("  {tag}  {:40} {:.1}s", r.name, r.duration.as_secs_f64());
            if let Some(ref e) = r.error {
                info!("        -> {}", truncate(e, MAX_ERROR_LEN));
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total)",
            passed,
            failed,
            total_duration.as_secs_f64()
        );
        info!("========================================");

        if failed > 0 {
            let failures: Vec<_> = results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| r.name.as_str())
                .collect();
            Err(Error::assertion(format!(
                "{} step(s) failed in {}: {}",
                failed,
                self.suite,
                failures.join(", ")
            )))
        } else {
            Ok(())
        }
    }
}

/// Cut `s` to at most `max` bytes without splitting a character
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

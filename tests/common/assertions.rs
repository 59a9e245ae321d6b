//! Assertion helpers for integration tests
//!
//! Return TestResult instead of panicking so failures carry context.

use super::harness::{TestError, TestResult};
use std::future::Future;
use std::time::{Duration, Instant};

pub struct Assertions;

impl Assertions {
    /// Wait for a synchronous condition with timeout
    pub async fn wait_for<F>(mut condition: F, timeout: Duration, context: &str) -> TestResult<()>
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);

        while start.elapsed() < timeout {
            if condition() {
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }

        Err(TestError::Timeout(format!(
            "{}: condition not met within {:?}",
            context, timeout
        )))
    }

    /// Wait for an async condition with timeout
    pub async fn wait_for_async<F, Fut>(
        mut condition: F,
        timeout: Duration,
        context: &str,
    ) -> TestResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);

        while start.elapsed() < timeout {
            if condition().await {
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }

        Err(TestError::Timeout(format!(
            "{}: condition not met within {:?}",
            context, timeout
        )))
    }

    pub fn assert_eq<T: PartialEq + std::fmt::Debug>(actual: T, expected: T, context: &str) -> TestResult<()> {
        if actual != expected {
            return Err(TestError::Assertion(format!(
                "{}: expected {:?}, got {:?}",
                context, expected, actual
            )));
        }
        Ok(())
    }

    pub fn assert_in_range<T: PartialOrd + std::fmt::Debug>(
        value: T,
        min: T,
        max: T,
        context: &str,
    ) -> TestResult<()> {
        if value < min || value > max {
            return Err(TestError::Assertion(format!(
                "{}: value {:?} not in range [{:?}, {:?}]",
                context, value, min, max
            )));
        }
        Ok(())
    }
}

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use log::warn;

/// Errors that know whether repeating the request could help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Exponential backoff applied to every outbound request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    pub fn run<T, E>(&self, label: &str, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E>
    where
        E: Retryable + Display,
    {
        let mut failures = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    if failures >= self.max_attempts || !err.is_retryable() {
                        return Err(err);
                    }
                    let delay = self.delay_for(failures);
                    warn!(
                        "{label} failed (attempt {failures}/{}): {err}. Retrying in {:.1}s",
                        self.max_attempts,
                        delay.as_secs_f64()
                    );
                    thread::sleep(delay);
                }
            }
        }
    }
}

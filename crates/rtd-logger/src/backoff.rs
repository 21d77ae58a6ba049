// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Exponential backoff for the initial controller connect.

use crate::config::ControllerConfig;
use std::time::Duration;

/// Bounded exponential backoff.
///
/// Delay for retry `n` (1-based) is `initial * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            max_attempts: max_attempts.max(1),
            attempts: 0,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.connect_attempts,
        )
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.max_attempts {
            return None;
        }
        let exponent = self.attempts.saturating_sub(1).min(63);
        let delay_ms = self
            .initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms);
        Some(Duration::from_millis(delay_ms))
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_attempt_never_waits() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(10), 1);
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempts(), 1);
    }

    #[test]
    fn test_doubles_until_cap() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_millis(3000), 6);
        let delays: Vec<_> = std::iter::from_fn(|| b.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(3000),
                Duration::from_millis(3000),
            ]
        );
        assert_eq!(b.attempts(), 6);
    }

    #[test]
    fn test_zero_attempts_treated_as_one() {
        let b = Backoff::new(Duration::from_millis(1), Duration::from_millis(1), 0);
        assert_eq!(b.max_attempts(), 1);
    }

    #[test]
    fn test_reset() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 3);
        b.next_delay();
        b.next_delay();
        assert_eq!(b.next_delay(), None);
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_from_config_defaults() {
        let b = Backoff::from_config(&ControllerConfig::default());
        assert_eq!(b.max_attempts(), 1);
    }
}

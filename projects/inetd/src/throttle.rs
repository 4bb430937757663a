//! Failure throttling for services whose handlers keep failing.
//!
//! Every reaped handler is classified as success or failure. Failures are
//! kept in a sliding window per entry; once `max_failures` fall inside
//! `window` the entry is disabled for `backoff` and its socket leaves the
//! watch set. Re-enabling happens lazily, the control loop bounds its wait
//! by the nearest `disabled_until` and calls [`Health::readmit_if_elapsed`].

use crate::signal_handler::ChildTermination;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ThrottlePolicy {
    /// Failures inside `window` that disable the entry. 0 turns throttling off.
    pub max_failures: usize,
    pub window: Duration,
    pub backoff: Duration,
    /// Handlers exiting faster than this count as failed even with status 0
    pub min_runtime: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(10),
            backoff: Duration::from_secs(60),
            min_runtime: Duration::from_millis(50),
        }
    }
}

/// Failure tracking state of one service entry
#[derive(Clone, Debug, Default)]
pub struct Health {
    failures: VecDeque<Instant>,
    disabled_until: Option<Instant>,
}

impl Health {
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.disabled_until.is_some()
    }

    #[must_use]
    pub const fn disabled_until(&self) -> Option<Instant> {
        self.disabled_until
    }

    #[cfg(test)]
    pub fn recent_failures(&self) -> usize {
        self.failures.len()
    }

    /// Clear the disabled state once its deadline passed. Returns true on that transition.
    pub fn readmit_if_elapsed(&mut self, now: Instant) -> bool {
        match self.disabled_until {
            Some(until) if until <= now => {
                self.disabled_until = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThrottleVerdict {
    Healthy,
    Failed { recent: usize },
    Disabled { until: Instant, failures: usize },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FailureThrottle {
    pub policy: ThrottlePolicy,
}

impl FailureThrottle {
    #[must_use]
    pub const fn new(policy: ThrottlePolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn is_failure(&self, termination: &ChildTermination, runtime: Duration) -> bool {
        !termination.success() || runtime < self.policy.min_runtime
    }

    /// Fold one handler outcome into the entry's health
    pub fn record(&self, health: &mut Health, failed: bool, now: Instant) -> ThrottleVerdict {
        if !failed {
            return ThrottleVerdict::Healthy;
        }
        health.failures.push_back(now);
        while let Some(oldest) = health.failures.front() {
            if now.saturating_duration_since(*oldest) > self.policy.window {
                health.failures.pop_front();
            } else {
                break;
            }
        }

        let failures = health.failures.len();
        if self.policy.max_failures > 0 && failures >= self.policy.max_failures {
            let until = now + self.policy.backoff;
            health.failures.clear();
            health.disabled_until = Some(until);
            ThrottleVerdict::Disabled { until, failures }
        } else {
            ThrottleVerdict::Failed { recent: failures }
        }
    }
}

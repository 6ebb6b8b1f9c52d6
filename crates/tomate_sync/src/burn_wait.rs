// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant};

/// A bounded busy-wait: one CPU-relaxing pause per call, until a deadline.
///
/// Callers compose it as the predicate of a retry loop:
///
/// ```
/// use tomate_sync::BurnWait;
/// use std::time::Duration;
///
/// let burn = BurnWait::new(Some(Duration::from_millis(5)));
/// let mut attempts = 0_u64;
/// while burn.wait() {
///     attempts += 1; // retry the contended operation here
/// }
/// assert!(attempts > 0);
/// ```
///
/// Deadlines are measured on the monotonic clock, so they are immune to wall
/// clock steps.
#[derive(Debug, Clone, Copy)]
pub struct BurnWait {
    deadline: Option<Instant>,
}

impl BurnWait {
    /// Creates a burn-wait expiring after `max_wait`, or never for `None`.
    #[must_use]
    pub fn new(max_wait: Option<Duration>) -> Self {
        Self {
            deadline: max_wait.map(|d| Instant::now() + d),
        }
    }

    /// A burn-wait that never expires.
    #[must_use]
    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    /// Pauses once and returns true, or returns false once the deadline passed.
    #[must_use]
    pub fn wait(&self) -> bool {
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return false;
        }

        std::hint::spin_loop();
        true
    }

    /// Whether the deadline has passed. Does not pause.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_never_expires() {
        let burn = BurnWait::unbounded();

        for _ in 0..1000 {
            assert!(burn.wait());
        }
        assert!(!burn.expired());
    }

    #[test]
    fn zero_deadline_expires_immediately() {
        let burn = BurnWait::new(Some(Duration::ZERO));

        assert!(!burn.wait());
        assert!(burn.expired());
    }

    #[test]
    fn waits_until_the_deadline() {
        let burn = BurnWait::new(Some(Duration::from_millis(10)));

        let start = Instant::now();
        while burn.wait() {}

        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}

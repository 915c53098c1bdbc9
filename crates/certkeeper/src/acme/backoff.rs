//! Bounded exponential backoff for polling ACME resources.

use std::time::Duration;

use tokio::time::Instant;

/// Polling policy for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// First delay between polls
    pub initial_interval: Duration,
    /// Upper bound for any single delay
    pub maximum_interval: Duration,
    /// Overall budget for the stage
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            maximum_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(300),
        }
    }
}

impl PollPolicy {
    pub fn new(initial_interval: Duration, maximum_interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_interval,
            maximum_interval: maximum_interval.max(initial_interval),
            timeout,
        }
    }

    /// Start a backoff sequence that must finish by `ceiling` at the latest
    pub fn start(&self, ceiling: Option<Instant>) -> Backoff {
        let stage_deadline = Instant::now() + self.timeout;
        let (deadline, capped_by_ceiling) = match ceiling {
            Some(ceiling) if ceiling < stage_deadline => (ceiling, true),
            _ => (stage_deadline, false),
        };
        Backoff {
            next: self.initial_interval,
            maximum: self.maximum_interval,
            started: Instant::now(),
            deadline,
            capped_by_ceiling,
            attempts: 0,
        }
    }
}

/// Running backoff state: doubling delays, capped, with a hard deadline
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
    maximum: Duration,
    started: Instant,
    deadline: Instant,
    capped_by_ceiling: bool,
    attempts: u32,
}

impl Backoff {
    /// Sleep before the next attempt
    ///
    /// A `Retry-After` hint raises the delay (never above the cap). The sleep
    /// never extends past the deadline, so one last attempt can be made at
    /// the deadline itself. Returns `false` once the budget is spent.
    pub async fn wait(&mut self, retry_after: Option<Duration>) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }

        let mut delay = self.next;
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(self.maximum));
        }
        let remaining = self.deadline - now;
        let delay = delay.min(remaining);

        self.next = (self.next * 2).min(self.maximum);
        self.attempts += 1;

        tokio::time::sleep(delay).await;
        true
    }

    /// Number of completed waits
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time since the sequence started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the run ceiling, not the stage budget, bounds this sequence
    pub fn capped_by_ceiling(&self) -> bool {
        self.capped_by_ceiling
    }

    /// Whether the budget is spent
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

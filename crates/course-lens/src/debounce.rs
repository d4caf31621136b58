//! Restartable quiet-period timer.
//!
//! A [`Debouncer`] fires once its quiet period has elapsed since the most
//! recent [`Debouncer::poke`]. Every poke restarts the period.

use std::time::Duration;

use tokio::time::Instant;

/// Quiet period after an intercepted response.
pub const RESPONSE_QUIET: Duration = Duration::from_millis(1000);
/// Quiet period after a relevant DOM mutation.
pub const MUTATION_QUIET: Duration = Duration::from_millis(500);
/// Delay before the first processing pass of a page view.
pub const STARTUP_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct Debouncer {
    quiet: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            deadline: None,
        }
    }

    pub fn quiet(&self) -> Duration {
        self.quiet
    }

    /// Restart the quiet period from `now`.
    pub fn poke(&mut self, now: Instant) {
        self.deadline = Some(now + self.quiet);
    }

    /// Arm for an explicit instant, keeping any later deadline.
    pub fn arm_at(&mut self, at: Instant) {
        self.deadline = Some(self.deadline.map_or(at, |d| d.max(at)));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Consume a due deadline. Returns true at most once per quiet period.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Sleep until the deadline. Pends forever while disarmed.
    pub async fn wait(&self) {
        sleep_until_deadline(self.deadline).await
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// The earlier of two optional deadlines.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

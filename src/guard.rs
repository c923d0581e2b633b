//! Time-windowed suppression of destructive stack actions.
//!
//! Holds a single suppress-until instant. Nothing fires when the window ends;
//! callers poll [`GuardClock::is_suppressed`] at the moment they act.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct GuardClock {
    suppress_until: Option<Instant>,
}

impl GuardClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress until `now + duration`. A shorter request never shortens an
    /// open window.
    pub fn suppress(&mut self, duration: Duration) {
        let until = Instant::now() + duration;
        self.suppress_until = Some(match self.suppress_until {
            Some(current) if current > until => current,
            _ => until,
        });
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// End of the open window, if one is open
    pub fn deadline(&self) -> Option<Instant> {
        self.suppress_until.filter(|until| Instant::now() < *until)
    }

    pub fn remaining(&self) -> Duration {
        self.deadline()
            .map(|until| until - Instant::now())
            .unwrap_or(Duration::ZERO)
    }
}

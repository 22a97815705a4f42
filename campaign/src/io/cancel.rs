//! Cooperative cancellation shared between the engine and its collaborators.
//!
//! Cancelling never kills anything. Executors and hook runners poll
//! [`CancelSignal::is_cancelled`] and wind down on their own.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child signal that also expires after `timeout`.
    ///
    /// The child shares the parent's cancellation flag.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// True once the deadline has passed, regardless of explicit cancellation.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_visible_to_clones_and_children() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        let child = signal.with_timeout(Duration::from_secs(60));
        assert!(!child.is_cancelled());

        signal.cancel();
        assert!(clone.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_expires_at_its_deadline() {
        let child = CancelSignal::new().with_timeout(Duration::ZERO);
        assert!(child.is_cancelled());
        assert!(child.is_expired());
        assert_eq!(child.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn child_keeps_the_tighter_deadline() {
        let parent = CancelSignal::new().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        let remaining = child.remaining().expect("deadline");
        assert!(remaining <= Duration::from_millis(10));
    }
}

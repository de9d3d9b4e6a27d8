//! Owned, cancellable timer slots.
//!
//! Each debounce source owns exactly one [`TimerSlot`]. Arming a slot
//! replaces whatever was pending, so a superseded callback can never fire.
//! The session loop sleeps until the earliest armed deadline and then asks
//! the owner to fire whatever has expired.

use tokio::time::Instant;

/// Timer kinds the core schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Reconnect,
    AudioStop,
}

/// A single pending deadline
#[derive(Debug)]
pub struct TimerSlot {
    kind: TimerKind,
    deadline: Option<Instant>,
}

impl TimerSlot {
    pub fn new(kind: TimerKind) -> Self {
        Self { kind, deadline: None }
    }

    /// Arm the slot, cancelling any previously pending deadline
    pub fn arm(&mut self, deadline: Instant) {
        if let Some(previous) = self.deadline.replace(deadline) {
            tracing::trace!(kind = ?self.kind, ?previous, "Replaced pending timer");
        }
    }

    /// Cancel the pending deadline; returns whether one was armed
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarm and report `true` if the deadline has passed
    pub fn take_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Sleep until `deadline`, or forever when nothing is armed
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_arm_replaces_previous() {
        let now = Instant::now();
        let mut slot = TimerSlot::new(TimerKind::AudioStop);

        slot.arm(now + Duration::from_millis(100));
        slot.arm(now + Duration::from_millis(500));

        assert!(!slot.take_expired(now + Duration::from_millis(200)));
        assert!(slot.take_expired(now + Duration::from_millis(500)));
        assert!(slot.deadline().is_none());
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut slot = TimerSlot::new(TimerKind::Reconnect);

        assert!(!slot.cancel());
        slot.arm(now);
        assert!(slot.cancel());
        assert!(!slot.take_expired(now + Duration::from_secs(1)));
    }
}

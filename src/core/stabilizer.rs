//! Audio presence stabilizer.
//!
//! Debounces a bursty playing/not-playing signal into a stable boolean.
//! A start always wins immediately; a stop is held back long enough to
//! absorb the gaps between short utterances.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::timer::{TimerKind, TimerSlot};

/// Stabilizer timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilizerConfig {
    /// A stop within this long after the last start waits for the window to end
    pub keep_window: Duration,

    /// Hold applied to a stop outside the keep window
    pub stop_hold: Duration,

    /// Added after the keep window elapses
    pub margin: Duration,

    /// Lower bound for the keep-window wait
    pub min_wait: Duration,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            keep_window: Duration::from_millis(1100),
            stop_hold: Duration::from_millis(860),
            margin: Duration::from_millis(40),
            min_wait: Duration::from_millis(120),
        }
    }
}

/// Debounced playing indicator
#[derive(Debug)]
pub struct AudioStabilizer {
    config: StabilizerConfig,
    playing: bool,
    last_signal: Option<Instant>,
    stop_timer: TimerSlot,
}

impl AudioStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config,
            playing: false,
            last_signal: None,
            stop_timer: TimerSlot::new(TimerKind::AudioStop),
        }
    }

    /// Externally observed value
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Deadline of the pending stop, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.stop_timer.deadline()
    }

    /// Feed a signal. Returns the new observed value when it changed.
    pub fn set_playing(&mut self, playing: bool, immediate: bool, now: Instant) -> Option<bool> {
        if playing {
            self.last_signal = Some(now);
            self.stop_timer.cancel();
            return self.observe(true);
        }

        if immediate {
            self.stop_timer.cancel();
            return self.observe(false);
        }

        if !self.playing {
            self.stop_timer.cancel();
            return None;
        }

        let wait = match self.last_signal.map(|at| now.saturating_duration_since(at)) {
            Some(since) if since < self.config.keep_window => {
                (self.config.keep_window - since + self.config.margin).max(self.config.min_wait)
            }
            _ => self.config.stop_hold,
        };
        debug!(wait_ms = wait.as_millis() as u64, "Deferring audio stop");
        self.stop_timer.arm(now + wait);
        None
    }

    /// Fire the pending stop if its deadline passed
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        if self.stop_timer.take_expired(now) {
            return self.observe(false);
        }
        None
    }

    /// Drop all history and stop immediately
    pub fn reset(&mut self, now: Instant) -> Option<bool> {
        self.last_signal = None;
        self.set_playing(false, true, now)
    }

    fn observe(&mut self, playing: bool) -> Option<bool> {
        if self.playing == playing {
            return None;
        }
        self.playing = playing;
        Some(playing)
    }
}

impl Default for AudioStabilizer {
    fn default() -> Self {
        Self::new(StabilizerConfig::default())
    }
}

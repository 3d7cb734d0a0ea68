//! Push scheduling
//!
//! A trailing-edge debounce over the act of flushing: every accepted increment
//! re-arms one delayed trigger, so a burst becomes a single flush once the
//! burst goes quiet. The scheduler also enforces single flight. Triggers that
//! arrive while a flush is executing fold into exactly one follow-up flush,
//! started as soon as the in-flight one completes.
//!
//! The scheduler is a plain state machine; the service task owns the timer
//! and asks it what to do.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct PushScheduler {
    coalesce: Duration,
    /// When the armed trigger fires
    deadline: Option<Instant>,
    /// A flush (or the startup handshake) is executing
    in_flight: bool,
    /// A trigger arrived while in flight
    follow_up: bool,
}

impl PushScheduler {
    pub fn new(coalesce: Duration) -> Self {
        Self {
            coalesce,
            deadline: None,
            in_flight: false,
            follow_up: false,
        }
    }

    /// Arm or re-arm the delayed trigger
    pub fn notify(&mut self, now: Instant) {
        if self.in_flight {
            self.follow_up = true;
        } else {
            self.deadline = Some(now + self.coalesce);
        }
    }

    /// Trigger without the coalescing delay
    pub fn flush_now(&mut self, now: Instant) {
        if self.in_flight {
            self.follow_up = true;
        } else {
            self.deadline = Some(now);
        }
    }

    /// When the service should next wake up, if a trigger is armed
    pub fn deadline(&self) -> Option<Instant> {
        if self.in_flight {
            None
        } else {
            self.deadline
        }
    }

    /// Claim the flight slot if the trigger is due. Returns true when the
    /// caller must start a flush.
    pub fn begin_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if !self.in_flight && deadline <= now => {
                self.deadline = None;
                self.in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Claim the flight slot unconditionally (startup handshake)
    pub fn begin(&mut self) {
        self.deadline = None;
        self.in_flight = true;
    }

    /// Release the flight slot; a trigger that arrived meanwhile fires now
    pub fn complete(&mut self, now: Instant) {
        self.in_flight = false;
        if std::mem::take(&mut self.follow_up) {
            self.deadline = Some(now);
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Nothing executing and nothing armed
    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.deadline.is_none() && !self.follow_up
    }
}

//! Per-instance event queue with admission control
//!
//! Insertion order is preserved except for two privileged reorderings:
//! `state_entry` always moves to the front, and the terminal detach signal
//! moves ahead of all ordinary events (behind any leading `state_entry`
//! or earlier detach).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::{Event, EventKind};

/// Default per-kind queue-depth cap.
pub const DEFAULT_QUEUE_CAP: u32 = 64;

/// Cap for throttled kinds, which flood under world churn.
pub const THROTTLED_QUEUE_CAP: u32 = 16;

/// Per-kind queue-depth cap. Timer events are idempotent warnings of
/// elapsed time, so one pending instance is enough.
fn kind_cap(kind: EventKind) -> u32 {
    if kind == EventKind::Timer {
        1
    } else if kind.is_throttled() {
        THROTTLED_QUEUE_CAP
    } else {
        DEFAULT_QUEUE_CAP
    }
}

/// Outcome of offering an event to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued, at whatever position the ordering rules chose.
    Queued,
    /// Dropped: the per-kind minimum delay has not elapsed.
    Throttled,
    /// Dropped: the per-kind live count is at its cap.
    CapExceeded,
}

impl Admission {
    /// Whether the event landed in the queue.
    #[inline]
    pub fn accepted(&self) -> bool {
        matches!(self, Admission::Queued)
    }
}

/// Ordered pending events plus per-kind live counts and throttle clocks.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<Event>,
    live: HashMap<EventKind, u32>,
    next_allowed: HashMap<EventKind, Instant>,
    min_delay: Duration,
}

impl EventQueue {
    /// Empty queue with no throttle delay.
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            live: HashMap::new(),
            next_allowed: HashMap::new(),
            min_delay: Duration::ZERO,
        }
    }

    /// Current minimum inter-event delay for throttled kinds.
    #[inline]
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Set the minimum inter-event delay. Zero disables the throttle.
    #[inline]
    pub fn set_min_delay(&mut self, delay: Duration) {
        self.min_delay = delay;
    }

    /// Number of pending events.
    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Live count for one kind.
    #[inline]
    pub fn live_count(&self, kind: EventKind) -> u32 {
        self.live.get(&kind).copied().unwrap_or(0)
    }

    /// Offer an event, applying throttle, cap, and ordering rules.
    pub fn admit(&mut self, event: Event, now: Instant) -> Admission {
        let kind = event.kind;

        if self.min_delay > Duration::ZERO
            && kind.is_throttled()
            && !event.is_position_scale_change()
        {
            if let Some(&allowed) = self.next_allowed.get(&kind) {
                if now < allowed {
                    return Admission::Throttled;
                }
            }
            self.next_allowed.insert(kind, now + self.min_delay);
        }

        if self.live_count(kind) >= kind_cap(kind) {
            return Admission::CapExceeded;
        }

        let at = self.insert_position(&event);
        self.events.insert(at, event);
        *self.live.entry(kind).or_insert(0) += 1;
        Admission::Queued
    }

    /// Position the ordering rules choose for a new event.
    ///
    /// Re-initialization must precede any other handler, so `state_entry`
    /// goes to the front. The detach signal goes behind any leading run of
    /// `state_entry`/detach and ahead of everything ordinary.
    fn insert_position(&self, event: &Event) -> usize {
        if event.kind == EventKind::StateEntry {
            return 0;
        }
        if event.is_detach() {
            return self
                .events
                .iter()
                .position(|e| e.kind != EventKind::StateEntry && !e.is_detach())
                .unwrap_or(self.events.len());
        }
        self.events.len()
    }

    /// Take the next event, decrementing its live count.
    pub fn dequeue(&mut self) -> Option<Event> {
        let event = self.events.pop_front()?;
        if let Some(count) = self.live.get_mut(&event.kind) {
            *count = count.saturating_sub(1);
        }
        Some(event)
    }

    /// Peek at the head without removing it.
    #[inline]
    pub fn peek(&self) -> Option<&Event> {
        self.events.front()
    }

    /// Remove all queued occurrences of a kind. Returns how many.
    pub fn cancel(&mut self, kind: EventKind) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.kind != kind);
        let removed = before - self.events.len();
        if removed > 0 {
            if let Some(count) = self.live.get_mut(&kind) {
                *count = count.saturating_sub(removed as u32);
            }
        }
        removed
    }

    /// Discard everything.
    pub fn flush(&mut self) {
        self.events.clear();
        self.live.clear();
    }

    /// Snapshot pending events in order, for the durable blob.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    /// Append an event without admission control, recounting live totals.
    /// Used by the restore path, which must preserve recorded order.
    pub fn restore_push(&mut self, event: Event) {
        *self.live.entry(event.kind).or_insert(0) += 1;
        self.events.push_back(event);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

//! A monotonic-time priority queue of callbacks, standing in for a native
//! event loop (design note: "event-driven control flow without a native
//! event loop").
//!
//! Timers are identified by a small integer handle. A timer's callback
//! returns its next wake time, or [`Reactor::NEVER`] to unregister itself.
//! Nothing here touches wall-clock time directly: callers drive the clock
//! by calling [`Reactor::pause`] with the current monotonic time, which lets
//! tests advance the reactor deterministically without sleeping.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub type TimerId = u64;

struct ScheduledTimer {
    waketime: f64,
    id: TimerId,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.waketime == other.waketime && self.id == other.id
    }
}
impl Eq for ScheduledTimer {}
impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so BinaryHeap (a max-heap) pops the earliest waketime.
        other
            .waketime
            .partial_cmp(&self.waketime)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A single-threaded cooperative scheduler: holds a min-heap of pending
/// timer firings ordered by waketime. The reactor never sleeps itself; the
/// embedding process decides how to wait between [`Reactor::next_waketime`]
/// and the current time (real sleep in production, instant advance in
/// tests).
pub struct Reactor {
    heap: BinaryHeap<ScheduledTimer>,
    next_id: TimerId,
    now: f64,
    can_pause: bool,
}

impl Reactor {
    pub const NEVER: f64 = f64::INFINITY;

    pub fn new(start_time: f64) -> Self {
        Reactor {
            heap: BinaryHeap::new(),
            next_id: 0,
            now: start_time,
            can_pause: true,
        }
    }

    pub fn monotonic(&self) -> f64 {
        self.now
    }

    /// Registers a one-shot timer. Does not run it; the caller must drive
    /// firing via [`Reactor::pause`] or [`Reactor::dispatch_until`].
    pub fn register_timer(&mut self, waketime: f64) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(ScheduledTimer { waketime, id });
        id
    }

    pub fn update_timer(&mut self, id: TimerId, waketime: f64) {
        // BinaryHeap has no efficient decrease-key; push a fresh entry and
        // let dispatch skip stale duplicates. Timer ids are intentionally
        // cheap and plentiful.
        self.heap.push(ScheduledTimer { waketime, id });
    }

    pub fn next_waketime(&self) -> f64 {
        self.heap
            .peek()
            .map(|t| t.waketime)
            .unwrap_or(Self::NEVER)
    }

    /// Advances the reactor's notion of "now" to `until` and pops (without
    /// invoking) any timers due by then. Returns the ids that fired, in
    /// waketime order, so the caller can run their callbacks and decide on
    /// rescheduling.
    ///
    /// Mirrors `reactor.pause(until)`: it yields control up to `until` to
    /// let other registered timers run before returning.
    pub fn pause(&mut self, until: f64) -> Vec<TimerId> {
        if !self.can_pause {
            return Vec::new();
        }
        self.now = self.now.max(until);
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.waketime > self.now {
                break;
            }
            fired.push(self.heap.pop().unwrap().id);
        }
        fired
    }

    /// Disallow any further pausing (entered on fatal shutdown).
    pub fn disable_pausing(&mut self) {
        self.can_pause = false;
    }

    pub fn can_pause(&self) -> bool {
        self.can_pause
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_waketime_order() {
        let mut r = Reactor::new(0.0);
        let a = r.register_timer(5.0);
        let b = r.register_timer(1.0);
        let c = r.register_timer(3.0);
        let fired = r.pause(10.0);
        assert_eq!(fired, vec![b, c, a]);
    }

    #[test]
    fn pause_never_fires_future_timers() {
        let mut r = Reactor::new(0.0);
        r.register_timer(5.0);
        let fired = r.pause(2.0);
        assert!(fired.is_empty());
        assert_eq!(r.monotonic(), 2.0);
    }

    #[test]
    fn disabled_pausing_yields_no_fires() {
        let mut r = Reactor::new(0.0);
        r.register_timer(1.0);
        r.disable_pausing();
        assert!(r.pause(5.0).is_empty());
    }
}

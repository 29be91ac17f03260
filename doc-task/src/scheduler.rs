//! The single-threaded, run-to-completion dispatcher that drives a task.
//!
//! A `Dispatcher` owns a virtual clock and a queue of scheduled events. It
//! never runs anything by itself: a driver (the simulation loop, the realtime
//! engine, or a test) asks it for the next due event and hands that event to
//! its owner, one at a time. Each handler runs to completion before the next
//! event is popped, so no two handlers ever overlap.
//!
//! Ordering rules:
//! - Posted events run before any timer, in FIFO order.
//! - Timers run in deadline order. Equal deadlines are broken by `Lane`
//!   (task-internal timers before collaborator timers), then by scheduling
//!   order.

use crate::common::TimerId;
use slotmap::SlotMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;
use tracing::trace;

/// The priority class of a timer, used only to break deadline ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lane {
    /// Timers owned by the task itself: epoch deadlines, change timers,
    /// the safety timer.
    Task,
    /// Timers standing in for external collaborators, such as a simulated
    /// stimulus flash clock.
    Collaborator,
}

#[doc(hidden)]
struct TimerEntry<E> {
    deadline: Duration,
    period: Option<Duration>,
    lane: Lane,
    seq: u64,
    event: E,
}

/// A deterministic timer queue with a virtual clock.
pub struct Dispatcher<E> {
    now: Duration,
    next_seq: u64,
    timers: SlotMap<TimerId, TimerEntry<E>>,
    queue: BinaryHeap<Reverse<(Duration, Lane, u64, TimerId)>>,
    posted: VecDeque<E>,
}

impl<E> Default for Dispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Dispatcher<E> {
    /// Creates an empty dispatcher with its clock at zero.
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_seq: 0,
            timers: SlotMap::with_key(),
            queue: BinaryHeap::new(),
            posted: VecDeque::new(),
        }
    }

    /// The current session time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedules `event` to fire once, `delay` from now.
    pub fn schedule_once(&mut self, delay: Duration, lane: Lane, event: E) -> TimerId {
        self.insert(self.now + delay, None, lane, event)
    }

    /// Schedules `event` to fire every `period`, first at `now + period`.
    ///
    /// A zero period is clamped to one millisecond so the queue always makes
    /// progress.
    pub fn schedule_every(&mut self, period: Duration, lane: Lane, event: E) -> TimerId {
        let period = period.max(Duration::from_millis(1));
        self.insert(self.now + period, Some(period), lane, event)
    }

    /// Cancels a timer. Returns `true` if it was still pending.
    ///
    /// Cancelling an unknown, fired or already-cancelled timer is a no-op.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.remove(id).is_some()
    }

    /// Queues an event to run before any timer, at the current time.
    pub fn post(&mut self, event: E) {
        self.posted.push_back(event);
    }

    /// The deadline of the earliest live timer, or the current time if an
    /// event has been posted.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        if !self.posted.is_empty() {
            return Some(self.now);
        }
        self.discard_stale();
        self.queue.peek().map(|Reverse((deadline, ..))| *deadline)
    }

    /// Number of live timers.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Pops the next event due at or before `until`, advancing the clock to
    /// its deadline. Returns `None` once nothing else is due.
    pub fn pop_due(&mut self, until: Duration) -> Option<E>
    where
        E: Clone,
    {
        if let Some(event) = self.posted.pop_front() {
            return Some(event);
        }
        self.discard_stale();
        let Reverse((deadline, _, _, id)) = *self.queue.peek()?;
        if deadline > until {
            return None;
        }
        self.queue.pop();
        if deadline > self.now {
            self.now = deadline;
        }
        trace!(?id, at = ?deadline, "Timer fired.");

        let entry = self.timers.get(id)?;
        match entry.period {
            Some(period) => {
                let event = entry.event.clone();
                let next = deadline + period;
                let lane = entry.lane;
                let seq = self.bump_seq();
                if let Some(entry) = self.timers.get_mut(id) {
                    entry.deadline = next;
                    entry.seq = seq;
                }
                self.queue.push(Reverse((next, lane, seq, id)));
                Some(event)
            }
            None => self.timers.remove(id).map(|entry| entry.event),
        }
    }

    /// Moves the clock forward to `to`. The clock never runs backwards.
    ///
    /// Callers are expected to have drained every event due before `to`.
    pub fn advance_to(&mut self, to: Duration) {
        if to > self.now {
            self.now = to;
        }
    }

    fn insert(&mut self, deadline: Duration, period: Option<Duration>, lane: Lane, event: E) -> TimerId {
        let seq = self.bump_seq();
        let id = self.timers.insert(TimerEntry {
            deadline,
            period,
            lane,
            seq,
            event,
        });
        self.queue.push(Reverse((deadline, lane, seq, id)));
        id
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Drops heap entries whose timer was cancelled or re-armed.
    fn discard_stale(&mut self) {
        while let Some(&Reverse((_, _, seq, id))) = self.queue.peek() {
            match self.timers.get(id) {
                Some(entry) if entry.seq == seq => break,
                _ => {
                    self.queue.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn drain(d: &mut Dispatcher<&'static str>, until: Duration) -> Vec<&'static str> {
        let mut fired = Vec::new();
        while let Some(ev) = d.pop_due(until) {
            fired.push(ev);
        }
        d.advance_to(until);
        fired
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut d = Dispatcher::new();
        d.schedule_once(ms(300), Lane::Task, "c");
        d.schedule_once(ms(100), Lane::Task, "a");
        d.schedule_once(ms(200), Lane::Task, "b");
        assert_eq!(drain(&mut d, ms(1000)), vec!["a", "b", "c"]);
        assert_eq!(d.now(), ms(1000));
    }

    #[test]
    fn task_lane_wins_deadline_ties() {
        let mut d = Dispatcher::new();
        d.schedule_once(ms(100), Lane::Collaborator, "flash");
        d.schedule_once(ms(100), Lane::Task, "change");
        assert_eq!(drain(&mut d, ms(100)), vec!["change", "flash"]);
    }

    #[test]
    fn posted_events_run_first() {
        let mut d = Dispatcher::new();
        d.schedule_once(Duration::ZERO, Lane::Task, "timer");
        d.post("posted");
        assert_eq!(drain(&mut d, Duration::ZERO), vec!["posted", "timer"]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut d = Dispatcher::new();
        let id = d.schedule_once(ms(50), Lane::Task, "x");
        assert_eq!(d.pending_timers(), 1);
        assert!(d.cancel(id));
        assert!(!d.cancel(id));
        assert_eq!(d.pending_timers(), 0);
        assert!(drain(&mut d, ms(100)).is_empty());
        assert_eq!(d.next_deadline(), None);
    }

    #[test]
    fn periodic_timers_rearm_until_cancelled() {
        let mut d = Dispatcher::new();
        let id = d.schedule_every(ms(750), Lane::Collaborator, "flash");
        assert_eq!(drain(&mut d, ms(2300)), vec!["flash", "flash", "flash"]);
        assert_eq!(d.next_deadline(), Some(ms(3000)));
        d.cancel(id);
        assert!(drain(&mut d, ms(5000)).is_empty());
    }

    #[test]
    fn events_beyond_horizon_stay_queued() {
        let mut d = Dispatcher::new();
        d.schedule_once(ms(500), Lane::Task, "late");
        assert!(drain(&mut d, ms(499)).is_empty());
        assert_eq!(d.now(), ms(499));
        d.schedule_once(ms(1), Lane::Task, "same");
        assert_eq!(drain(&mut d, ms(500)), vec!["late", "same"]);
    }
}

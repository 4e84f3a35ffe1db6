//! Cooperative single-threaded scheduler.
//!
//! Owns a virtual clock, a queue of tick-deferred tasks and an ordered timer
//! wheel. Tests drive it explicitly with [`Scheduler::advance`]; applications
//! drive it against wall-clock time with [`Scheduler::run_for`].

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::select;
use tracing::trace;

use crate::stream::Subscription;

/// Cross-thread notification inbox.
pub mod remote;

pub use remote::RemoteSender;

use remote::Inbox;

type Task = Box<dyn FnOnce()>;

/// Scheduler settings.
///
/// Only the cross-thread inbox is configurable; the clock and queues are
/// unbounded.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Max queued cross-thread notifications before `send` reports `Full`.
    pub inbox_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
        }
    }
}

struct Inner {
    now: Cell<Duration>,
    ticks: RefCell<VecDeque<Task>>,
    timers: RefCell<BTreeMap<(Duration, u64), Task>>,
    sequence: Cell<u64>,
    inbox: Inbox,
}

/// Handle to a scheduler. Clones share the same clock and queues.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now())
            .field("ticks", &self.inner.ticks.borrow().len())
            .field("timers", &self.pending_timers())
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler with default settings and the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            inner: Rc::new(Inner {
                now: Cell::new(Duration::ZERO),
                ticks: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BTreeMap::new()),
                sequence: Cell::new(0),
                inbox: Inbox::new(config.inbox_capacity),
            }),
        }
    }

    /// Time elapsed on the virtual clock.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.inner.now.get()
    }

    /// Number of timers waiting to fire.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// When the earliest pending timer is due.
    #[must_use]
    pub fn next_due(&self) -> Option<Duration> {
        self.inner.timers.borrow().first_key_value().map(|(&(due, _), _)| due)
    }

    /// Defers `task` to the next tick drain, at the current instant.
    pub fn schedule(&self, task: impl FnOnce() + 'static) -> Subscription {
        let handle = Subscription::new();
        let guard = handle.clone();
        self.inner.ticks.borrow_mut().push_back(Box::new(move || {
            if !guard.is_closed() {
                task();
            }
        }));
        handle
    }

    /// Runs `task` once `delay` has elapsed. Unsubscribing the returned
    /// handle removes the timer.
    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce() + 'static) -> Subscription {
        let sequence = self.inner.sequence.get();
        self.inner.sequence.set(sequence + 1);
        let key = (self.now() + delay, sequence);
        self.inner.timers.borrow_mut().insert(key, Box::new(task));

        let handle = Subscription::new();
        let inner: Weak<Inner> = Rc::downgrade(&self.inner);
        handle.add(move || {
            if let Some(inner) = inner.upgrade() {
                inner.timers.borrow_mut().remove(&key);
            }
        });
        handle
    }

    /// Moves the clock forward by `by`, running everything that becomes due.
    ///
    /// A timer armed during this call for the instant the clock is already at
    /// waits for the next call, so a task re-arming itself with a zero delay
    /// cannot stall the clock.
    pub fn advance(&self, by: Duration) {
        let target = self.now() + by;
        let armed_before = self.inner.sequence.get();
        self.pump_inbox();
        self.drain_ticks();

        while let Some(((due, sequence), task)) = self.pop_due(target, armed_before) {
            if due > self.now() {
                self.inner.now.set(due);
            }
            trace!(due_ms = due.as_millis(), sequence, "timer fired");
            task();
            self.drain_ticks();
        }

        self.inner.now.set(target);
    }

    /// Runs everything due at the current instant.
    pub fn flush(&self) {
        self.advance(Duration::ZERO);
    }

    /// Drives the scheduler against the wall clock for `duration`.
    ///
    /// Between timers the thread sleeps on the cross-thread inbox, so remote
    /// notifications are handled as soon as they arrive.
    pub fn run_for(&self, duration: Duration) {
        let started = Instant::now();
        let base = self.now();

        loop {
            let elapsed = started.elapsed().min(duration);
            self.advance((base + elapsed).saturating_sub(self.now()));
            if elapsed >= duration {
                break;
            }

            let remaining = duration - elapsed;
            let wait = self
                .next_due()
                .map_or(remaining, |due| due.saturating_sub(self.now()).min(remaining));

            let receiver = self.inner.inbox.receiver().clone();
            select! {
                recv(receiver) -> msg => {
                    if let Ok(envelope) = msg {
                        self.inner.inbox.dispatch(envelope);
                    }
                }
                default(wait) => {}
            }
        }
    }

    fn pop_due(&self, target: Duration, armed_before: u64) -> Option<((Duration, u64), Task)> {
        let now = self.now();
        let mut timers = self.inner.timers.borrow_mut();
        let key = timers
            .keys()
            .take_while(|&&(due, _)| due <= target)
            .find(|&&(due, sequence)| sequence < armed_before || due > now)
            .copied()?;
        timers.remove_entry(&key)
    }

    fn drain_ticks(&self) {
        loop {
            let task = self.inner.ticks.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    fn pump_inbox(&self) {
        self.inner.inbox.drain();
    }
}

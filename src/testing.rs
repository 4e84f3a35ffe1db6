//! Test doubles for streams.
//!
//! [`Recorder`] subscribes to a stream and keeps everything it receives.
//! [`Scripted`] is a cold producer that replays a timed script on a
//! [`Scheduler`] and counts how often it was subscribed.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::error::StreamError;
use crate::scheduler::Scheduler;
use crate::stream::{Callbacks, Stream, Subscriber, Subscription};

struct Log<T> {
    values: Vec<T>,
    completed: bool,
    error: Option<StreamError>,
}

/// Observer that records notifications.
pub struct Recorder<T> {
    log: Rc<RefCell<Log<T>>>,
    subscription: Subscription,
}

impl<T> fmt::Debug for Recorder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log = self.log.borrow();
        f.debug_struct("Recorder")
            .field("values", &log.values.len())
            .field("completed", &log.completed)
            .field("error", &log.error)
            .finish()
    }
}

impl<T: Clone + 'static> Recorder<T> {
    /// Subscribes to `stream` and starts recording.
    #[must_use]
    pub fn subscribe(stream: &Stream<T>) -> Self {
        let log = Rc::new(RefCell::new(Log {
            values: Vec::new(),
            completed: false,
            error: None,
        }));

        let (values, errors, completion) = (Rc::clone(&log), Rc::clone(&log), Rc::clone(&log));
        let subscription = stream.subscribe(
            Callbacks::new(move |value| values.borrow_mut().values.push(value))
                .on_error(move |err| errors.borrow_mut().error = Some(err))
                .on_complete(move || completion.borrow_mut().completed = true),
        );

        Self { log, subscription }
    }

    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.log.borrow().values.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.borrow().values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.log.borrow().completed
    }

    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.log.borrow().error.clone()
    }

    /// Whether the subscription ended, by unsubscribe or a terminal.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }

    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }
}

/// One step of a [`Scripted`] producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Emit a value.
    Value(T),
    /// Complete the run.
    Complete,
    /// Fail the run.
    Error(StreamError),
    /// Wait before the following steps, relative to the previous wait.
    Wait(Duration),
}

/// Cold producer that plays a script on every subscription.
///
/// Steps before the first [`Step::Wait`] are emitted synchronously on
/// subscription. Unsubscribing cancels the remaining steps.
pub struct Scripted<T> {
    scheduler: Scheduler,
    steps: Rc<[Step<T>]>,
    subscriptions: Rc<Cell<usize>>,
    active: Rc<Cell<usize>>,
}

impl<T> fmt::Debug for Scripted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scripted")
            .field("steps", &self.steps.len())
            .field("subscriptions", &self.subscriptions.get())
            .field("active", &self.active.get())
            .finish()
    }
}

impl<T: Clone + 'static> Scripted<T> {
    #[must_use]
    pub fn new(scheduler: &Scheduler, steps: Vec<Step<T>>) -> Self {
        Self {
            scheduler: scheduler.clone(),
            steps: steps.into(),
            subscriptions: Rc::new(Cell::new(0)),
            active: Rc::new(Cell::new(0)),
        }
    }

    /// The producer. Every subscription plays the script from the start.
    #[must_use]
    pub fn stream(&self) -> Stream<T> {
        let scheduler = self.scheduler.clone();
        let batches = Rc::new(batches(&self.steps));
        let (subscriptions, active) = (Rc::clone(&self.subscriptions), Rc::clone(&self.active));

        Stream::new(move |subscriber: Subscriber<T>| {
            subscriptions.set(subscriptions.get() + 1);
            active.set(active.get() + 1);
            let live = Rc::clone(&active);
            subscriber.add(move || live.set(live.get() - 1));

            for (offset, batch) in batches.iter() {
                if subscriber.is_closed() {
                    return;
                }
                if offset.is_zero() {
                    play(&subscriber, batch);
                    continue;
                }

                let (target, batch) = (subscriber.clone(), batch.clone());
                let handle = scheduler.schedule_after(*offset, move || play(&target, &batch));
                subscriber.add(move || handle.unsubscribe());
            }
        })
    }

    /// Total subscriptions made so far.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.get()
    }

    /// Subscriptions currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.get()
    }
}

fn batches<T: Clone>(steps: &[Step<T>]) -> Vec<(Duration, Vec<Step<T>>)> {
    let mut out = Vec::new();
    let mut offset = Duration::ZERO;
    let mut batch = Vec::new();

    for step in steps {
        if let Step::Wait(wait) = step {
            if !batch.is_empty() {
                out.push((offset, std::mem::take(&mut batch)));
            }
            offset += *wait;
        } else {
            batch.push(step.clone());
        }
    }
    if !batch.is_empty() {
        out.push((offset, batch));
    }
    out
}

fn play<T: Clone>(subscriber: &Subscriber<T>, batch: &[Step<T>]) {
    for step in batch {
        match step {
            Step::Value(value) => subscriber.next(value.clone()),
            Step::Complete => subscriber.complete(),
            Step::Error(err) => subscriber.error(err.clone()),
            Step::Wait(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_script_plays_on_schedule() {
        let scheduler = Scheduler::new();
        let source = Scripted::new(
            &scheduler,
            vec![Step::Value(1), Step::Wait(ms(100)), Step::Value(2), Step::Complete],
        );

        let spy = Recorder::subscribe(&source.stream());
        assert_eq!(spy.values(), vec![1]);
        assert_eq!(source.active(), 1);

        scheduler.advance(ms(100));
        assert_eq!(spy.values(), vec![1, 2]);
        assert!(spy.completed());
        assert_eq!(source.active(), 0);
        assert_eq!(source.subscriptions(), 1);
    }

    #[test]
    fn test_waits_accumulate() {
        let scheduler = Scheduler::new();
        let source = Scripted::new(
            &scheduler,
            vec![Step::Wait(ms(100)), Step::Value(1), Step::Wait(ms(100)), Step::Value(2)],
        );

        let spy = Recorder::subscribe(&source.stream());
        scheduler.advance(ms(150));
        assert_eq!(spy.values(), vec![1]);
        scheduler.advance(ms(50));
        assert_eq!(spy.values(), vec![1, 2]);
    }

    #[test]
    fn test_unsubscribe_cancels_remaining_steps() {
        let scheduler = Scheduler::new();
        let source = Scripted::new(&scheduler, vec![Step::Wait(ms(100)), Step::Value(1)]);

        let spy = Recorder::subscribe(&source.stream());
        spy.unsubscribe();
        assert!(spy.is_closed());
        assert_eq!(source.active(), 0);
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn test_recorder_captures_error() {
        let scheduler = Scheduler::new();
        let source = Scripted::<u8>::new(&scheduler, vec![Step::Error(StreamError::producer("x"))]);
        let spy = Recorder::subscribe(&source.stream());

        assert!(spy.is_empty());
        assert_eq!(spy.error(), Some(StreamError::producer("x")));
        assert!(spy.is_closed());
    }
}

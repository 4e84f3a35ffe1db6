//! Single-stream operators.
//!
//! Each operator returns a new cold stream; subscribing to it subscribes
//! upstream, and unsubscribing cancels upstream.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use crate::scheduler::Scheduler;

use super::{relay, Callbacks, Stream, Subscriber, Subscription, Termination};

impl<T: 'static> Stream<T> {
    /// Transforms every value with `f`.
    pub fn map<U: 'static>(&self, f: impl Fn(T) -> U + 'static) -> Stream<U> {
        let source = self.clone();
        let f = Rc::new(f);
        Stream::new(move |downstream: Subscriber<U>| {
            let f = Rc::clone(&f);
            source.subscribe_with(relay(&downstream, move |target, value| target.next(f(value))));
        })
    }

    /// Forwards the first `count` values, then completes.
    #[must_use]
    pub fn take(&self, count: usize) -> Stream<T> {
        let source = self.clone();
        Stream::new(move |downstream: Subscriber<T>| {
            if count == 0 {
                downstream.complete();
                return;
            }
            let taken = Cell::new(0usize);
            source.subscribe_with(relay(&downstream, move |target, value| {
                let seen = taken.get() + 1;
                if seen > count {
                    return;
                }
                taken.set(seen);
                target.next(value);
                if seen == count {
                    target.complete();
                }
            }));
        })
    }

    /// Emits the final value once the source completes.
    ///
    /// Completes without a value when the source completed empty. Errors pass
    /// through.
    #[must_use]
    pub fn last(&self) -> Stream<T> {
        let source = self.clone();
        Stream::new(move |downstream: Subscriber<T>| {
            let latest = Rc::new(RefCell::new(None));
            let store = Rc::clone(&latest);
            let (errors, completion) = (downstream.clone(), downstream.clone());
            let upstream = Subscriber::new(
                Callbacks::new(move |value| {
                    *store.borrow_mut() = Some(value);
                })
                .on_error(move |err| errors.error(err))
                .on_complete(move || {
                    let value = latest.borrow_mut().take();
                    if let Some(value) = value {
                        completion.next(value);
                    }
                    completion.complete();
                }),
            );
            downstream.add_child(upstream.subscription().clone());
            source.subscribe_with(upstream);
        })
    }

    /// Shifts every value by `by` on `scheduler`.
    ///
    /// Completion is delivered after the last pending value; errors are
    /// delivered immediately.
    #[must_use]
    pub fn delay(&self, scheduler: &Scheduler, by: Duration) -> Stream<T> {
        let source = self.clone();
        let scheduler = scheduler.clone();
        Stream::new(move |downstream: Subscriber<T>| {
            let state = Rc::new(DelayState {
                pending: Cell::new(0),
                completed: Cell::new(false),
            });
            let (on_value, on_done) = (Rc::clone(&state), Rc::clone(&state));
            let (values, errors, completion) = (downstream.clone(), downstream.clone(), downstream.clone());
            let timers = scheduler.clone();

            let upstream = Subscriber::new(
                Callbacks::new(move |value: T| {
                    on_value.pending.set(on_value.pending.get() + 1);
                    let target = values.clone();
                    let state = Rc::clone(&on_value);
                    let handle = timers.schedule_after(by, move || {
                        target.next(value);
                        state.pending.set(state.pending.get() - 1);
                        if state.pending.get() == 0 && state.completed.get() {
                            target.complete();
                        }
                    });
                    values.add(move || handle.unsubscribe());
                })
                .on_error(move |err| errors.error(err))
                .on_complete(move || {
                    if on_done.pending.get() == 0 {
                        completion.complete();
                    } else {
                        on_done.completed.set(true);
                    }
                }),
            );
            downstream.add_child(upstream.subscription().clone());
            source.subscribe_with(upstream);
        })
    }

    /// Defers every notification by one scheduler tick.
    ///
    /// Used ahead of a multicast so that a producer emitting synchronously on
    /// subscription cannot finish its run before every pending subscriber has
    /// attached.
    #[must_use]
    pub fn observe_on(&self, scheduler: &Scheduler) -> Stream<T> {
        let source = self.clone();
        let scheduler = scheduler.clone();
        Stream::new(move |downstream: Subscriber<T>| {
            let (values, errors, completion) = (downstream.clone(), downstream.clone(), downstream.clone());
            let (on_value, on_error, on_complete) = (scheduler.clone(), scheduler.clone(), scheduler.clone());

            let upstream = Subscriber::new(
                Callbacks::new(move |value: T| {
                    let target = values.clone();
                    on_value.schedule(move || target.next(value));
                })
                .on_error(move |err| {
                    let target = errors.clone();
                    on_error.schedule(move || target.error(err));
                })
                .on_complete(move || {
                    let target = completion.clone();
                    on_complete.schedule(move || target.complete());
                }),
            );
            downstream.add_child(upstream.subscription().clone());
            source.subscribe_with(upstream);
        })
    }

    /// Maps every value to an inner stream and mirrors only the latest one.
    ///
    /// Each outer value cancels the active inner subscription before the new
    /// one is opened. Completes once the outer stream has completed and no
    /// inner subscription is active. Errors from either side terminate.
    pub fn switch_map<U: 'static>(&self, project: impl Fn(T) -> Stream<U> + 'static) -> Stream<U> {
        let source = self.clone();
        let project = Rc::new(project);
        Stream::new(move |downstream: Subscriber<U>| {
            let state = Rc::new(SwitchState {
                inner: RefCell::new(None),
                outer_done: Cell::new(false),
            });

            let cancel = Rc::clone(&state);
            downstream.add(move || {
                let inner = cancel.inner.borrow_mut().take();
                if let Some(inner) = inner {
                    inner.unsubscribe();
                }
            });

            let project = Rc::clone(&project);
            let (on_value, on_done) = (Rc::clone(&state), Rc::clone(&state));
            let (values, errors, completion) = (downstream.clone(), downstream.clone(), downstream.clone());
            let outer = Subscriber::new(
                Callbacks::new(move |value: T| switch_to(&on_value, &values, project(value)))
                    .on_error(move |err| errors.error(err))
                    .on_complete(move || {
                        on_done.outer_done.set(true);
                        let idle = on_done.inner.borrow().is_none();
                        if idle {
                            completion.complete();
                        }
                    }),
            );
            downstream.add_child(outer.subscription().clone());
            source.subscribe_with(outer);
        })
    }

    /// Resubscribes to the source every time it completes.
    ///
    /// Synchronously completing sources are resubscribed in a loop rather than
    /// recursively.
    #[must_use]
    pub fn repeat(&self) -> Stream<T> {
        let source = self.clone();
        Stream::new(move |downstream: Subscriber<T>| {
            let state = Rc::new(RepeatState {
                current: RefCell::new(None),
                subscribing: Cell::new(false),
                again: Cell::new(false),
            });

            let cancel = Rc::clone(&state);
            downstream.add(move || {
                let current = cancel.current.borrow_mut().take();
                if let Some(current) = current {
                    current.unsubscribe();
                }
            });

            resubscribe(&source, &downstream, &state);
        })
    }

    /// Calls `hook` when the source completes or fails, before forwarding.
    pub fn on_termination(&self, hook: impl Fn(&Termination) + 'static) -> Stream<T> {
        let source = self.clone();
        let hook = Rc::new(hook);
        Stream::new(move |downstream: Subscriber<T>| {
            let (on_error, on_complete) = (Rc::clone(&hook), Rc::clone(&hook));
            let (values, errors, completion) = (downstream.clone(), downstream.clone(), downstream.clone());
            let upstream = Subscriber::new(
                Callbacks::new(move |value| values.next(value))
                    .on_error(move |err| {
                        on_error(&Termination::Failed(err.clone()));
                        errors.error(err);
                    })
                    .on_complete(move || {
                        on_complete(&Termination::Completed);
                        completion.complete();
                    }),
            );
            downstream.add_child(upstream.subscription().clone());
            source.subscribe_with(upstream);
        })
    }

    /// Calls `hook` once per subscription when it ends, whether by a terminal
    /// notification or by unsubscribe.
    pub fn finalize(&self, hook: impl Fn() + 'static) -> Stream<T> {
        let source = self.clone();
        let hook = Rc::new(hook);
        Stream::new(move |subscriber: Subscriber<T>| {
            let hook = Rc::clone(&hook);
            subscriber.add(move || hook());
            source.subscribe_with(subscriber);
        })
    }
}

impl<T: Clone + 'static> Stream<T> {
    /// Emits `value` synchronously on subscription, then mirrors the source.
    #[must_use]
    pub fn start_with(&self, value: T) -> Stream<T> {
        let source = self.clone();
        Stream::new(move |downstream: Subscriber<T>| {
            downstream.next(value.clone());
            if downstream.is_closed() {
                return;
            }
            source.subscribe_with(relay(&downstream, |target, value| target.next(value)));
        })
    }

    /// Emits `fallback` before completing if the source produced no value.
    #[must_use]
    pub fn default_if_empty(&self, fallback: T) -> Stream<T> {
        let source = self.clone();
        Stream::new(move |downstream: Subscriber<T>| {
            let seen = Rc::new(Cell::new(false));
            let on_value = Rc::clone(&seen);
            let fallback = fallback.clone();
            let (values, errors, completion) = (downstream.clone(), downstream.clone(), downstream.clone());
            let upstream = Subscriber::new(
                Callbacks::new(move |value| {
                    on_value.set(true);
                    values.next(value);
                })
                .on_error(move |err| errors.error(err))
                .on_complete(move || {
                    if !seen.get() {
                        completion.next(fallback.clone());
                    }
                    completion.complete();
                }),
            );
            downstream.add_child(upstream.subscription().clone());
            source.subscribe_with(upstream);
        })
    }
}

struct DelayState {
    pending: Cell<usize>,
    completed: Cell<bool>,
}

struct SwitchState {
    inner: RefCell<Option<Subscription>>,
    outer_done: Cell<bool>,
}

fn switch_to<U: 'static>(state: &Rc<SwitchState>, downstream: &Subscriber<U>, next: Stream<U>) {
    let previous = state.inner.borrow_mut().take();
    if let Some(previous) = previous {
        trace!(subscription = %previous.id(), "switching away from inner subscription");
        previous.unsubscribe();
    }
    if downstream.is_closed() {
        return;
    }

    let subscription = Subscription::new();
    let id = subscription.id();
    let done = Rc::clone(state);
    let (values, errors, completion) = (downstream.clone(), downstream.clone(), downstream.clone());
    let inner = Subscriber::with_subscription(
        Callbacks::new(move |value| values.next(value))
            .on_error(move |err| errors.error(err))
            .on_complete(move || {
                let finished = {
                    let mut inner = done.inner.borrow_mut();
                    if inner.as_ref().is_some_and(|current| current.id() == id) {
                        *inner = None;
                    }
                    inner.is_none() && done.outer_done.get()
                };
                if finished {
                    completion.complete();
                }
            }),
        subscription.clone(),
    );

    *state.inner.borrow_mut() = Some(subscription);
    next.subscribe_with(inner);
}

struct RepeatState {
    current: RefCell<Option<Subscription>>,
    subscribing: Cell<bool>,
    again: Cell<bool>,
}

fn resubscribe<T: 'static>(source: &Stream<T>, downstream: &Subscriber<T>, state: &Rc<RepeatState>) {
    if state.subscribing.get() {
        state.again.set(true);
        return;
    }

    state.subscribing.set(true);
    loop {
        state.again.set(false);
        if downstream.is_closed() {
            break;
        }

        let subscription = Subscription::new();
        let (values, errors) = (downstream.clone(), downstream.clone());
        let (source_again, downstream_again, state_again) = (source.clone(), downstream.clone(), Rc::clone(state));
        let upstream = Subscriber::with_subscription(
            Callbacks::new(move |value| values.next(value))
                .on_error(move |err| errors.error(err))
                .on_complete(move || resubscribe(&source_again, &downstream_again, &state_again)),
            subscription.clone(),
        );

        *state.current.borrow_mut() = Some(subscription);
        source.subscribe_with(upstream);

        if !state.again.get() {
            break;
        }
    }
    state.subscribing.set(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::stream::Subject;
    use crate::testing::{Recorder, Scripted, Step};

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_map_transforms_values() {
        let spy = Recorder::subscribe(&Stream::of([1, 2, 3]).map(|v| v * 10));
        assert_eq!(spy.values(), vec![10, 20, 30]);
        assert!(spy.completed());
    }

    #[test]
    fn test_take_completes_and_cancels_upstream() {
        let subject = Subject::new();
        let spy = Recorder::subscribe(&subject.stream().take(2));

        subject.next(1);
        subject.next(2);
        subject.next(3);

        assert_eq!(spy.values(), vec![1, 2]);
        assert!(spy.completed());
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn test_take_zero_completes_without_subscribing() {
        let subject: Subject<i32> = Subject::new();
        let spy = Recorder::subscribe(&subject.stream().take(0));
        assert!(spy.completed());
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn test_last_emits_final_value_on_completion() {
        let spy = Recorder::subscribe(&Stream::of([1, 2, 3]).last());
        assert_eq!(spy.values(), vec![3]);
        assert!(spy.completed());
    }

    #[test]
    fn test_last_of_empty_completes_without_value() {
        let spy = Recorder::subscribe(&Stream::<i32>::empty().last());
        assert!(spy.values().is_empty());
        assert!(spy.completed());
    }

    #[test]
    fn test_default_if_empty() {
        let empty = Recorder::subscribe(&Stream::<i32>::empty().default_if_empty(7));
        assert_eq!(empty.values(), vec![7]);

        let full = Recorder::subscribe(&Stream::of([1]).default_if_empty(7));
        assert_eq!(full.values(), vec![1]);
    }

    #[test]
    fn test_start_with_emits_before_source() {
        let spy = Recorder::subscribe(&Stream::of([2, 3]).start_with(1));
        assert_eq!(spy.values(), vec![1, 2, 3]);
    }

    #[test]
    fn test_delay_shifts_values_and_completion() {
        let scheduler = Scheduler::new();
        let spy = Recorder::subscribe(&Stream::of([1]).delay(&scheduler, ms(200)));

        scheduler.advance(ms(199));
        assert!(spy.values().is_empty());
        assert!(!spy.completed());

        scheduler.advance(ms(1));
        assert_eq!(spy.values(), vec![1]);
        assert!(spy.completed());
    }

    #[test]
    fn test_delay_of_empty_completes_immediately() {
        let scheduler = Scheduler::new();
        let spy = Recorder::subscribe(&Stream::<i32>::empty().delay(&scheduler, ms(200)));
        assert!(spy.completed());
    }

    #[test]
    fn test_delay_cancels_pending_timers_on_unsubscribe() {
        let scheduler = Scheduler::new();
        let spy = Recorder::subscribe(&Stream::of([1, 2]).delay(&scheduler, ms(200)));
        assert_eq!(scheduler.pending_timers(), 2);

        spy.unsubscribe();
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn test_observe_on_defers_by_one_tick() {
        let scheduler = Scheduler::new();
        let spy = Recorder::subscribe(&Stream::of([1, 2]).observe_on(&scheduler));

        assert!(spy.values().is_empty());
        scheduler.flush();
        assert_eq!(spy.values(), vec![1, 2]);
        assert!(spy.completed());
    }

    #[test]
    fn test_observe_on_drops_deferred_after_unsubscribe() {
        let scheduler = Scheduler::new();
        let spy = Recorder::subscribe(&Stream::of([1]).observe_on(&scheduler));
        spy.unsubscribe();
        scheduler.flush();
        assert!(spy.values().is_empty());
    }

    #[test]
    fn test_switch_map_cancels_previous_inner() {
        let scheduler = Scheduler::new();
        let source = Scripted::new(&scheduler, vec![Step::Wait(ms(100)), Step::Value(1)]);
        let outer = Subject::new();

        let inner = source.stream();
        let spy = Recorder::subscribe(&outer.stream().switch_map(move |()| inner.clone()));

        outer.next(());
        scheduler.advance(ms(50));
        outer.next(());
        assert_eq!(source.active(), 1);
        assert_eq!(source.subscriptions(), 2);

        scheduler.advance(ms(50));
        assert!(spy.values().is_empty());
        scheduler.advance(ms(50));
        assert_eq!(spy.values(), vec![1]);
    }

    #[test]
    fn test_switch_map_completes_after_outer_and_inner() {
        let outer = Subject::new();
        let inner: Subject<i32> = Subject::new();
        let inner_stream = inner.stream();
        let spy = Recorder::subscribe(&outer.stream().switch_map(move |()| inner_stream.clone()));

        outer.next(());
        outer.complete();
        assert!(!spy.completed());

        inner.next(5);
        inner.complete();
        assert_eq!(spy.values(), vec![5]);
        assert!(spy.completed());
    }

    #[test]
    fn test_switch_map_outer_error_propagates() {
        let outer: Subject<()> = Subject::new();
        let spy = Recorder::subscribe(&outer.stream().switch_map(|()| Stream::<i32>::never()));
        outer.next(());
        outer.error(StreamError::trigger("notifier"));
        assert_eq!(spy.error(), Some(StreamError::trigger("notifier")));
    }

    #[test]
    fn test_repeat_resubscribes_synchronous_source_without_recursion() {
        let spy = Recorder::subscribe(&Stream::of([1]).repeat().take(10_000));
        assert_eq!(spy.len(), 10_000);
        assert!(spy.completed());
    }

    #[test]
    fn test_repeat_resubscribes_after_async_completion() {
        let scheduler = Scheduler::new();
        let spy = Recorder::subscribe(&Stream::timer(&scheduler, ms(100)).repeat());

        scheduler.advance(ms(350));
        assert_eq!(spy.len(), 3);
        assert!(!spy.completed());
    }

    #[test]
    fn test_repeat_stops_on_error() {
        let spy = Recorder::subscribe(&Stream::<i32>::fail(StreamError::producer("x")).repeat());
        assert_eq!(spy.error(), Some(StreamError::producer("x")));
    }

    #[test]
    fn test_on_termination_sees_terminal_once() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let spy = Recorder::subscribe(&Stream::of([1]).on_termination(move |t| log.borrow_mut().push(t.clone())));

        assert!(spy.completed());
        assert_eq!(*seen.borrow(), vec![Termination::Completed]);
    }

    #[test]
    fn test_finalize_runs_on_terminal_and_on_unsubscribe() {
        let calls = Rc::new(Cell::new(0));

        let counter = Rc::clone(&calls);
        let done = Recorder::subscribe(&Stream::of([1]).finalize(move || counter.set(counter.get() + 1)));
        assert!(done.completed());
        assert_eq!(calls.get(), 1);

        let subject: Subject<i32> = Subject::new();
        let counter = Rc::clone(&calls);
        let live = Recorder::subscribe(&subject.stream().finalize(move || counter.set(counter.get() + 1)));
        assert_eq!(calls.get(), 1);
        live.unsubscribe();
        live.unsubscribe();
        assert_eq!(calls.get(), 2);
    }
}

//! Push-stream runtime.
//!
//! A `Stream` is a cold producer description: every subscription starts an
//! independent production run that delivers zero or more values and then at
//! most one terminal notification (completion or error). Everything runs on a
//! single thread; observers take `&self` so a handler may synchronously cause
//! further notifications without aliasing a mutable borrow.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::error::StreamError;
use crate::scheduler::Scheduler;

/// Stream operators.
pub mod operators;
/// Hot multicast source.
pub mod subject;
/// Cancellation handles.
pub mod subscription;

pub use subject::Subject;
pub use subscription::{Subscription, SubscriptionId};

/// Receives notifications from a stream.
pub trait Observer<T> {
    /// A value was produced.
    fn next(&self, value: T);
    /// The run failed. No further notifications follow.
    fn error(&self, error: StreamError);
    /// The run completed. No further notifications follow.
    fn complete(&self);
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The run completed normally.
    Completed,
    /// The run failed.
    Failed(StreamError),
}

impl Termination {
    /// Delivers this terminal notification to `subscriber`.
    pub fn deliver<T>(&self, subscriber: &Subscriber<T>) {
        match self {
            Self::Completed => subscriber.complete(),
            Self::Failed(err) => subscriber.error(err.clone()),
        }
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Closure-backed observer.
///
/// Errors and completion are ignored unless handlers are attached.
pub struct Callbacks<T> {
    on_next: Box<dyn Fn(T)>,
    on_error: Box<dyn Fn(StreamError)>,
    on_complete: Box<dyn Fn()>,
}

impl<T> Callbacks<T> {
    /// Creates an observer from a value handler.
    pub fn new(on_next: impl Fn(T) + 'static) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error: Box::new(|_| {}),
            on_complete: Box::new(|| {}),
        }
    }

    /// Attaches an error handler.
    #[must_use]
    pub fn on_error(mut self, on_error: impl Fn(StreamError) + 'static) -> Self {
        self.on_error = Box::new(on_error);
        self
    }

    /// Attaches a completion handler.
    #[must_use]
    pub fn on_complete(mut self, on_complete: impl Fn() + 'static) -> Self {
        self.on_complete = Box::new(on_complete);
        self
    }
}

impl<T> Observer<T> for Callbacks<T> {
    fn next(&self, value: T) {
        (self.on_next)(value);
    }

    fn error(&self, error: StreamError) {
        (self.on_error)(error);
    }

    fn complete(&self) {
        (self.on_complete)();
    }
}

/// An observer bound to its subscription.
///
/// Once the subscription is closed, by unsubscribe or by a terminal
/// notification, every further notification is dropped. A terminal
/// notification closes the subscription, running its teardowns, before the
/// observer sees it.
pub struct Subscriber<T> {
    observer: Rc<dyn Observer<T>>,
    subscription: Subscription,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            observer: Rc::clone(&self.observer),
            subscription: self.subscription.clone(),
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl<T> Subscriber<T> {
    /// Wraps `observer` with a fresh subscription.
    pub fn new(observer: impl Observer<T> + 'static) -> Self {
        Self::with_subscription(observer, Subscription::new())
    }

    /// Wraps `observer` with a subscription created beforehand, so callbacks
    /// can capture its id.
    pub fn with_subscription(observer: impl Observer<T> + 'static, subscription: Subscription) -> Self {
        Self {
            observer: Rc::new(observer),
            subscription,
        }
    }

    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }

    /// Registers a teardown on this subscriber's subscription.
    pub fn add(&self, teardown: impl FnOnce() + 'static) {
        self.subscription.add(teardown);
    }

    /// Unsubscribes `child` together with this subscriber.
    pub fn add_child(&self, child: Subscription) {
        self.subscription.add_child(child);
    }

    pub fn next(&self, value: T) {
        if !self.is_closed() {
            self.observer.next(value);
        }
    }

    pub fn error(&self, error: StreamError) {
        if self.is_closed() {
            return;
        }
        self.subscription.unsubscribe();
        self.observer.error(error);
    }

    pub fn complete(&self) {
        if self.is_closed() {
            return;
        }
        self.subscription.unsubscribe();
        self.observer.complete();
    }
}

impl<T> Observer<T> for Subscriber<T> {
    fn next(&self, value: T) {
        Subscriber::next(self, value);
    }

    fn error(&self, error: StreamError) {
        Subscriber::error(self, error);
    }

    fn complete(&self) {
        Subscriber::complete(self);
    }
}

/// Creates an upstream subscriber that forwards errors and completion to
/// `downstream` and is cancelled with it. Values go through `on_next`.
pub(crate) fn relay<T: 'static, U: 'static>(
    downstream: &Subscriber<U>,
    on_next: impl Fn(&Subscriber<U>, T) + 'static,
) -> Subscriber<T> {
    let (values, errors, completion) = (downstream.clone(), downstream.clone(), downstream.clone());
    let upstream = Subscriber::new(
        Callbacks::new(move |value| on_next(&values, value))
            .on_error(move |err| errors.error(err))
            .on_complete(move || completion.complete()),
    );
    downstream.add_child(upstream.subscription().clone());
    upstream
}

/// Transforms one stream into another.
pub trait Operator<T, U> {
    /// Applies the operator to `source`.
    fn apply(self, source: Stream<T>) -> Stream<U>;
}

impl<T, U, F> Operator<T, U> for F
where
    F: FnOnce(Stream<T>) -> Stream<U>,
{
    fn apply(self, source: Stream<T>) -> Stream<U> {
        self(source)
    }
}

/// A cold push stream.
///
/// Cloning is cheap and yields the same producer description.
pub struct Stream<T> {
    on_subscribe: Rc<dyn Fn(Subscriber<T>)>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            on_subscribe: Rc::clone(&self.on_subscribe),
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl<T: 'static> Stream<T> {
    /// Creates a stream from its subscribe function.
    ///
    /// The function is called once per subscription and should register any
    /// cancellation work on the subscriber.
    pub fn new(on_subscribe: impl Fn(Subscriber<T>) + 'static) -> Self {
        Self {
            on_subscribe: Rc::new(on_subscribe),
        }
    }

    /// A stream that completes immediately.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(|subscriber| subscriber.complete())
    }

    /// A stream that never notifies.
    #[must_use]
    pub fn never() -> Self {
        Self::new(|_| {})
    }

    /// A stream that fails immediately with `error`.
    #[must_use]
    pub fn fail(error: StreamError) -> Self {
        Self::new(move |subscriber| subscriber.error(error.clone()))
    }

    /// Calls `factory` on every subscription and subscribes to its result.
    pub fn defer(factory: impl Fn() -> Stream<T> + 'static) -> Self {
        Self::new(move |subscriber| factory().subscribe_with(subscriber))
    }

    /// Subscribes `observer` and returns the cancellation handle.
    pub fn subscribe(&self, observer: impl Observer<T> + 'static) -> Subscription {
        let subscriber = Subscriber::new(observer);
        let subscription = subscriber.subscription().clone();
        self.subscribe_with(subscriber);
        subscription
    }

    /// Subscribes a prepared subscriber.
    pub fn subscribe_with(&self, subscriber: Subscriber<T>) {
        if !subscriber.is_closed() {
            (self.on_subscribe)(subscriber);
        }
    }

    /// Applies an operator.
    pub fn pipe<U, O: Operator<T, U>>(self, operator: O) -> Stream<U> {
        operator.apply(self)
    }
}

impl<T: Clone + 'static> Stream<T> {
    /// Emits `values` synchronously on subscription, then completes.
    pub fn of(values: impl IntoIterator<Item = T>) -> Self {
        let values: Rc<[T]> = values.into_iter().collect();
        Self::new(move |subscriber| {
            for value in values.iter() {
                if subscriber.is_closed() {
                    return;
                }
                subscriber.next(value.clone());
            }
            subscriber.complete();
        })
    }
}

impl Stream<()> {
    /// Emits once after `delay` on `scheduler`, then completes.
    #[must_use]
    pub fn timer(scheduler: &Scheduler, delay: Duration) -> Self {
        let scheduler = scheduler.clone();
        Self::new(move |subscriber: Subscriber<()>| {
            let target = subscriber.clone();
            let handle = scheduler.schedule_after(delay, move || {
                target.next(());
                target.complete();
            });
            subscriber.add(move || handle.unsubscribe());
        })
    }
}

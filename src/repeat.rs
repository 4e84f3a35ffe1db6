//! Trigger-driven resubscription.
//!
//! [`repeat_on_trigger`] restarts its source on every emission of a fixed
//! trigger stream. [`repeat_on_notifier`] computes the trigger from the
//! source's own completion signal, which is how the cache schedules expiry.

use tracing::trace;

use crate::scheduler::Scheduler;
use crate::stream::{Operator, Stream};

/// Operator returned by [`repeat_on_trigger`].
#[derive(Debug, Clone)]
pub struct RepeatOnTrigger<R> {
    trigger: Stream<R>,
}

/// Subscribes to the source immediately and again after every emission of
/// `trigger`, cancelling the previous subscription first.
///
/// Source completion leaves the output idle until the next trigger. The
/// output completes only once `trigger` has completed and the active source
/// subscription has completed too. Errors from either side terminate it.
#[must_use]
pub fn repeat_on_trigger<R: 'static>(trigger: Stream<R>) -> RepeatOnTrigger<R> {
    RepeatOnTrigger { trigger }
}

impl<T: 'static, R: 'static> Operator<T, T> for RepeatOnTrigger<R> {
    fn apply(self, source: Stream<T>) -> Stream<T> {
        self.trigger
            .map(|_| trace!("repeat trigger fired"))
            .start_with(())
            .switch_map(move |()| source.clone())
    }
}

/// Options for [`repeat_on_notifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatOptions {
    /// Build a new notifier whenever the current one completes. When false
    /// the notifier is used once, and the output completes after both the
    /// notifier and the active source run have completed.
    pub repeat_on_notifier_complete: bool,
}

impl Default for RepeatOptions {
    fn default() -> Self {
        Self {
            repeat_on_notifier_complete: true,
        }
    }
}

/// Operator returned by [`repeat_on_notifier`].
pub struct RepeatOnNotifier<F> {
    scheduler: Scheduler,
    build: F,
    options: RepeatOptions,
}

impl<F> std::fmt::Debug for RepeatOnNotifier<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatOnNotifier")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Resubscribes the source whenever the notifier built by `build` emits.
///
/// The source is shared on `scheduler`, so every view of it observes one run
/// at a time and a synchronous source cannot finish before its subscribers
/// attach. `build` receives the completion signal of the source: a stream
/// that emits the last value of the current run when it completes, or
/// completes empty when the run emitted nothing. Each notifier emission
/// cancels the current run and starts a new one.
#[must_use]
pub fn repeat_on_notifier<T, R, F>(scheduler: &Scheduler, build: F) -> RepeatOnNotifier<F>
where
    F: Fn(Stream<T>) -> Stream<R> + 'static,
{
    RepeatOnNotifier {
        scheduler: scheduler.clone(),
        build,
        options: RepeatOptions::default(),
    }
}

impl<F> RepeatOnNotifier<F> {
    #[must_use]
    pub fn options(mut self, options: RepeatOptions) -> Self {
        self.options = options;
        self
    }
}

impl<T, R, F> Operator<T, T> for RepeatOnNotifier<F>
where
    T: Clone + 'static,
    R: 'static,
    F: Fn(Stream<T>) -> Stream<R> + 'static,
{
    fn apply(self, source: Stream<T>) -> Stream<T> {
        let Self {
            scheduler,
            build,
            options,
        } = self;

        let shared = source.share_on(&scheduler);
        let done = shared.observe().last();

        let mut notifier = Stream::defer(move || build(done.clone()).map(|_| trace!("repeat notifier fired")));
        if options.repeat_on_notifier_complete {
            notifier = notifier.repeat();
        }

        notifier.start_with(()).switch_map(move |()| shared.stream())
    }
}

//! Windowed cache operator.
//!
//! Wraps a producer so its values are shared with every subscriber and
//! replayed to late subscribers for as long as they are fresh. After a run
//! completes the cache waits out the expiration time, then runs the producer
//! again either immediately (automatic refresh) or when the next subscriber
//! arrives. A refresher stream forces a new run at any time.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::multicast::ReplayConfig;
use crate::repeat::{repeat_on_notifier, repeat_on_trigger};
use crate::scheduler::Scheduler;
use crate::stream::{Operator, Stream, Subject, Termination};

/// Lifecycle of a cache pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheState {
    /// No producer run or expiration wait is in progress: no subscriber has
    /// arrived yet, or every subscriber has left. Buffered values stay
    /// servable within their window.
    #[default]
    Idle,
    /// A producer run is in progress or its expiration wait is running.
    Active,
    /// The cache expired and waits for a subscriber or a refresher emission.
    ExpiredWaiting,
    /// The pipeline failed; every later subscriber receives the same error.
    Terminated(Termination),
}

#[derive(Default)]
struct StatusInner {
    state: RefCell<CacheState>,
    runs: Cell<u64>,
    refreshes: Cell<u64>,
}

/// Read-only view of a cache pipeline, shared with the operator.
#[derive(Clone, Default)]
pub struct CacheStatus {
    inner: Rc<StatusInner>,
}

impl fmt::Debug for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStatus")
            .field("state", &self.state())
            .field("runs", &self.runs())
            .field("refreshes", &self.refreshes())
            .finish()
    }
}

impl CacheStatus {
    #[must_use]
    pub fn state(&self) -> CacheState {
        self.inner.state.borrow().clone()
    }

    /// Number of producer subscriptions made.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.inner.runs.get()
    }

    /// Number of refresher emissions seen.
    #[must_use]
    pub fn refreshes(&self) -> u64 {
        self.inner.refreshes.get()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(*self.inner.state.borrow(), CacheState::Terminated(_))
    }

    fn transition(&self, next: CacheState) {
        let previous = {
            let mut state = self.inner.state.borrow_mut();
            if matches!(*state, CacheState::Terminated(_)) || *state == next {
                return;
            }
            std::mem::replace(&mut *state, next.clone())
        };
        debug!(from = ?previous, to = ?next, "cache state changed");
    }

    fn run_started(&self) {
        self.inner.runs.set(self.inner.runs.get() + 1);
        self.transition(CacheState::Active);
    }

    fn expired(&self, automatic: bool) {
        trace!(automatic, "cache expired");
        self.transition(CacheState::ExpiredWaiting);
    }

    fn refreshed(&self) {
        self.inner.refreshes.set(self.inner.refreshes.get() + 1);
        debug!(refreshes = self.refreshes(), "refresher fired");
    }

    fn disconnected(&self) {
        self.transition(CacheState::Idle);
    }

    fn terminated(&self, termination: &Termination) {
        if let Termination::Failed(err) = termination {
            warn!(error = %err, "cache pipeline failed");
        }
        self.transition(CacheState::Terminated(termination.clone()));
    }
}

/// Operator returned by [`cache()`].
pub struct Cache {
    scheduler: Scheduler,
    config: CacheConfig,
    refresher: Option<Stream<()>>,
    new_subscriber: Subject<()>,
    status: CacheStatus,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("refresher", &self.refresher.is_some())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Creates a cache operator timed by `scheduler`.
///
/// Applying it (with [`Stream::pipe`]) yields a stream that never completes
/// on its own: producer completion only starts the expiration wait. A
/// producer or refresher error terminates the cache for every current and
/// future subscriber.
#[must_use]
pub fn cache(scheduler: &Scheduler, config: CacheConfig) -> Cache {
    Cache {
        scheduler: scheduler.clone(),
        config,
        refresher: None,
        new_subscriber: Subject::new(),
        status: CacheStatus::default(),
    }
}

impl Cache {
    /// Forces a new producer run on every emission of `refresher`.
    #[must_use]
    pub fn refresher<R: 'static>(mut self, refresher: Stream<R>) -> Self {
        self.refresher = Some(refresher.map(|_| ()));
        self
    }

    /// A handle that tracks the pipeline once the operator is applied.
    #[must_use]
    pub fn status(&self) -> CacheStatus {
        self.status.clone()
    }

    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl<T: Clone + 'static> Operator<T, T> for Cache {
    fn apply(self, source: Stream<T>) -> Stream<T> {
        let Self {
            scheduler,
            config,
            refresher,
            new_subscriber,
            status,
        } = self;
        let expiration = config.expiration_time;
        let automatic = config.automatic_refresh;

        let run_status = status.clone();
        let producer = Stream::new(move |subscriber| {
            run_status.run_started();
            source.subscribe_with(subscriber);
        });

        let arrivals = new_subscriber.stream();
        let timers = scheduler.clone();
        let expiry_status = status.clone();
        let expiry = repeat_on_notifier(&scheduler, move |done: Stream<T>| {
            let status = expiry_status.clone();
            let arrivals = arrivals.clone();
            done.map(|_| ())
                .default_if_empty(())
                .delay(&timers, expiration)
                .map(move |()| status.expired(automatic))
                .switch_map(move |()| {
                    if automatic {
                        Stream::of([()])
                    } else {
                        arrivals.take(1)
                    }
                })
        });

        let refresh_status = status.clone();
        let refresher = refresher
            .unwrap_or_else(Stream::never)
            .map(move |()| refresh_status.refreshed());

        let terminal_status = status.clone();
        let replay = ReplayConfig {
            buffer_size: config.effective_buffer_size(),
            window: Some(config.window_time()),
        };
        let shared = producer
            .pipe(expiry)
            .pipe(repeat_on_trigger(refresher))
            .on_termination(move |termination| terminal_status.terminated(termination))
            .finalize(move || status.disconnected())
            .share_replay(&scheduler, replay)
            .stream();

        Stream::defer(move || {
            trace!("cache subscriber arrived");
            new_subscriber.next(());
            shared.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::StreamError;
    use crate::testing::{Recorder, Scripted, Step};

    const EXPIRATION: Duration = Duration::from_millis(200);

    fn once(scheduler: &Scheduler) -> Scripted<i32> {
        Scripted::new(scheduler, vec![Step::Value(1), Step::Complete])
    }

    #[test]
    fn test_status_tracks_lifecycle() {
        let scheduler = Scheduler::new();
        let source = once(&scheduler);
        let operator = cache(&scheduler, CacheConfig::new(EXPIRATION));
        let status = operator.status();
        assert_eq!(status.state(), CacheState::Idle);

        let cached = source.stream().pipe(operator);
        let _spy = Recorder::subscribe(&cached);
        scheduler.flush();
        assert_eq!(status.state(), CacheState::Active);
        assert_eq!(status.runs(), 1);

        scheduler.advance(EXPIRATION);
        assert_eq!(status.state(), CacheState::ExpiredWaiting);

        let _late = Recorder::subscribe(&cached);
        assert_eq!(status.state(), CacheState::Active);
        assert_eq!(status.runs(), 2);
    }

    #[test]
    fn test_status_returns_to_idle_when_last_subscriber_leaves() {
        let scheduler = Scheduler::new();
        let source = once(&scheduler);
        let operator = cache(&scheduler, CacheConfig::new(EXPIRATION));
        let status = operator.status();
        let cached = source.stream().pipe(operator);

        let first = Recorder::subscribe(&cached);
        scheduler.flush();
        assert_eq!(status.state(), CacheState::Active);

        first.unsubscribe();
        assert_eq!(status.state(), CacheState::Idle);
        assert_eq!(scheduler.pending_timers(), 0);

        let second = Recorder::subscribe(&cached);
        assert_eq!(second.values(), vec![1]);
        assert_eq!(status.state(), CacheState::Active);
    }

    #[test]
    fn test_error_terminates_status() {
        let scheduler = Scheduler::new();
        let source = Scripted::<i32>::new(&scheduler, vec![Step::Error(StreamError::producer("down"))]);
        let operator = cache(&scheduler, CacheConfig::new(EXPIRATION));
        let status = operator.status();

        let spy = Recorder::subscribe(&source.stream().pipe(operator));
        scheduler.flush();

        assert_eq!(spy.error(), Some(StreamError::producer("down")));
        assert!(status.is_terminated());
        assert_eq!(
            status.state(),
            CacheState::Terminated(Termination::Failed(StreamError::producer("down")))
        );
    }

    #[test]
    fn test_refreshes_are_counted() {
        let scheduler = Scheduler::new();
        let source = once(&scheduler);
        let refresher = Subject::new();
        let operator = cache(&scheduler, CacheConfig::new(EXPIRATION)).refresher(refresher.stream());
        let status = operator.status();

        let spy = Recorder::subscribe(&source.stream().pipe(operator));
        scheduler.flush();
        refresher.next("click");
        scheduler.flush();

        assert_eq!(status.refreshes(), 1);
        assert_eq!(status.runs(), 2);
        assert_eq!(spy.len(), 2);
    }

    #[test]
    fn test_config_accessor() {
        let scheduler = Scheduler::new();
        let operator = cache(&scheduler, CacheConfig::new(EXPIRATION).with_buffer_size(3));
        assert_eq!(operator.config().buffer_size, 3);
    }
}

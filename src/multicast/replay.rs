use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::scheduler::Scheduler;
use crate::stream::{Callbacks, Stream, Subscriber, Subscription, SubscriptionId, Termination};

/// Replay sizing and freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Most recent values kept. Zero is treated as one.
    pub buffer_size: usize,
    /// How long a value stays servable. `None` keeps values until evicted by
    /// size.
    pub window: Option<Duration>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1,
            window: None,
        }
    }
}

impl ReplayConfig {
    #[must_use]
    pub const fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            window: None,
        }
    }

    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// The buffer size actually used.
    #[must_use]
    pub const fn effective_buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            1
        } else {
            self.buffer_size
        }
    }
}

/// Bounded, time-windowed record of recent values.
///
/// Expired entries are dropped lazily, whenever the buffer is pushed to or
/// read.
#[derive(Debug, Clone)]
pub struct ReplayBuffer<T> {
    entries: VecDeque<(T, Duration)>,
    capacity: usize,
    window: Option<Duration>,
}

impl<T: Clone> ReplayBuffer<T> {
    #[must_use]
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: config.effective_buffer_size(),
            window: config.window,
        }
    }

    /// Records `value` emitted at `now`, evicting the oldest entries past
    /// capacity.
    pub fn push(&mut self, value: T, now: Duration) {
        self.entries.push_back((value, now));
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.trim(now);
    }

    /// Drops entries no longer servable at `now`.
    pub fn trim(&mut self, now: Duration) {
        let Some(window) = self.window else {
            return;
        };
        while let Some((_, stamp)) = self.entries.front() {
            if now.saturating_sub(*stamp) < window {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// The values servable at `now`, oldest first.
    pub fn servable(&mut self, now: Duration) -> Vec<T> {
        self.trim(now);
        self.entries.iter().map(|(value, _)| value.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct ReplayState<T> {
    buffer: ReplayBuffer<T>,
    observers: Vec<Subscriber<T>>,
    connection: Option<Subscription>,
    terminal: Option<Termination>,
    runs: u64,
    replayed: u64,
}

type SharedState<T> = Rc<RefCell<ReplayState<T>>>;

/// Refcounted multicast with a replay buffer.
///
/// A subscriber first receives the servable buffer, then either the recorded
/// terminal notification or live values. Once the source has failed, late
/// subscribers receive only the error. The first subscriber while
/// disconnected starts a run; the last one leaving cancels it but keeps the
/// buffer. Completion and errors are terminal: no run is started afterwards.
pub struct ReplayShared<T> {
    source: Stream<T>,
    scheduler: Scheduler,
    state: SharedState<T>,
}

impl<T> Clone for ReplayShared<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            scheduler: self.scheduler.clone(),
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for ReplayShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ReplayShared")
            .field("refcount", &state.observers.len())
            .field("connected", &state.connection.is_some())
            .field("buffered", &state.buffer.entries.len())
            .field("terminal", &state.terminal)
            .finish()
    }
}

impl<T: Clone + 'static> ReplayShared<T> {
    #[must_use]
    pub fn new(source: Stream<T>, scheduler: &Scheduler, config: ReplayConfig) -> Self {
        Self {
            source,
            scheduler: scheduler.clone(),
            state: Rc::new(RefCell::new(ReplayState {
                buffer: ReplayBuffer::new(config),
                observers: Vec::new(),
                connection: None,
                terminal: None,
                runs: 0,
                replayed: 0,
            })),
        }
    }

    /// The subscribable view.
    #[must_use]
    pub fn stream(&self) -> Stream<T> {
        let shared = self.clone();
        Stream::new(move |subscriber| shared.attach(subscriber))
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.state.borrow().observers.len()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.borrow().connection.is_some()
    }

    /// Number of source runs started.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.state.borrow().runs
    }

    /// Number of values served from the buffer instead of a run.
    #[must_use]
    pub fn replayed(&self) -> u64 {
        self.state.borrow().replayed
    }

    /// Values a subscriber arriving now would be replayed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        let now = self.scheduler.now();
        let mut state = self.state.borrow_mut();
        state.buffer.trim(now);
        state.buffer.len()
    }

    /// The terminal notification, once the source completed or failed.
    #[must_use]
    pub fn termination(&self) -> Option<Termination> {
        self.state.borrow().terminal.clone()
    }

    fn attach(&self, subscriber: Subscriber<T>) {
        let now = self.scheduler.now();
        let (snapshot, terminal) = {
            let mut state = self.state.borrow_mut();
            let terminal = state.terminal.clone();
            if terminal.as_ref().is_some_and(Termination::is_failed) {
                (Vec::new(), terminal)
            } else {
                let snapshot = state.buffer.servable(now);
                state.replayed += snapshot.len() as u64;
                (snapshot, terminal)
            }
        };

        if !snapshot.is_empty() {
            trace!(count = snapshot.len(), "replaying buffered values");
        }
        for value in snapshot {
            if subscriber.is_closed() {
                return;
            }
            subscriber.next(value);
        }

        if let Some(terminal) = terminal {
            terminal.deliver(&subscriber);
            return;
        }
        if subscriber.is_closed() {
            return;
        }

        let connect = {
            let mut state = self.state.borrow_mut();
            state.observers.push(subscriber.clone());
            state.connection.is_none()
        };

        let id = subscriber.subscription().id();
        let state = Rc::clone(&self.state);
        subscriber.add(move || detach(&state, id));

        if connect {
            self.connect();
        }
    }

    fn connect(&self) {
        let connection = Subscription::new();
        let runs = {
            let mut state = self.state.borrow_mut();
            state.connection = Some(connection.clone());
            state.runs += 1;
            state.runs
        };
        debug!(run = runs, "connecting replay source");

        let (on_value, on_error, on_complete) = (
            Rc::clone(&self.state),
            Rc::clone(&self.state),
            Rc::clone(&self.state),
        );
        let scheduler = self.scheduler.clone();
        let forwarder = Callbacks::new(move |value: T| record(&on_value, scheduler.now(), value))
            .on_error(move |err| terminate(&on_error, Termination::Failed(err)))
            .on_complete(move || terminate(&on_complete, Termination::Completed));

        self.source
            .subscribe_with(Subscriber::with_subscription(forwarder, connection));
    }
}

fn record<T: Clone + 'static>(state: &SharedState<T>, now: Duration, value: T) {
    let observers = {
        let mut state = state.borrow_mut();
        state.buffer.push(value.clone(), now);
        state.observers.clone()
    };
    for observer in observers {
        observer.next(value.clone());
    }
}

fn terminate<T: Clone + 'static>(state: &SharedState<T>, termination: Termination) {
    let observers = {
        let mut state = state.borrow_mut();
        state.connection = None;
        state.terminal = Some(termination.clone());
        std::mem::take(&mut state.observers)
    };

    debug!(failed = termination.is_failed(), subscribers = observers.len(), "replay source terminated");
    for observer in observers {
        termination.deliver(&observer);
    }
}

fn detach<T>(state: &SharedState<T>, id: SubscriptionId) {
    let connection = {
        let mut state = state.borrow_mut();
        let before = state.observers.len();
        state.observers.retain(|observer| observer.subscription().id() != id);
        if state.observers.len() == before || !state.observers.is_empty() {
            return;
        }
        state.connection.take()
    };

    if let Some(connection) = connection {
        debug!("last subscriber left, disconnecting replay source");
        connection.unsubscribe();
    }
}

impl<T: Clone + 'static> Stream<T> {
    /// Multicasts this stream through a [`ReplayShared`] timed by `scheduler`.
    #[must_use]
    pub fn share_replay(&self, scheduler: &Scheduler, config: ReplayConfig) -> ReplayShared<T> {
        ReplayShared::new(self.clone(), scheduler, config)
    }
}

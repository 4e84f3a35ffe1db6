use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::scheduler::Scheduler;
use crate::stream::{Callbacks, Stream, Subject, Subscriber, Subscription, Termination};

struct Run<T> {
    subject: Subject<T>,
    connection: Subscription,
    generation: u64,
}

struct ProxyState<T> {
    refcount: usize,
    run: Option<Run<T>>,
    passive: Subject<T>,
    generation: u64,
    runs: u64,
}

type SharedState<T> = Rc<RefCell<ProxyState<T>>>;

/// Refcounted fan-out over one producer run at a time.
///
/// The first subscriber of [`SharedStream::stream`] starts a run; later
/// subscribers join it and only see values emitted after they joined. When the
/// last subscriber leaves, the run is cancelled. A terminal notification
/// resets the proxy before it is forwarded, so the next subscriber always
/// starts a fresh run.
pub struct SharedStream<T> {
    source: Stream<T>,
    state: SharedState<T>,
}

impl<T> Clone for SharedStream<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for SharedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SharedStream")
            .field("refcount", &state.refcount)
            .field("running", &state.run.is_some())
            .field("runs", &state.runs)
            .finish()
    }
}

impl<T: Clone + 'static> SharedStream<T> {
    /// Wraps `source`. Nothing is subscribed until the first subscriber
    /// arrives.
    #[must_use]
    pub fn new(source: Stream<T>) -> Self {
        Self {
            source,
            state: Rc::new(RefCell::new(ProxyState {
                refcount: 0,
                run: None,
                passive: Subject::new(),
                generation: 0,
                runs: 0,
            })),
        }
    }

    /// The refcounted view.
    #[must_use]
    pub fn stream(&self) -> Stream<T> {
        let shared = self.clone();
        Stream::new(move |subscriber| shared.attach(subscriber))
    }

    /// A passive view of the same runs.
    ///
    /// Passive subscribers join the current run, or the next one when none is
    /// active, but neither count towards the refcount nor start a run. They
    /// stay attached across cancelled runs and receive the terminal
    /// notification of the first run that completes or fails.
    #[must_use]
    pub fn observe(&self) -> Stream<T> {
        let state = Rc::clone(&self.state);
        Stream::new(move |subscriber| {
            let passive = state.borrow().passive.clone();
            passive.subscribe_with(subscriber);
        })
    }

    /// Number of subscribers attached to the current run.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.state.borrow().refcount
    }

    /// Whether a producer run is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.borrow().run.is_some()
    }

    /// Number of producer runs started so far.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.state.borrow().runs
    }

    fn attach(&self, subscriber: Subscriber<T>) {
        let (subject, generation, start) = {
            let mut state = self.state.borrow_mut();
            state.refcount += 1;
            match &state.run {
                Some(run) => (run.subject.clone(), run.generation, false),
                None => {
                    state.generation += 1;
                    state.runs += 1;
                    let run = Run {
                        subject: Subject::new(),
                        connection: Subscription::new(),
                        generation: state.generation,
                    };
                    let joined = (run.subject.clone(), run.generation, true);
                    state.run = Some(run);
                    joined
                }
            }
        };

        let state = Rc::clone(&self.state);
        subscriber.add(move || release(&state, generation));
        subject.subscribe_with(subscriber);

        if start {
            self.connect(generation);
        }
    }

    fn connect(&self, generation: u64) {
        let connection = {
            let state = self.state.borrow();
            match &state.run {
                Some(run) if run.generation == generation => run.connection.clone(),
                _ => return,
            }
        };
        debug!(generation, "connecting shared run");

        // The connection keeps the state alive for as long as the producer
        // can still notify it.
        let (on_value, on_error, on_complete) = (
            Rc::clone(&self.state),
            Rc::clone(&self.state),
            Rc::clone(&self.state),
        );
        let forwarder = Callbacks::new(move |value: T| forward(&on_value, generation, value))
            .on_error(move |err| terminate(&on_error, generation, &Termination::Failed(err)))
            .on_complete(move || terminate(&on_complete, generation, &Termination::Completed));

        self.source
            .subscribe_with(Subscriber::with_subscription(forwarder, connection));
    }
}

fn current_run<T>(state: &ProxyState<T>, generation: u64) -> Option<&Run<T>> {
    state.run.as_ref().filter(|run| run.generation == generation)
}

fn forward<T: Clone + 'static>(state: &SharedState<T>, generation: u64, value: T) {
    let targets = {
        let state = state.borrow();
        current_run(&state, generation).map(|run| (run.subject.clone(), state.passive.clone()))
    };
    if let Some((subject, passive)) = targets {
        subject.next(value.clone());
        passive.next(value);
    }
}

fn terminate<T: Clone + 'static>(state: &SharedState<T>, generation: u64, termination: &Termination) {
    let targets = {
        let mut state = state.borrow_mut();
        if current_run(&state, generation).is_none() {
            return;
        }
        state.refcount = 0;
        let passive = std::mem::replace(&mut state.passive, Subject::new());
        state.run.take().map(|run| (run.subject, passive))
    };

    if let Some((subject, passive)) = targets {
        debug!(generation, failed = termination.is_failed(), "shared run terminated");
        finish(&subject, termination);
        finish(&passive, termination);
    }
}

fn release<T>(state: &SharedState<T>, generation: u64) {
    let connection = {
        let mut state = state.borrow_mut();
        if current_run(&state, generation).is_none() {
            return;
        }
        state.refcount -= 1;
        if state.refcount > 0 {
            return;
        }
        state.run.take().map(|run| run.connection)
    };

    if let Some(connection) = connection {
        debug!(generation, "refcount reached zero, cancelling shared run");
        connection.unsubscribe();
    }
}

pub(crate) fn finish<T: Clone + 'static>(subject: &Subject<T>, termination: &Termination) {
    match termination {
        Termination::Completed => subject.complete(),
        Termination::Failed(err) => subject.error(err.clone()),
    }
}

impl<T: Clone + 'static> Stream<T> {
    /// Multicasts this stream through a [`SharedStream`].
    #[must_use]
    pub fn share(&self) -> SharedStream<T> {
        SharedStream::new(self.clone())
    }

    /// Defers every notification by one tick on `scheduler`, then shares.
    ///
    /// A producer that emits synchronously on subscription would otherwise
    /// finish its run before a second subscriber at the same instant could
    /// join it.
    #[must_use]
    pub fn share_on(&self, scheduler: &Scheduler) -> SharedStream<T> {
        self.observe_on(scheduler).share()
    }
}

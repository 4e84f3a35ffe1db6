use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::StreamError;

use super::{Stream, Subscriber, Termination};

struct SubjectState<T> {
    observers: Vec<Subscriber<T>>,
    terminal: Option<Termination>,
}

/// Hot fan-out source.
///
/// Values go to the subscribers present at the time of the call. After a
/// terminal notification, later subscribers receive that notification
/// immediately. Clones share state.
pub struct Subject<T> {
    state: Rc<RefCell<SubjectState<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Subject")
            .field("observers", &state.observers.len())
            .field("terminal", &state.terminal)
            .finish()
    }
}

impl<T: Clone + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Subject<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SubjectState {
                observers: Vec::new(),
                terminal: None,
            })),
        }
    }

    pub fn next(&self, value: T) {
        let observers = {
            let state = self.state.borrow();
            if state.terminal.is_some() {
                return;
            }
            state.observers.clone()
        };
        for observer in observers {
            observer.next(value.clone());
        }
    }

    pub fn error(&self, error: StreamError) {
        self.terminate(Termination::Failed(error));
    }

    pub fn complete(&self) {
        self.terminate(Termination::Completed);
    }

    fn terminate(&self, termination: Termination) {
        let observers = {
            let mut state = self.state.borrow_mut();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(termination.clone());
            std::mem::take(&mut state.observers)
        };
        for observer in observers {
            termination.deliver(&observer);
        }
    }

    /// Registers `subscriber` for future notifications.
    pub fn subscribe_with(&self, subscriber: Subscriber<T>) {
        if subscriber.is_closed() {
            return;
        }

        let terminal = self.state.borrow().terminal.clone();
        if let Some(terminal) = terminal {
            terminal.deliver(&subscriber);
            return;
        }

        self.state.borrow_mut().observers.push(subscriber.clone());

        let id = subscriber.subscription().id();
        let state: Weak<RefCell<SubjectState<T>>> = Rc::downgrade(&self.state);
        subscriber.add(move || {
            if let Some(state) = state.upgrade() {
                state
                    .borrow_mut()
                    .observers
                    .retain(|observer| observer.subscription().id() != id);
            }
        });
    }

    /// A stream view of this subject.
    #[must_use]
    pub fn stream(&self) -> Stream<T> {
        let subject = self.clone();
        Stream::new(move |subscriber| subject.subscribe_with(subscriber))
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.state.borrow().observers.len()
    }

    /// The terminal notification, if one was delivered.
    #[must_use]
    pub fn termination(&self) -> Option<Termination> {
        self.state.borrow().terminal.clone()
    }
}

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use uuid::Uuid;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Teardown = Box<dyn FnOnce()>;

struct Inner {
    id: SubscriptionId,
    closed: Cell<bool>,
    teardowns: RefCell<Vec<Teardown>>,
}

/// Cancellation handle for a live observer registration.
///
/// Clones share state. `unsubscribe` is idempotent: teardowns run once, in the
/// order they were added, and a teardown added after close runs immediately.
#[derive(Clone)]
pub struct Subscription {
    inner: Rc<Inner>,
}

impl Subscription {
    /// Creates an open subscription with no teardowns.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                id: SubscriptionId::new(),
                closed: Cell::new(false),
                teardowns: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Creates a subscription that is already inactive.
    #[must_use]
    pub fn closed() -> Self {
        let sub = Self::new();
        sub.inner.closed.set(true);
        sub
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Registers a teardown to run on unsubscribe.
    pub fn add(&self, teardown: impl FnOnce() + 'static) {
        if self.is_closed() {
            teardown();
            return;
        }
        self.inner.teardowns.borrow_mut().push(Box::new(teardown));
    }

    /// Unsubscribes `child` when this subscription is unsubscribed.
    pub fn add_child(&self, child: Subscription) {
        self.add(move || child.unsubscribe());
    }

    /// Stops further notifications and runs the teardowns.
    pub fn unsubscribe(&self) {
        if self.inner.closed.replace(true) {
            return;
        }

        let teardowns = std::mem::take(&mut *self.inner.teardowns.borrow_mut());
        for teardown in teardowns {
            teardown();
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

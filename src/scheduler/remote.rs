use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::{RemoteError, StreamError};
use crate::stream::{Stream, Subject};

use super::Scheduler;

pub(crate) enum Signal {
    Next(Box<dyn Any + Send>),
    Error(StreamError),
    Complete,
}

impl Signal {
    const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }
}

pub(crate) struct Envelope {
    port: u64,
    signal: Signal,
}

type Handler = Rc<dyn Fn(Signal)>;

struct Port {
    handler: Handler,
    senders: Weak<()>,
}

/// Receiving half of the cross-thread channel, owned by the scheduler.
pub(crate) struct Inbox {
    sender: Sender<Envelope>,
    receiver: Receiver<Envelope>,
    capacity: usize,
    ports: RefCell<HashMap<u64, Port>>,
    next_port: Cell<u64>,
}

impl Inbox {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            ports: RefCell::new(HashMap::new()),
            next_port: Cell::new(0),
        }
    }

    pub(crate) fn receiver(&self) -> &Receiver<Envelope> {
        &self.receiver
    }

    fn register(&self, handler: Handler, senders: Weak<()>) -> u64 {
        let port = self.next_port.get();
        self.next_port.set(port + 1);
        self.ports.borrow_mut().insert(port, Port { handler, senders });
        port
    }

    /// Dispatches everything queued, then closes ports whose senders were all
    /// dropped before the drain started.
    pub(crate) fn drain(&self) {
        let abandoned: Vec<u64> = self
            .ports
            .borrow()
            .iter()
            .filter(|(_, port)| port.senders.strong_count() == 0)
            .map(|(&id, _)| id)
            .collect();

        while let Ok(envelope) = self.receiver.try_recv() {
            self.dispatch(envelope);
        }

        if abandoned.is_empty() {
            return;
        }
        let mut ports = self.ports.borrow_mut();
        for port in abandoned {
            if ports.remove(&port).is_some() {
                debug!(port, "closing remote port, every sender was dropped");
            }
        }
    }

    #[cfg(test)]
    fn open_ports(&self) -> usize {
        self.ports.borrow().len()
    }

    /// Routes `envelope` to its port. Terminal signals close the port.
    pub(crate) fn dispatch(&self, envelope: Envelope) {
        let Envelope { port, signal } = envelope;
        let handler = if signal.is_terminal() {
            self.ports.borrow_mut().remove(&port).map(|entry| entry.handler)
        } else {
            self.ports.borrow().get(&port).map(|entry| Rc::clone(&entry.handler))
        };

        match handler {
            Some(handler) => handler(signal),
            None => debug!(port, "dropping notification for closed remote port"),
        }
    }
}

/// Sends notifications into a scheduler from any thread.
///
/// Values are re-emitted on the scheduler's thread the next time it advances.
/// `send` never blocks. Once every clone is dropped the port is closed and the
/// local stream goes silent without completing.
pub struct RemoteSender<T> {
    port: u64,
    sender: Sender<Envelope>,
    token: Arc<()>,
    capacity: usize,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for RemoteSender<T> {
    fn clone(&self) -> Self {
        Self {
            port: self.port,
            sender: self.sender.clone(),
            token: Arc::clone(&self.token),
            capacity: self.capacity,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RemoteSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSender")
            .field("port", &self.port)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T: Send + 'static> RemoteSender<T> {
    /// Queues a value.
    pub fn send(&self, value: T) -> Result<(), RemoteError> {
        self.push(Signal::Next(Box::new(value)))
    }

    /// Fails the local stream.
    pub fn error(self, error: StreamError) -> Result<(), RemoteError> {
        self.push(Signal::Error(error))
    }

    /// Completes the local stream.
    pub fn complete(self) -> Result<(), RemoteError> {
        self.push(Signal::Complete)
    }

    fn push(&self, signal: Signal) -> Result<(), RemoteError> {
        self.sender
            .try_send(Envelope {
                port: self.port,
                signal,
            })
            .map_err(|err| match err {
                TrySendError::Full(_) => RemoteError::Full {
                    capacity: self.capacity,
                },
                TrySendError::Disconnected(_) => RemoteError::Disconnected,
            })
    }
}

impl Scheduler {
    /// Opens a channel whose sending half may move to another thread.
    ///
    /// The returned stream is hot: subscribers see values sent after they
    /// subscribed. Typical use is a cache refresher fed by an external event.
    #[must_use]
    pub fn remote_channel<T: Clone + Send + 'static>(&self) -> (RemoteSender<T>, Stream<T>) {
        let subject = Subject::new();
        let sink = subject.clone();
        let inbox = &self.inner.inbox;

        let token = Arc::new(());
        let handler: Handler = Rc::new(move |signal: Signal| match signal {
            Signal::Next(value) => match value.downcast::<T>() {
                Ok(value) => sink.next(*value),
                Err(_) => warn!("dropping remote value of unexpected type"),
            },
            Signal::Error(err) => {
                warn!(error = %err, "remote stream failed");
                sink.error(err);
            }
            Signal::Complete => sink.complete(),
        });
        let port = inbox.register(handler, Arc::downgrade(&token));
        debug!(port, "opened remote port");

        let sender = RemoteSender {
            port,
            sender: inbox.sender.clone(),
            token,
            capacity: inbox.capacity,
            _marker: PhantomData,
        };
        (sender, subject.stream())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::Recorder;

    #[test]
    fn test_values_arrive_on_advance() {
        let scheduler = Scheduler::new();
        let (tx, stream) = scheduler.remote_channel::<u32>();
        let spy = Recorder::subscribe(&stream);

        tx.send(7).unwrap();
        assert!(spy.values().is_empty());

        scheduler.flush();
        assert_eq!(spy.values(), vec![7]);
    }

    #[test]
    fn test_send_from_other_thread() {
        let scheduler = Scheduler::new();
        let (tx, stream) = scheduler.remote_channel::<String>();
        let spy = Recorder::subscribe(&stream);

        thread::spawn(move || {
            tx.send("refresh".to_string()).unwrap();
            tx.complete().unwrap();
        })
        .join()
        .unwrap();

        scheduler.flush();
        assert_eq!(spy.values(), vec!["refresh".to_string()]);
        assert!(spy.completed());
    }

    #[test]
    fn test_full_inbox_is_reported() {
        let scheduler = Scheduler::with_config(SchedulerConfig { inbox_capacity: 1 });
        let (tx, _stream) = scheduler.remote_channel::<u8>();

        tx.send(1).unwrap();
        assert_eq!(tx.send(2), Err(RemoteError::Full { capacity: 1 }));

        scheduler.flush();
        assert_eq!(tx.send(3), Ok(()));
    }

    #[test]
    fn test_dropped_scheduler_disconnects() {
        let scheduler = Scheduler::new();
        let (tx, _stream) = scheduler.remote_channel::<u8>();
        drop(scheduler);

        assert_eq!(tx.send(1), Err(RemoteError::Disconnected));
    }

    #[test]
    fn test_error_terminates_local_stream() {
        let scheduler = Scheduler::new();
        let (tx, stream) = scheduler.remote_channel::<u8>();
        let spy = Recorder::subscribe(&stream);
        let late_tx = tx.clone();

        tx.error(StreamError::trigger("hook gone")).unwrap();
        late_tx.send(1).unwrap();
        scheduler.flush();

        assert_eq!(spy.error(), Some(StreamError::trigger("hook gone")));
        assert!(spy.values().is_empty());
    }

    #[test]
    fn test_port_closes_after_last_sender_dropped() {
        let scheduler = Scheduler::new();
        let (tx, stream) = scheduler.remote_channel::<u8>();
        let spy = Recorder::subscribe(&stream);
        let clone = tx.clone();
        assert_eq!(scheduler.inner.inbox.open_ports(), 1);

        drop(tx);
        scheduler.flush();
        assert_eq!(scheduler.inner.inbox.open_ports(), 1);

        clone.send(5).unwrap();
        drop(clone);
        scheduler.flush();

        assert_eq!(spy.values(), vec![5]);
        assert!(!spy.completed());
        assert_eq!(scheduler.inner.inbox.open_ports(), 0);
    }
}

//! Ordered event delivery shared by both halves of a bridge.
//!
//! Events are queued by [`EventBus::post`] and delivered by a single dispatch
//! thread to every registered listener, in registration order. A failing or
//! panicking listener is logged and delivery continues.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::error::{Result, SessionError};
use crate::event::Event;

/// Receives events on the dispatch thread.
///
/// Listeners must not block for long: later listeners and later events wait
/// behind them.
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: &Event) -> Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event) -> Result<()> {
        self(event)
    }
}

/// Handle returned by [`EventBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    listener: Arc<dyn EventListener>,
    active: Arc<AtomicBool>,
}

type Listeners = Arc<Mutex<Vec<Registration>>>;

struct BusInner {
    sender: Mutex<Option<Sender<Event>>>,
    listeners: Listeners,
    next_id: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
    fn close(&self) {
        drop(lock(&self.sender).take());
        let Some(handle) = lock(&self.dispatcher).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("event dispatcher panicked");
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cloneable handle to a shared event queue.
///
/// The dispatch thread keeps running while any handle is alive or until
/// [`shutdown`](Self::shutdown). Listeners that capture a handle keep the bus
/// alive; such owners should call `shutdown` explicitly.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = {
            let listeners = Arc::clone(&listeners);
            thread::Builder::new()
                .name("fwbridge-event-bus".into())
                .spawn(move || dispatch_loop(rx, listeners))?
        };
        Ok(Self {
            inner: Arc::new(BusInner {
                sender: Mutex::new(Some(tx)),
                listeners,
                next_id: AtomicU64::new(1),
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }

    /// Queue an event for delivery.
    pub fn post(&self, event: Event) -> Result<()> {
        trace!(%event, "post");
        let sender = lock(&self.inner.sender);
        match sender.as_ref() {
            Some(tx) => tx.send(event).map_err(|_| SessionError::BusClosed),
            None => Err(SessionError::BusClosed),
        }
    }

    /// Add a listener. It sees every event posted after this call.
    pub fn register(&self, listener: impl EventListener) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.listeners).push(Registration {
            id,
            listener: Arc::new(listener),
            active: Arc::new(AtomicBool::new(true)),
        });
        debug!(listener = %id, "listener registered");
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    ///
    /// An event already being dispatched skips the listener if it has not
    /// reached it yet.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let Some(index) = listeners.iter().position(|r| r.id == id) else {
            return false;
        };
        let registration = listeners.remove(index);
        registration.active.store(false, Ordering::Release);
        debug!(listener = %id, "listener unregistered");
        true
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Stop accepting events, deliver what is queued, and join the dispatcher.
    pub fn shutdown(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn dispatch_loop(rx: Receiver<Event>, listeners: Listeners) {
    debug!("event dispatcher started");
    while let Ok(event) = rx.recv() {
        let snapshot: Vec<Registration> = lock(&listeners).clone();
        for registration in snapshot {
            if !registration.active.load(Ordering::Acquire) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                registration.listener.on_event(&event)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(listener = %registration.id, %event, %err, "event listener failed");
                }
                Err(_) => {
                    error!(listener = %registration.id, %event, "event listener panicked");
                }
            }
        }
    }
    debug!("event dispatcher stopped");
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A listener that queues matching events for a blocking consumer.
///
/// Unregisters itself when dropped.
pub struct EventWaiter {
    bus: EventBus,
    id: ListenerId,
    rx: Receiver<Event>,
}

impl EventWaiter {
    /// Queue every event.
    pub fn new(bus: &EventBus) -> Self {
        Self::filtered(bus, |_: &Event| true)
    }

    /// Queue events accepted by `filter`.
    pub fn filtered<F>(bus: &EventBus, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let id = bus.register(move |event: &Event| -> Result<()> {
            if filter(event) {
                // The waiter may already be gone.
                let _ = tx.send(event.clone());
            }
            Ok(())
        });
        Self {
            bus: bus.clone(),
            id,
            rx,
        }
    }

    /// Take the next queued event.
    ///
    /// `None` blocks until an event arrives, `Some(Duration::ZERO)` polls.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Event> {
        receive(&self.rx, timeout)
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        self.bus.unregister(self.id);
    }
}

impl fmt::Debug for EventWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventWaiter").field("id", &self.id).finish()
    }
}

pub(crate) fn receive<T>(rx: &Receiver<T>, timeout: Option<Duration>) -> Result<T> {
    match timeout {
        None => rx.recv().map_err(|_| SessionError::BusClosed),
        Some(Duration::ZERO) => rx.try_recv().map_err(|err| match err {
            TryRecvError::Empty => SessionError::WaitTimeout,
            TryRecvError::Disconnected => SessionError::BusClosed,
        }),
        Some(timeout) => rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => SessionError::WaitTimeout,
            RecvTimeoutError::Disconnected => SessionError::BusClosed,
        }),
    }
}

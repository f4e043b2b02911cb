//! In-process notification bus with ordered fan-out.
//!
//! Listeners come in two flavours that receive exactly the same events: objects
//! implementing [`Observer`] and plain callbacks registered through
//! [`EventBus::on_event`]. Every published event reaches every listener, in
//! registration order. Async consumers can additionally [`EventBus::subscribe`]
//! to a broadcast stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

const STREAM_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus dropped")]
    Closed,
    #[error("listener {0} is not registered")]
    NotRegistered(u64),
}

pub type BusResult<T> = Result<T, BusError>;

/// Anything that wants to hear about published events.
pub trait Observer<E>: Send + Sync {
    fn notify(&self, event: &E);
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Listener<E> {
    Observer(Arc<dyn Observer<E>>),
    Callback(Callback<E>),
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        match self {
            Listener::Observer(observer) => Listener::Observer(Arc::clone(observer)),
            Listener::Callback(callback) => Listener::Callback(Arc::clone(callback)),
        }
    }
}

impl<E> Listener<E> {
    fn deliver(&self, event: &E) {
        match self {
            Listener::Observer(observer) => observer.notify(event),
            Listener::Callback(callback) => callback(event),
        }
    }
}

struct BusInner<E> {
    listeners: RwLock<Vec<(u64, Listener<E>)>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<E>,
}

impl<E> BusInner<E> {
    fn insert(&self, listener: Listener<E>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.listeners.write().push((id, listener));
        id
    }

    fn remove(&self, id: u64) -> BusResult<()> {
        let mut guard = self.listeners.write();
        let before = guard.len();
        guard.retain(|(existing, _)| *existing != id);
        if guard.len() == before {
            return Err(BusError::NotRegistered(id));
        }
        Ok(())
    }
}

/// Cloneable handle to a shared listener list.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
                stream: broadcast::channel(STREAM_CAPACITY).0,
            }),
        }
    }

    /// Registers an observer for the lifetime of the bus.
    pub fn register_observer(&self, observer: Arc<dyn Observer<E>>) -> u64 {
        self.inner.insert(Listener::Observer(observer))
    }

    /// Registers a callback. Dropping the returned handle keeps the callback
    /// registered; call [`Subscription::dispose`] to remove it.
    pub fn on_event<F>(&self, callback: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.insert(Listener::Callback(Arc::new(callback)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.inner.stream.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Delivers `event` to every listener and returns how many were notified.
    ///
    /// The listener list is snapshotted first, so a listener may register
    /// further listeners without deadlocking; those only see later events.
    pub fn publish(&self, event: E) -> usize {
        let snapshot: Vec<Listener<E>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in &snapshot {
            listener.deliver(&event);
        }
        // No stream subscribers is not an error.
        let _ = self.inner.stream.send(event);
        snapshot.len()
    }
}

/// Disposable handle returned by [`EventBus::on_event`].
pub struct Subscription<E> {
    id: u64,
    bus: Weak<BusInner<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dispose(self) -> BusResult<()> {
        let bus = self.bus.upgrade().ok_or(BusError::Closed)?;
        bus.remove(self.id)
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Observer<u32> for Recorder {
        fn notify(&self, event: &u32) {
            self.log.lock().push(format!("{}:{event}", self.name));
        }
    }

    #[test]
    fn fan_out_follows_registration_order() {
        let bus = EventBus::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register_observer(Arc::new(Recorder {
            name: "first",
            log: log.clone(),
        }));
        let callback_log = log.clone();
        let _sub = bus.on_event(move |event| callback_log.lock().push(format!("second:{event}")));
        bus.register_observer(Arc::new(Recorder {
            name: "third",
            log: log.clone(),
        }));

        assert_eq!(bus.publish(7), 3);
        assert_eq!(*log.lock(), vec!["first:7", "second:7", "third:7"]);
    }

    #[test]
    fn disposed_callback_stops_receiving() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.on_event(move |event| sink.lock().push(*event));
        bus.publish(1);
        sub.dispose().expect("dispose");
        bus.publish(2);
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn dropped_handle_keeps_callback_registered() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        drop(bus.on_event(move |_| *sink.lock() += 1));
        bus.publish(1);
        bus.publish(2);
        assert_eq!(*seen.lock(), 2);
    }

    #[test]
    fn dispose_after_bus_dropped_reports_closed() {
        let bus = EventBus::<u32>::new();
        let sub = bus.on_event(|_| {});
        drop(bus);
        assert_eq!(sub.dispose(), Err(BusError::Closed));
    }

    #[tokio::test]
    async fn stream_subscribers_see_published_events() {
        let bus = EventBus::<u32>::new();
        let mut rx = bus.subscribe();
        bus.publish(42);
        assert_eq!(rx.recv().await.expect("receive ok"), 42);
    }
}

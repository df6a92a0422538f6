//! Host events with two delivery modes
//!
//! Most host events are fire-and-forget ([`EventEmitter::fire`]). A few, such as
//! configuration and document changes, must have been observed by every
//! listener before the triggering RPC returns; those use
//! [`EventEmitter::fire_and_wait`].

use crate::pending::PendingTasks;
use crate::sync::lock;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Listener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;
type ListenerList<T> = Mutex<Vec<(u64, Listener<T>)>>;

pub struct EventEmitter<T> {
    next_id: AtomicU64,
    listeners: Arc<ListenerList<T>>,
    tasks: Arc<PendingTasks>,
}

impl<T> EventEmitter<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(tasks: Arc<PendingTasks>) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Arc::new(Mutex::new(Vec::new())),
            tasks,
        }
    }

    /// Register a listener; it stays registered until the subscription is disposed
    pub fn on<F, Fut>(&self, listener: F) -> Subscription
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener<T> = Arc::new(move |value| listener(value).boxed());
        lock(&self.listeners).push((id, listener));

        let listeners: Weak<ListenerList<T>> = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                lock(&listeners).retain(|(existing, _)| *existing != id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn snapshot(&self) -> Vec<Listener<T>> {
        lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Deliver to every listener in the background
    pub fn fire(&self, value: T) {
        let listeners = self.snapshot();
        if listeners.is_empty() {
            return;
        }
        let deliveries: Vec<_> = listeners
            .iter()
            .map(|listener| listener(value.clone()))
            .collect();
        self.tasks.spawn(async move {
            join_all(deliveries).await;
        });
    }

    /// Deliver to every listener and wait until all of them are done
    pub async fn fire_and_wait(&self, value: T) {
        let deliveries: Vec<_> = self
            .snapshot()
            .iter()
            .map(|listener| listener(value.clone()))
            .collect();
        join_all(deliveries).await;
    }
}

/// Handle returned by registrations; disposing it undoes the registration
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn noop() -> Self {
        Self { dispose: None }
    }

    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

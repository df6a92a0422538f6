//! Background work tracking
//!
//! Event fan-out and other fire-and-forget work is spawned through
//! [`PendingTasks`]. With tracking enabled (deterministic testing) every
//! spawned future is kept in a bag until it completes, so callers can wait for
//! all outstanding side effects before asserting on them.

use crate::sync::lock;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type TaskMap = HashMap<u64, Shared<BoxFuture<'static, ()>>>;

pub struct PendingTasks {
    tracking: bool,
    next_id: AtomicU64,
    tasks: Arc<Mutex<TaskMap>>,
}

impl PendingTasks {
    pub fn new(tracking: bool) -> Arc<Self> {
        Arc::new(Self {
            tracking,
            next_id: AtomicU64::new(0),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Spawn a background future; tracked only when tracking is enabled
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.tracking {
            tokio::spawn(future);
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // The entry removes itself once the work is done; the bag never keeps
        // the map alive on its own.
        let bag = Arc::downgrade(&self.tasks);
        let shared = async move {
            future.await;
            if let Some(bag) = bag.upgrade() {
                lock(&bag).remove(&id);
            }
        }
        .boxed()
        .shared();

        lock(&self.tasks).insert(id, shared.clone());
        tokio::spawn(shared);
    }

    /// Number of tracked futures that have not completed yet
    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every tracked future, including ones spawned while waiting,
    /// has completed
    pub async fn settle(&self) {
        loop {
            let snapshot: Vec<_> = lock(&self.tasks).values().cloned().collect();
            if snapshot.is_empty() {
                return;
            }
            join_all(snapshot).await;
        }
    }
}

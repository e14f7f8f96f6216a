//! Commit notifications.
//!
//! Every committed write transaction produces a [`ChangeSet`] describing the
//! rows it touched. Change sets are queued to a single dispatch thread that
//! delivers them to registered observers in commit order. The same thread is
//! the serialized execution context observers fetch on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{debug, error, trace};

use crate::error::{Result, StoreError};

/// Tables that produce change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Channels,
    Messages,
    QueryLinks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChangeKind {
    Insert,
    Update,
    Delete,
}

/// One mutated row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowChange {
    pub table: Table,
    pub row_id: i64,
    pub kind: RowChangeKind,
}

/// All rows touched by one committed transaction, in mutation order.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<RowChange>,
}

impl ChangeSet {
    pub fn new(changes: Vec<RowChange>) -> Self {
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RowChange> {
        self.changes.iter()
    }

    pub fn touches(&self, tables: &[Table]) -> bool {
        self.changes.iter().any(|c| tables.contains(&c.table))
    }

    pub fn contains_row(&self, table: Table, row_id: i64) -> bool {
        self.changes
            .iter()
            .any(|c| c.table == table && c.row_id == row_id)
    }
}

type Callback = Box<dyn FnMut(&ChangeSet) + Send>;

struct Registration {
    tables: Vec<Table>,
    callback: Arc<Mutex<Callback>>,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    observers: Mutex<HashMap<u64, Registration>>,
}

enum Job {
    Commit(Arc<ChangeSet>),
    Run(Box<dyn FnOnce() + Send>),
}

/// Handle on the dispatch thread.
pub(crate) struct Notifier {
    jobs: Sender<Job>,
    registry: Arc<Registry>,
    thread_id: ThreadId,
}

impl Notifier {
    pub(crate) fn spawn() -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let registry = Arc::new(Registry::default());
        let thread_registry = Arc::clone(&registry);

        let handle = thread::Builder::new()
            .name("tether-store-observers".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Commit(changes) => deliver(&thread_registry, &changes),
                        Job::Run(f) => f(),
                    }
                }
                debug!("store dispatcher stopped");
            })?;

        Ok(Self {
            jobs: tx,
            registry,
            thread_id: handle.thread().id(),
        })
    }

    /// Queue a commit for delivery. Callers hold the writer lock, so queue
    /// order equals commit order.
    pub(crate) fn publish(&self, changes: ChangeSet) {
        trace!(rows = changes.changes.len(), "queueing commit notification");
        if self.jobs.send(Job::Commit(Arc::new(changes))).is_err() {
            error!("store dispatcher is gone, dropping commit notification");
        }
    }

    pub(crate) fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `f` on the dispatch thread and wait for its result. Runs inline
    /// when already on that thread.
    pub(crate) fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_dispatch_thread() {
            return Ok(f());
        }

        let (reply_tx, reply_rx) = bounded(1);
        let job = Job::Run(Box::new(move || {
            let _ = reply_tx.send(f());
        }));
        self.jobs
            .send(job)
            .map_err(|_| StoreError::DispatcherClosed)?;
        reply_rx.recv().map_err(|_| StoreError::DispatcherClosed)
    }

    /// Queue `f` without waiting.
    pub(crate) fn enqueue(&self, f: Box<dyn FnOnce() + Send>) -> Result<()> {
        self.jobs
            .send(Job::Run(f))
            .map_err(|_| StoreError::DispatcherClosed)
    }

    pub(crate) fn subscribe(&self, tables: Vec<Table>, callback: Callback) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Registration {
                    tables,
                    callback: Arc::new(Mutex::new(callback)),
                },
            );
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }
}

fn deliver(registry: &Registry, changes: &ChangeSet) {
    let targets: Vec<Arc<Mutex<Callback>>> = {
        let observers = registry
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<&u64> = observers
            .iter()
            .filter(|(_, reg)| changes.touches(&reg.tables))
            .map(|(id, _)| id)
            .collect();
        // Registration order.
        ids.sort();
        ids.into_iter()
            .filter_map(|id| observers.get(id).map(|reg| Arc::clone(&reg.callback)))
            .collect()
    };

    for callback in targets {
        let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
        (*callback)(changes);
    }
}

/// Keeps an observer registered. Dropping it unregisters.
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

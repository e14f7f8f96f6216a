//! Change-aggregating observers.
//!
//! An observer pairs a [`FetchRequest`] with the store's commit
//! notifications. Each commit touching the request's tables triggers a
//! re-fetch on the dispatch context; the result is diffed against the
//! previous externally visible snapshot and delivered as change records.
//! Items are handed out as `Arc`s so consumers can diff by reference.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::error;

use crate::change::{diff, EntityChange, ListChange};
use crate::database::Store;
use crate::error::Result;
use crate::notify::{ChangeSet, Subscription};
use crate::requests::FetchRequest;

/// Decides whether a previously built item can stand in for a freshly
/// fetched row: the row must not have been touched by the commit and both
/// sides must yield the same key. Without a commit to consult, the row is
/// rebuilt and the previous item is kept only if it compares equal.
pub struct ItemReuse<Item, Row> {
    same: Box<dyn Fn(&Item, &Row) -> bool + Send + Sync>,
}

impl<Item, Row> ItemReuse<Item, Row> {
    pub fn by_keys<K, IK, RK>(item_key: IK, row_key: RK) -> Self
    where
        K: PartialEq,
        IK: Fn(&Item) -> K + Send + Sync + 'static,
        RK: Fn(&Row) -> K + Send + Sync + 'static,
    {
        Self {
            same: Box::new(move |item, row| item_key(item) == row_key(row)),
        }
    }
}

type CreateItem<Row, Item> = Box<dyn Fn(Row) -> Item + Send + Sync>;

struct Core<Item, R: FetchRequest> {
    store: Store,
    request: R,
    create_item: CreateItem<R::Row, Item>,
    reuse: Option<ItemReuse<Item, R::Row>>,
}

impl<Item, R: FetchRequest> Core<Item, R> {
    fn fetch(&self) -> Result<Vec<(i64, R::Row)>> {
        self.store.read(|conn| self.request.fetch(conn))
    }
}

impl<Item: PartialEq, R: FetchRequest> Core<Item, R> {
    fn build(
        &self,
        rows: Vec<(i64, R::Row)>,
        previous: &[(i64, Arc<Item>)],
        changes: Option<&ChangeSet>,
    ) -> Vec<(i64, Arc<Item>)> {
        let previous: HashMap<i64, &Arc<Item>> =
            previous.iter().map(|(row_id, item)| (*row_id, item)).collect();
        let identity = self.request.identity_table();

        rows.into_iter()
            .map(|(row_id, row)| {
                let Some((reuse, prev)) = self.reuse.as_ref().zip(previous.get(&row_id)) else {
                    return (row_id, Arc::new((self.create_item)(row)));
                };
                match changes {
                    Some(changes) => {
                        if !changes.contains_row(identity, row_id) && (reuse.same)(prev, &row) {
                            return (row_id, Arc::clone(prev));
                        }
                        (row_id, Arc::new((self.create_item)(row)))
                    }
                    None => {
                        let same_key = (reuse.same)(prev, &row);
                        let item = (self.create_item)(row);
                        if same_key && ***prev == item {
                            (row_id, Arc::clone(prev))
                        } else {
                            (row_id, Arc::new(item))
                        }
                    }
                }
            })
            .collect()
    }
}

fn items_of<Item>(snapshot: &[(i64, Arc<Item>)]) -> Vec<Arc<Item>> {
    snapshot.iter().map(|(_, item)| Arc::clone(item)).collect()
}

// ---------------------------------------------------------------------------
// List observer
// ---------------------------------------------------------------------------

struct ListState<Item> {
    snapshot: Vec<(i64, Arc<Item>)>,
    observing: bool,
}

/// Observes an ordered collection of items.
pub struct ListDatabaseObserver<Item, R: FetchRequest> {
    core: Arc<Core<Item, R>>,
    state: Arc<Mutex<ListState<Item>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<Item, R> ListDatabaseObserver<Item, R>
where
    Item: PartialEq + Send + Sync + 'static,
    R: FetchRequest,
{
    pub fn new<F>(store: Store, request: R, create_item: F) -> Self
    where
        F: Fn(R::Row) -> Item + Send + Sync + 'static,
    {
        Self::build(store, request, Box::new(create_item), None)
    }

    pub fn with_item_reuse<F>(
        store: Store,
        request: R,
        create_item: F,
        reuse: ItemReuse<Item, R::Row>,
    ) -> Self
    where
        F: Fn(R::Row) -> Item + Send + Sync + 'static,
    {
        Self::build(store, request, Box::new(create_item), Some(reuse))
    }

    fn build(
        store: Store,
        request: R,
        create_item: CreateItem<R::Row, Item>,
        reuse: Option<ItemReuse<Item, R::Row>>,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                store,
                request,
                create_item,
                reuse,
            }),
            state: Arc::new(Mutex::new(ListState {
                snapshot: Vec::new(),
                observing: false,
            })),
            subscription: Mutex::new(None),
        }
    }

    /// Current items. Served from the observed snapshot while observing,
    /// otherwise fetched on the dispatch context.
    pub fn items(&self) -> Result<Vec<Arc<Item>>> {
        let core = Arc::clone(&self.core);
        let state = Arc::clone(&self.state);
        self.core.store.on_dispatcher(move || -> Result<Vec<Arc<Item>>> {
            let state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.observing {
                return Ok(items_of(&state.snapshot));
            }
            let rows = core.fetch()?;
            Ok(items_of(&core.build(rows, &state.snapshot, None)))
        })?
    }

    /// Start delivering change records to `on_change` on the dispatch
    /// context. Returns the initial items. Restarting replaces the previous
    /// callback.
    pub fn start_observing<F>(&self, mut on_change: F) -> Result<Vec<Arc<Item>>>
    where
        F: FnMut(Vec<ListChange<Arc<Item>>>) + Send + 'static,
    {
        self.stop_observing();

        let core = Arc::clone(&self.core);
        let state = Arc::clone(&self.state);
        let subscription = self.core.store.subscribe(self.core.request.tables(), move |changes| {
            if let Some(records) = refresh_list(&core, &state, changes) {
                on_change(records);
            }
        });

        let core = Arc::clone(&self.core);
        let state = Arc::clone(&self.state);
        let initial = self.core.store.on_dispatcher(move || -> Result<Vec<Arc<Item>>> {
            let rows = core.fetch()?;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let snapshot = core.build(rows, &state.snapshot, None);
            state.snapshot = snapshot;
            state.observing = true;
            Ok(items_of(&state.snapshot))
        })??;

        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
        Ok(initial)
    }

    /// [`start_observing`](Self::start_observing) with change records
    /// forwarded to a channel, for consumers living on another context.
    pub fn start_observing_forwarded(
        &self,
    ) -> Result<(
        Vec<Arc<Item>>,
        mpsc::UnboundedReceiver<Vec<ListChange<Arc<Item>>>>,
    )> {
        let (tx, rx) = mpsc::unbounded_channel();
        let items = self.start_observing(move |records| {
            let _ = tx.send(records);
        })?;
        Ok((items, rx))
    }

    pub fn stop_observing(&self) {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observing = false;
    }
}

fn refresh_list<Item, R>(
    core: &Core<Item, R>,
    state: &Mutex<ListState<Item>>,
    changes: &ChangeSet,
) -> Option<Vec<ListChange<Arc<Item>>>>
where
    Item: PartialEq,
    R: FetchRequest,
{
    let rows = match core.fetch() {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "list observer fetch failed");
            return None;
        }
    };

    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if !state.observing {
        return None;
    }
    let next = core.build(rows, &state.snapshot, Some(changes));
    let records = diff(&state.snapshot, &next);
    state.snapshot = next;
    (!records.is_empty()).then_some(records)
}

// ---------------------------------------------------------------------------
// Entity observer
// ---------------------------------------------------------------------------

struct EntityState<Item> {
    current: Option<(i64, Arc<Item>)>,
    observing: bool,
}

/// Observes a single item. The request should match at most one row.
pub struct EntityDatabaseObserver<Item, R: FetchRequest> {
    core: Arc<Core<Item, R>>,
    state: Arc<Mutex<EntityState<Item>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<Item, R> EntityDatabaseObserver<Item, R>
where
    Item: PartialEq + Send + Sync + 'static,
    R: FetchRequest,
{
    pub fn new<F>(store: Store, request: R, create_item: F) -> Self
    where
        F: Fn(R::Row) -> Item + Send + Sync + 'static,
    {
        Self {
            core: Arc::new(Core {
                store,
                request,
                create_item: Box::new(create_item),
                reuse: None,
            }),
            state: Arc::new(Mutex::new(EntityState {
                current: None,
                observing: false,
            })),
            subscription: Mutex::new(None),
        }
    }

    pub fn item(&self) -> Result<Option<Arc<Item>>> {
        let core = Arc::clone(&self.core);
        let state = Arc::clone(&self.state);
        self.core.store.on_dispatcher(move || -> Result<Option<Arc<Item>>> {
            let state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.observing {
                return Ok(state.current.as_ref().map(|(_, item)| Arc::clone(item)));
            }
            let row = fetch_single(&core)?;
            Ok(row.map(|(_, row)| Arc::new((core.create_item)(row))))
        })?
    }

    pub fn start_observing<F>(&self, mut on_change: F) -> Result<Option<Arc<Item>>>
    where
        F: FnMut(EntityChange<Arc<Item>>) + Send + 'static,
    {
        self.stop_observing();

        let core = Arc::clone(&self.core);
        let state = Arc::clone(&self.state);
        let subscription = self.core.store.subscribe(self.core.request.tables(), move |_| {
            if let Some(change) = refresh_entity(&core, &state) {
                on_change(change);
            }
        });

        let core = Arc::clone(&self.core);
        let state = Arc::clone(&self.state);
        let initial = self.core.store.on_dispatcher(move || -> Result<Option<Arc<Item>>> {
            let row = fetch_single(&core)?;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.current = row.map(|(row_id, row)| (row_id, Arc::new((core.create_item)(row))));
            state.observing = true;
            Ok(state.current.as_ref().map(|(_, item)| Arc::clone(item)))
        })??;

        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
        Ok(initial)
    }

    pub fn start_observing_forwarded(
        &self,
    ) -> Result<(
        Option<Arc<Item>>,
        mpsc::UnboundedReceiver<EntityChange<Arc<Item>>>,
    )> {
        let (tx, rx) = mpsc::unbounded_channel();
        let item = self.start_observing(move |change| {
            let _ = tx.send(change);
        })?;
        Ok((item, rx))
    }

    pub fn stop_observing(&self) {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observing = false;
    }
}

/// More than one matching row is a programming error: log it and use the
/// first row.
fn fetch_single<Item, R: FetchRequest>(core: &Core<Item, R>) -> Result<Option<(i64, R::Row)>> {
    let mut rows = core.fetch()?;
    if rows.len() > 1 {
        error!(
            count = rows.len(),
            "entity observer request matched more than one row, using the first"
        );
    }
    Ok(if rows.is_empty() {
        None
    } else {
        Some(rows.swap_remove(0))
    })
}

fn refresh_entity<Item, R>(
    core: &Core<Item, R>,
    state: &Mutex<EntityState<Item>>,
) -> Option<EntityChange<Arc<Item>>>
where
    Item: PartialEq,
    R: FetchRequest,
{
    let row = match fetch_single(core) {
        Ok(row) => row,
        Err(e) => {
            error!(error = %e, "entity observer fetch failed");
            return None;
        }
    };

    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if !state.observing {
        return None;
    }

    let next = row.map(|(row_id, row)| (row_id, Arc::new((core.create_item)(row))));
    let change = match (&state.current, &next) {
        (None, None) => None,
        (None, Some((_, item))) => Some(EntityChange::Create(Arc::clone(item))),
        (Some((_, old)), None) => Some(EntityChange::Remove(Arc::clone(old))),
        (Some((old_row, old)), Some((new_row, new))) => {
            (old_row != new_row || old != new).then(|| EntityChange::Update(Arc::clone(new)))
        }
    };

    if change.is_some() {
        state.current = next;
    }
    change
}

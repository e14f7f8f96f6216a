//! Store handle and write transactions.
//!
//! A [`Store`] owns two connections to the same WAL-mode database: the
//! writer, used only inside [`Store::write`], and a query-only reader that
//! observers and snapshot reads use so they never contend with writers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use directories::ProjectDirs;
use rusqlite::{Connection, Transaction};

use tether_shared::constants::APP_NAME;

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::notify::{ChangeSet, Notifier, RowChange, RowChangeKind, Subscription, Table};

struct Inner {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    notifier: Notifier,
    path: PathBuf,
}

/// Cheaply cloneable handle on the local database.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Open (or create) the default database in the platform data directory.
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("io", APP_NAME, APP_NAME).ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("tether.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path)?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&writer)?;

        let reader = Connection::open(path)?;
        reader.pragma_update(None, "query_only", "ON")?;

        let notifier = Notifier::spawn()?;

        Ok(Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
                notifier,
                path: path.to_path_buf(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run `f` inside a write transaction.
    ///
    /// On success the transaction commits and the rows it touched are queued
    /// to observers before the writer lock is released. If `f` fails the
    /// transaction rolls back and nothing is published.
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteSession<'_>) -> Result<T>,
    {
        let mut conn = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut session = WriteSession {
            tx: conn.transaction()?,
            changes: Vec::new(),
        };

        let value = f(&mut session)?;

        let WriteSession { tx, changes } = session;
        tx.commit()?;

        if !changes.is_empty() {
            self.inner.notifier.publish(ChangeSet::new(changes));
        }
        Ok(value)
    }

    /// [`Store::write`] on the blocking pool.
    pub async fn write_async<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteSession<'_>) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.write(f))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run a read on the query-only connection.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    pub async fn read_async<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read(f))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Synchronization barrier: returns once every commit made before the
    /// call has been delivered to observers.
    pub fn flush(&self) -> Result<()> {
        self.inner.notifier.run(|| ())
    }

    pub async fn flush_async(&self) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.inner.notifier.enqueue(Box::new(move || {
            let _ = tx.send(());
        }))?;
        rx.await.map_err(|_| StoreError::DispatcherClosed)
    }

    /// Delete every row. Observers see all their items removed.
    pub fn remove_all_data(&self) -> Result<()> {
        self.write(|session| session.remove_all())
    }

    /// Register `callback` for commits touching any of `tables`.
    pub fn subscribe<F>(&self, tables: Vec<Table>, callback: F) -> Subscription
    where
        F: FnMut(&ChangeSet) + Send + 'static,
    {
        self.inner.notifier.subscribe(tables, Box::new(callback))
    }

    /// Run `f` on the observer dispatch context and wait for the result.
    pub(crate) fn on_dispatcher<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.inner.notifier.run(f)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.inner.path).finish()
    }
}

/// An open write transaction. Every mutating helper records the rows it
/// touched so the commit can be published.
pub struct WriteSession<'conn> {
    tx: Transaction<'conn>,
    changes: Vec<RowChange>,
}

impl WriteSession<'_> {
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    pub(crate) fn record(&mut self, table: Table, row_id: i64, kind: RowChangeKind) {
        self.changes.push(RowChange {
            table,
            row_id,
            kind,
        });
    }

    fn remove_all(&mut self) -> Result<()> {
        for (table, name) in [
            (Table::QueryLinks, "query_links"),
            (Table::Messages, "messages"),
            (Table::Channels, "channels"),
        ] {
            let row_ids: Vec<i64> = {
                let mut stmt = self.tx.prepare(&format!("SELECT row_id FROM {name}"))?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            self.tx.execute(&format!("DELETE FROM {name}"), [])?;
            for row_id in row_ids {
                self.record(table, row_id, RowChangeKind::Delete);
            }
        }
        self.tx.execute("DELETE FROM channel_reads", [])?;
        Ok(())
    }
}

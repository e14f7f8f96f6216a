//! Schema upgrades.
//!
//! `PRAGMA user_version` holds the number of the last applied step. Opening
//! a store applies every later step in order, each in its own transaction
//! together with the version bump, so a crash never leaves a half-applied
//! step behind.

pub mod v001_initial;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered upgrade steps; step `n` moves the schema from `n - 1` to `n`.
const STEPS: &[(u32, &str, Step)] = &[(1, "v001_initial", v001_initial::up)];

pub(crate) fn schema_version() -> u32 {
    STEPS.last().map_or(0, |(version, _, _)| *version)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = schema_version();
    if found > target {
        return Err(StoreError::Migration(format!(
            "database schema v{found} is newer than supported v{target}"
        )));
    }
    debug!(found, target, "schema version");

    for (version, name, step) in STEPS.iter().filter(|(v, _, _)| *v > found) {
        info!(version, name, "upgrading schema");
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let applied = step(conn).and_then(|()| conn.pragma_update(None, "user_version", version));
        match applied {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(StoreError::Migration(format!("{name}: {e}")));
            }
        }
    }
    Ok(())
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No platform data directory to place the default database in.
    #[error("No data directory available for the default database")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Row not found")]
    NotFound,

    /// A schema upgrade step failed, or the file was written by a newer build.
    #[error("Schema upgrade failed: {0}")]
    Migration(String),

    /// Member lists, reactions and attachments are stored as JSON text.
    #[error("Malformed JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed timestamp column: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    #[error("Observer dispatcher has shut down")]
    DispatcherClosed,

    /// A blocking store call on the tokio pool panicked or was cancelled.
    #[error("Blocking store task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

use thiserror::Error;

/// Errors surfaced by the queue engine.
///
/// `Config` means the caller set something up wrong (bad queue name,
/// missing backing table, incompatible payload shape) and retrying will
/// not help. `Storage` wraps the underlying driver error untouched so
/// callers can apply their own retry policy. Attempt exhaustion is not an
/// error at all: it is the dead-letter state transition, observable via
/// the message's attempts and queue stats.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map a driver error on a queue operation, turning "the backing table is
/// not there" into a configuration error instead of a transient one.
pub(crate) fn classify(err: sqlx::Error, queue_name: &str) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.message().contains("no such table") {
            return Error::Config(format!(
                "queue '{queue_name}' has no backing table; run schema::synchronize first"
            ));
        }
    }
    Error::Storage(err)
}

/// A losing racer of a concurrent `ALTER TABLE ... ADD COLUMN` sees this;
/// the structure it wanted already exists, so it is not a failure.
pub(crate) fn is_duplicate_column(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.message().contains("duplicate column name"),
        _ => false,
    }
}

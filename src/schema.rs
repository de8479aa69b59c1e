//! Schema manager: brings a queue's backing table to the structure its
//! definition requires, idempotently and additively.
//!
//! The required structure is declarative (column list + claim-scan
//! index); `synchronize` diffs it against the live table and applies only
//! additive changes. Anything that cannot be auto-migrated, like a
//! payload shape change for an existing queue, is a configuration error
//! surfaced to the operator, never a silent coercion.

use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::codec::PayloadCodec;
use crate::error::{Error, Result, is_duplicate_column};
use crate::queue::Queue;

/// Columns that may be added to an already-existing table. `id` and
/// `payload` are not listed: a table that lacks them is not a queue table
/// we can adopt. NOT NULL columns carry a default so ADD COLUMN works on
/// populated tables.
const ADDABLE_COLUMNS: &[(&str, &str)] = &[
    ("meta", "TEXT"),
    ("attempts", "INTEGER NOT NULL DEFAULT 0"),
    ("created_at", "INTEGER NOT NULL DEFAULT 0"),
    ("visible_at", "INTEGER NOT NULL DEFAULT 0"),
    ("claimed_at", "INTEGER"),
    ("consumer", "TEXT"),
    ("failed_at", "INTEGER"),
];

/// Ensure the backing table and index for `queue` exist with the required
/// structure. Safe to call repeatedly and from several service instances
/// at once: the create statements are `IF NOT EXISTS` and a lost
/// add-column race is swallowed, so every caller converges on the same
/// end state.
pub async fn synchronize<C: PayloadCodec>(pool: &SqlitePool, queue: &Queue<C>) -> Result<()> {
    let table = queue.table();
    let payload_type = queue.codec().column_type().sql_type();

    match table_columns(pool, table).await? {
        None => {
            sqlx::query(&create_table_sql(table, payload_type))
                .execute(pool)
                .await?;
            info!(queue = queue.name(), table, "created queue backing table");
        }
        Some(columns) => {
            check_payload_column(queue.name(), &columns, payload_type)?;
            add_missing_columns(pool, table, &columns).await?;
        }
    }

    sqlx::query(&create_index_sql(table)).execute(pool).await?;
    Ok(())
}

#[derive(Debug)]
struct ColumnInfo {
    name: String,
    type_name: String,
}

/// Live column list of `table`, or `None` if the table does not exist.
async fn table_columns(pool: &SqlitePool, table: &str) -> Result<Option<Vec<ColumnInfo>>> {
    let exists = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Ok(None);
    }

    // Table names are validated queue identifiers, safe to interpolate.
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        columns.push(ColumnInfo {
            name: row.try_get("name").map_err(Error::Storage)?,
            type_name: row.try_get("type").map_err(Error::Storage)?,
        });
    }
    Ok(Some(columns))
}

fn check_payload_column(queue_name: &str, columns: &[ColumnInfo], required: &str) -> Result<()> {
    let payload = columns
        .iter()
        .find(|c| c.name == "payload")
        .ok_or_else(|| {
            Error::Config(format!(
                "table for queue '{queue_name}' exists but has no payload column; \
                 it cannot be adopted as a queue table"
            ))
        })?;

    // A payload shape change for an existing queue is a breaking schema
    // change, not a drift to fix.
    if !payload.type_name.eq_ignore_ascii_case(required) {
        return Err(Error::Config(format!(
            "queue '{queue_name}' payload column is {} but the definition requires {required}; \
             changing the payload shape of an existing queue is not supported",
            payload.type_name
        )));
    }
    Ok(())
}

async fn add_missing_columns(
    pool: &SqlitePool,
    table: &str,
    existing: &[ColumnInfo],
) -> Result<()> {
    for (name, ddl) in ADDABLE_COLUMNS {
        if existing.iter().any(|c| c.name == *name) {
            continue;
        }
        let sql = format!("ALTER TABLE {table} ADD COLUMN {name} {ddl}");
        match sqlx::query(&sql).execute(pool).await {
            Ok(_) => info!(table, column = *name, "added missing column"),
            // A concurrent synchronize added it first; same end state.
            Err(err) if is_duplicate_column(&err) => {
                debug!(table, column = *name, "column added concurrently");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn create_table_sql(table: &str, payload_type: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20   id         INTEGER PRIMARY KEY AUTOINCREMENT,\n\
         \x20   payload    {payload_type} NOT NULL,\n\
         \x20   meta       TEXT,\n\
         \x20   attempts   INTEGER NOT NULL DEFAULT 0,\n\
         \x20   created_at INTEGER NOT NULL,\n\
         \x20   visible_at INTEGER NOT NULL,\n\
         \x20   claimed_at INTEGER,\n\
         \x20   consumer   TEXT,\n\
         \x20   failed_at  INTEGER\n\
         )"
    )
}

/// Index backing the "oldest eligible row first" claim scan.
fn create_index_sql(table: &str) -> String {
    format!("CREATE INDEX IF NOT EXISTS ix_{table}_visible_at ON {table} (visible_at, id)")
}

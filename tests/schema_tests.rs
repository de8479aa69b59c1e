use sqlx::{Row, SqlitePool};

use rowq::codec::{Bytes, Json, Text};
use rowq::{Consumer, Error, Producer, Queue, schema};

async fn test_pool(dir: &tempfile::TempDir) -> anyhow::Result<SqlitePool> {
    Ok(rowq::db::connect(dir.path().join("schema.db")).await?)
}

async fn column_names(pool: &SqlitePool, table: &str) -> anyhow::Result<Vec<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    let mut names = Vec::new();
    for row in &rows {
        names.push(row.try_get::<String, _>("name")?);
    }
    Ok(names)
}

const REQUIRED: &[&str] = &[
    "id", "payload", "meta", "attempts", "created_at", "visible_at", "claimed_at", "consumer",
    "failed_at",
];

#[tokio::test]
async fn synchronize_creates_table_and_index() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = test_pool(&dir).await?;
    let queue = Queue::new("orders", Json::<serde_json::Value>::new())?;
    schema::synchronize(&pool, &queue).await?;

    let columns = column_names(&pool, "q_orders").await?;
    for required in REQUIRED {
        assert!(columns.contains(&required.to_string()), "missing {required}");
    }

    let index: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND name = 'ix_q_orders_visible_at'",
    )
    .fetch_optional(&pool)
    .await?;
    assert!(index.is_some(), "claim-scan index missing");
    Ok(())
}

#[tokio::test]
async fn synchronize_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = test_pool(&dir).await?;
    let queue = Queue::new("idem", Text)?;

    schema::synchronize(&pool, &queue).await?;
    schema::synchronize(&pool, &queue).await?;

    let tables: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'q_%'")
            .fetch_all(&pool)
            .await?;
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].0, "q_idem");
    Ok(())
}

#[tokio::test]
async fn concurrent_synchronize_converges_without_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = test_pool(&dir).await?;
    let queue = Queue::new("racy", Text)?;

    let (a, b, c) = tokio::join!(
        schema::synchronize(&pool, &queue),
        schema::synchronize(&pool, &queue),
        schema::synchronize(&pool, &queue),
    );
    a?;
    b?;
    c?;

    // Table is usable afterwards.
    let producer = Producer::new(pool.clone(), queue.clone());
    let consumer = Consumer::new(pool, queue);
    producer.send(&"hello".to_string()).await?;
    assert_eq!(consumer.receive().await?.unwrap().payload, "hello");
    Ok(())
}

#[tokio::test]
async fn payload_shape_change_is_a_config_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = test_pool(&dir).await?;

    let as_text = Queue::new("payments", Text)?;
    schema::synchronize(&pool, &as_text).await?;

    let as_bytes = Queue::new("payments", Bytes)?;
    let err = schema::synchronize(&pool, &as_bytes).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");

    // The original shape still works.
    schema::synchronize(&pool, &as_text).await?;
    Ok(())
}

#[tokio::test]
async fn synchronize_adds_missing_columns_additively() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = test_pool(&dir).await?;

    // A legacy table from an older engine version: mandatory core only.
    sqlx::query(
        "CREATE TABLE q_legacy (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             payload TEXT NOT NULL, \
             created_at INTEGER NOT NULL, \
             visible_at INTEGER NOT NULL, \
             attempts INTEGER NOT NULL DEFAULT 0)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("INSERT INTO q_legacy (payload, created_at, visible_at) VALUES ('old', 0, 0)")
        .execute(&pool)
        .await?;

    let queue = Queue::new("legacy", Text)?;
    schema::synchronize(&pool, &queue).await?;

    let columns = column_names(&pool, "q_legacy").await?;
    for required in REQUIRED {
        assert!(columns.contains(&required.to_string()), "missing {required}");
    }

    // Pre-existing data survives the migration and is claimable.
    let consumer = Consumer::new(pool, queue);
    let message = consumer.receive().await?.expect("old row still there");
    assert_eq!(message.payload, "old");
    Ok(())
}

#[tokio::test]
async fn operations_without_backing_table_are_config_errors() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = test_pool(&dir).await?;
    let queue = Queue::new("never_synced", Text)?;

    let producer = Producer::new(pool.clone(), queue.clone());
    let err = producer.send(&"x".to_string()).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");

    let consumer = Consumer::new(pool, queue);
    let err = consumer.receive().await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
    Ok(())
}

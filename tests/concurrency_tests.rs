use std::collections::HashSet;
use std::time::Duration;

use sqlx::SqlitePool;

use rowq::codec::Int;
use rowq::{Consumer, Error, MessageId, Producer, Queue, schema};

async fn test_pool(dir: &tempfile::TempDir) -> anyhow::Result<SqlitePool> {
    Ok(rowq::db::connect(dir.path().join("stress.db")).await?)
}

/// Claim until the queue reports empty, retrying briefly on SQLite write
/// contention ("database is locked") the way a real caller would.
async fn drain(consumer: Consumer<Int>, batch: usize) -> anyhow::Result<Vec<MessageId>> {
    let mut claimed = Vec::new();
    loop {
        match consumer.receive_batch(batch).await {
            Ok(messages) if messages.is_empty() => return Ok(claimed),
            Ok(messages) => claimed.extend(messages.iter().map(|m| m.id)),
            Err(Error::Storage(err)) if err.to_string().contains("locked") => {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[tokio::test]
async fn concurrent_consumers_never_share_a_message() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = test_pool(&dir).await?;
    let queue = Queue::new("shared", Int)?;
    schema::synchronize(&pool, &queue).await?;

    const MESSAGES: i64 = 60;
    let producer = Producer::new(pool.clone(), queue.clone());
    let values: Vec<i64> = (0..MESSAGES).collect();
    producer.send_batch(&values).await?;

    // Default 60s visibility: nothing expires mid-test, so any duplicate
    // would be a real mutual-exclusion violation.
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let consumer = Consumer::new(pool.clone(), queue.clone());
        tasks.push(tokio::spawn(drain(consumer, 5)));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await??);
    }

    let unique: HashSet<MessageId> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len(), "a message was delivered twice");
    assert_eq!(all.len() as i64, MESSAGES, "a message was lost or invented");
    Ok(())
}

#[tokio::test]
async fn concurrent_producers_append_without_loss() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = test_pool(&dir).await?;
    let queue = Queue::new("firehose", Int)?;
    schema::synchronize(&pool, &queue).await?;

    let mut tasks = Vec::new();
    for p in 0..3i64 {
        let producer = Producer::new(pool.clone(), queue.clone());
        tasks.push(tokio::spawn(async move {
            let mut sent = Vec::new();
            for n in 0..20i64 {
                let value = p * 100 + n;
                loop {
                    match producer.send(&value).await {
                        Ok(id) => {
                            sent.push(id);
                            break;
                        }
                        Err(Error::Storage(err)) if err.to_string().contains("locked") => {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        Err(err) => return Err(anyhow::Error::from(err)),
                    }
                }
            }
            Ok(sent)
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        for id in task.await?? {
            assert!(ids.insert(id), "storage assigned a duplicate id");
        }
    }
    assert_eq!(ids.len(), 60);

    let consumer = Consumer::new(pool, queue);
    assert_eq!(consumer.stats().await?.ready, 60);
    Ok(())
}

#[tokio::test]
async fn claims_and_deletes_interleave_safely() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = test_pool(&dir).await?;
    let queue = Queue::new("pipeline", Int)?;
    schema::synchronize(&pool, &queue).await?;

    let producer = Producer::new(pool.clone(), queue.clone());
    let values: Vec<i64> = (0..40).collect();
    producer.send_batch(&values).await?;

    // Two workers that claim, "process" and delete until done.
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let consumer = Consumer::new(pool.clone(), queue.clone());
        tasks.push(tokio::spawn(async move {
            let mut processed = 0u64;
            loop {
                match consumer.receive_batch(4).await {
                    Ok(messages) if messages.is_empty() => return Ok::<_, anyhow::Error>(processed),
                    Ok(messages) => {
                        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
                        processed += consumer.delete_ids(&ids).await?;
                    }
                    Err(Error::Storage(err)) if err.to_string().contains("locked") => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }));
    }

    let mut total = 0u64;
    for task in tasks {
        total += task.await??;
    }
    assert_eq!(total, 40, "every message processed exactly once");

    let consumer = Consumer::new(pool, queue);
    assert_eq!(consumer.stats().await?.total, 0);
    Ok(())
}

//! Consumer side of the queue: the lease protocol plus finalization.
//!
//! A claim is one atomic statement that selects the oldest eligible rows,
//! pushes their `visible_at` into the future, bumps `attempts` and
//! returns the row content. The advanced `visible_at` *is* the lease:
//! until it elapses no other consumer can see the row, and if the claimer
//! dies the row becomes reclaimable on its own, with no heartbeat
//! channel. SQLite admits a single writer at a time, so two consumers can
//! never select the same rows; this is the SQLite rendition of the
//! skip-locked claim a dedicated broker runs on bigger engines.

use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::codec::{PayloadCodec, PayloadValue};
use crate::db::{duration_ms, now_ms};
use crate::error::{Error, Result, classify};
use crate::queue::Queue;
use crate::MessageId;

/// A delivered message: payload plus delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct Message<T> {
    pub id: MessageId,
    pub payload: T,
    /// Producer-supplied attributes, empty if none were sent.
    pub meta: BTreeMap<String, String>,
    /// Times this message has been claimed, including the claim that
    /// delivered it.
    pub attempts: i64,
    /// Enqueue time, epoch ms.
    pub created_at: i64,
    /// Lease deadline after the delivering claim, epoch ms.
    pub visible_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    /// Identity tag recorded on claimed rows. Defaults to a fresh
    /// `consumer-<uuid>` per consumer instance.
    pub name: Option<String>,
}

/// What to do with the lease on an explicit negative acknowledgment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Leave `visible_at` where the claim pushed it; the message retries
    /// naturally once the visibility timeout elapses.
    #[default]
    AfterTimeout,
    /// Reset `visible_at` to now so the message is immediately eligible.
    Immediate,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailOptions {
    pub retry: RetryPolicy,
}

/// Outcome of a `fail` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Retry budget exhausted; the row was flagged as terminally failed.
    DeadLettered,
    /// Made eligible again right away.
    Requeued,
    /// Lease left in place; the message retries after the timeout.
    LeftLeased,
}

/// Live row counts for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Eligible for a claim right now.
    pub ready: i64,
    /// Claimed, lease not yet expired.
    pub leased: i64,
    /// Terminally failed, awaiting sweep.
    pub dead_lettered: i64,
    pub total: i64,
}

/// Claims, inspects and finalizes messages of one queue. Any number of
/// consumers may run against the same table from different processes; the
/// storage engine's transactions are the only coordination between them.
#[derive(Debug, Clone)]
pub struct Consumer<C: PayloadCodec> {
    pool: SqlitePool,
    queue: Queue<C>,
    name: String,
}

impl<C: PayloadCodec> Consumer<C> {
    pub fn new(pool: SqlitePool, queue: Queue<C>) -> Self {
        Self::with_options(pool, queue, ConsumerOptions::default())
    }

    pub fn with_options(pool: SqlitePool, queue: Queue<C>, options: ConsumerOptions) -> Self {
        let name = options
            .name
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));
        Consumer { pool, queue, name }
    }

    pub fn queue(&self) -> &Queue<C> {
        &self.queue
    }

    /// Identity tag recorded on rows this consumer claims.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// One lease-protocol attempt with batch size 1. A single poll:
    /// returns `None` when no row is eligible, never waits for one.
    pub async fn receive(&self) -> Result<Option<Message<C::Value>>> {
        let mut messages = self.receive_batch(1).await?;
        Ok(messages.pop())
    }

    /// One lease-protocol attempt claiming up to `limit` rows. Returns
    /// fewer when fewer are eligible.
    pub async fn receive_batch(&self, limit: usize) -> Result<Vec<Message<C::Value>>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let max_attempts = i64::from(self.queue.options().max_attempts);

        // Exhausted rows whose final lease expired can never be claimed
        // again; flag them terminal before scanning so they show up as
        // dead-lettered instead of lingering invisible.
        self.flag_expired_exhausted(now, max_attempts).await?;

        // Saturate in Rust like the producer does; in-SQL addition would
        // abort with "integer overflow" on an extreme visibility timeout.
        let lease_until = now.saturating_add(duration_ms(self.queue.options().visibility_timeout));
        let sql = claim_sql(self.queue.table());
        let rows = sqlx::query(&sql)
            .bind(lease_until)
            .bind(now)
            .bind(self.name.clone())
            .bind(now)
            .bind(max_attempts)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, self.queue.name()))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            messages.push(self.message_from_row(row)?);
        }
        // RETURNING order is unspecified; ids are monotone per enqueue,
        // so this keeps delivery deterministic.
        messages.sort_by_key(|m| m.id);

        if !messages.is_empty() {
            debug!(
                queue = self.queue.name(),
                consumer = %self.name,
                count = messages.len(),
                "claimed messages"
            );
        }
        Ok(messages)
    }

    /// Permanently remove a delivered message. Idempotent: deleting an
    /// already-deleted message is a no-op, so a caller may retry after an
    /// ambiguous outcome. Returns whether a row was actually removed.
    pub async fn delete(&self, message: &Message<C::Value>) -> Result<bool> {
        let removed = self.delete_ids(&[message.id]).await?;
        Ok(removed > 0)
    }

    /// Bulk form of `delete`; returns how many rows were removed.
    pub async fn delete_ids(&self, ids: &[MessageId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE id IN ({})",
            self.queue.table(),
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, self.queue.name()))?;
        Ok(result.rows_affected())
    }

    /// Explicit negative acknowledgment with the default policy: the
    /// message stays leased and retries after the visibility timeout,
    /// unless its retry budget is exhausted, in which case it is
    /// dead-lettered.
    pub async fn fail(&self, message: &Message<C::Value>) -> Result<FailOutcome> {
        self.fail_with(message, FailOptions::default()).await
    }

    pub async fn fail_with(
        &self,
        message: &Message<C::Value>,
        options: FailOptions,
    ) -> Result<FailOutcome> {
        let now = now_ms();
        let max_attempts = i64::from(self.queue.options().max_attempts);

        if message.attempts >= max_attempts {
            let sql = format!(
                "UPDATE {} SET failed_at = ? WHERE id = ? AND failed_at IS NULL",
                self.queue.table()
            );
            sqlx::query(&sql)
                .bind(now)
                .bind(message.id)
                .execute(&self.pool)
                .await
                .map_err(|e| classify(e, self.queue.name()))?;
            debug!(queue = self.queue.name(), id = message.id, "dead-lettered message");
            return Ok(FailOutcome::DeadLettered);
        }

        match options.retry {
            RetryPolicy::AfterTimeout => Ok(FailOutcome::LeftLeased),
            RetryPolicy::Immediate => {
                let sql = format!(
                    "UPDATE {} SET visible_at = ? WHERE id = ? AND failed_at IS NULL",
                    self.queue.table()
                );
                sqlx::query(&sql)
                    .bind(now)
                    .bind(message.id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| classify(e, self.queue.name()))?;
                Ok(FailOutcome::Requeued)
            }
        }
    }

    /// Bulk negative acknowledgment by id. Rows at their attempt limit
    /// are dead-lettered; the rest are requeued immediately when the
    /// policy asks for it. Returns `(dead_lettered, requeued)`.
    pub async fn fail_ids(&self, ids: &[MessageId], options: FailOptions) -> Result<(u64, u64)> {
        if ids.is_empty() {
            return Ok((0, 0));
        }
        let now = now_ms();
        let max_attempts = i64::from(self.queue.options().max_attempts);
        let in_list = placeholders(ids.len());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, self.queue.name()))?;

        let sql = format!(
            "UPDATE {} SET failed_at = ? \
             WHERE id IN ({in_list}) AND attempts >= ? AND failed_at IS NULL",
            self.queue.table()
        );
        let mut query = sqlx::query(&sql).bind(now);
        for id in ids {
            query = query.bind(*id);
        }
        let dead = query
            .bind(max_attempts)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, self.queue.name()))?
            .rows_affected();

        let requeued = match options.retry {
            RetryPolicy::AfterTimeout => 0,
            RetryPolicy::Immediate => {
                let sql = format!(
                    "UPDATE {} SET visible_at = ? \
                     WHERE id IN ({in_list}) AND attempts < ? AND failed_at IS NULL",
                    self.queue.table()
                );
                let mut query = sqlx::query(&sql).bind(now);
                for id in ids {
                    query = query.bind(*id);
                }
                query
                    .bind(max_attempts)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| classify(e, self.queue.name()))?
                    .rows_affected()
            }
        };

        tx.commit()
            .await
            .map_err(|e| classify(e, self.queue.name()))?;
        Ok((dead, requeued))
    }

    /// Read up to `limit` eligible messages without leasing them.
    pub async fn peek(&self, limit: usize) -> Result<Vec<Message<C::Value>>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, payload, meta, attempts, created_at, visible_at FROM {} \
             WHERE visible_at <= ? AND attempts < ? AND failed_at IS NULL \
             ORDER BY visible_at, id LIMIT ?",
            self.queue.table()
        );
        let rows = sqlx::query(&sql)
            .bind(now_ms())
            .bind(i64::from(self.queue.options().max_attempts))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, self.queue.name()))?;
        self.rows_to_messages(&rows)
    }

    /// Read up to `limit` dead-lettered messages for inspection.
    pub async fn peek_dead_letters(&self, limit: usize) -> Result<Vec<Message<C::Value>>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, payload, meta, attempts, created_at, visible_at FROM {} \
             WHERE failed_at IS NOT NULL ORDER BY failed_at, id LIMIT ?",
            self.queue.table()
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, self.queue.name()))?;
        self.rows_to_messages(&rows)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let now = now_ms();
        let max_attempts = i64::from(self.queue.options().max_attempts);
        let sql = format!(
            "SELECT \
               COALESCE(SUM(visible_at <= ?1 AND attempts < ?2 AND failed_at IS NULL), 0) AS ready, \
               COALESCE(SUM(visible_at > ?1 AND claimed_at IS NOT NULL AND failed_at IS NULL), 0) AS leased, \
               COALESCE(SUM(failed_at IS NOT NULL), 0) AS dead_lettered, \
               COUNT(*) AS total \
             FROM {}",
            self.queue.table()
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(max_attempts)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify(e, self.queue.name()))?;
        Ok(QueueStats {
            ready: row.try_get("ready").map_err(Error::Storage)?,
            leased: row.try_get("leased").map_err(Error::Storage)?,
            dead_lettered: row.try_get("dead_lettered").map_err(Error::Storage)?,
            total: row.try_get("total").map_err(Error::Storage)?,
        })
    }

    /// Delete every message in the queue. Returns the number removed.
    pub async fn purge(&self) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.queue.table());
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, self.queue.name()))?;
        Ok(result.rows_affected())
    }

    /// Delete dead-lettered rows. Returns the number removed.
    pub async fn sweep_dead_letters(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE failed_at IS NOT NULL",
            self.queue.table()
        );
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, self.queue.name()))?;
        Ok(result.rows_affected())
    }

    async fn flag_expired_exhausted(&self, now: i64, max_attempts: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET failed_at = ? \
             WHERE failed_at IS NULL AND attempts >= ? AND visible_at <= ?",
            self.queue.table()
        );
        sqlx::query(&sql)
            .bind(now)
            .bind(max_attempts)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, self.queue.name()))?;
        Ok(())
    }

    fn rows_to_messages(&self, rows: &[SqliteRow]) -> Result<Vec<Message<C::Value>>> {
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(self.message_from_row(row)?);
        }
        Ok(messages)
    }

    fn message_from_row(&self, row: &SqliteRow) -> Result<Message<C::Value>> {
        let raw = PayloadValue::from_row(row, "payload", self.queue.codec().column_type())
            .map_err(Error::Storage)?;
        let payload = self.queue.codec().decode(raw)?;
        let meta: Option<String> = row.try_get("meta").map_err(Error::Storage)?;
        let meta = match meta {
            Some(json) => serde_json::from_str(&json)?,
            None => BTreeMap::new(),
        };
        Ok(Message {
            id: row.try_get("id").map_err(Error::Storage)?,
            payload,
            meta,
            attempts: row.try_get("attempts").map_err(Error::Storage)?,
            created_at: row.try_get("created_at").map_err(Error::Storage)?,
            visible_at: row.try_get("visible_at").map_err(Error::Storage)?,
        })
    }
}

/// One atomic claim: select the oldest eligible rows, advance their lease
/// and return their content. Bind order: lease_until, now, name, now,
/// max_attempts, limit.
fn claim_sql(table: &str) -> String {
    format!(
        "UPDATE {table} SET \
            attempts = attempts + 1, \
            visible_at = ?, \
            claimed_at = ?, \
            consumer = ? \
         WHERE id IN ( \
            SELECT id FROM {table} \
            WHERE visible_at <= ? AND attempts < ? AND failed_at IS NULL \
            ORDER BY visible_at, id \
            LIMIT ?) \
         RETURNING id, payload, meta, attempts, created_at, visible_at"
    )
}

fn placeholders(count: usize) -> String {
    let mut s = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

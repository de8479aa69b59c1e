use std::collections::BTreeMap;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::debug;

use crate::codec::PayloadCodec;
use crate::db::{duration_ms, now_ms};
use crate::error::{Result, classify};
use crate::queue::Queue;
use crate::MessageId;

/// Per-send overrides and attributes.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the queue's default delay for this send.
    pub delay: Option<Duration>,
    /// Producer-supplied attributes stored alongside the message and
    /// returned verbatim on receive.
    pub meta: Option<BTreeMap<String, String>>,
}

/// Appends messages to a queue's backing table. Producers only insert:
/// they never read rows and never touch other consumers' leases, and they
/// never retry internally; storage errors surface to the caller as-is.
#[derive(Debug, Clone)]
pub struct Producer<C: PayloadCodec> {
    pool: SqlitePool,
    queue: Queue<C>,
}

impl<C: PayloadCodec> Producer<C> {
    pub fn new(pool: SqlitePool, queue: Queue<C>) -> Self {
        Producer { pool, queue }
    }

    pub fn queue(&self) -> &Queue<C> {
        &self.queue
    }

    /// Insert one message, visible after the queue's default delay.
    pub async fn send(&self, value: &C::Value) -> Result<MessageId> {
        self.send_with(value, SendOptions::default()).await
    }

    pub async fn send_with(&self, value: &C::Value, options: SendOptions) -> Result<MessageId> {
        let now = now_ms();
        let visible_at = self.visible_at(now, &options);
        let raw = self.queue.codec().encode(value)?;
        let meta_json = encode_meta(&options)?;

        let sql = insert_sql(self.queue.table());
        let query = raw
            .bind_to(sqlx::query(&sql))
            .bind(meta_json)
            .bind(now)
            .bind(visible_at);
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, self.queue.name()))?;

        let id = result.last_insert_rowid();
        debug!(queue = self.queue.name(), id, visible_at, "sent message");
        Ok(id)
    }

    /// Insert a batch in one transaction: either every message becomes
    /// visible or none does.
    pub async fn send_batch(&self, values: &[C::Value]) -> Result<Vec<MessageId>> {
        self.send_batch_with(values, SendOptions::default()).await
    }

    pub async fn send_batch_with(
        &self,
        values: &[C::Value],
        options: SendOptions,
    ) -> Result<Vec<MessageId>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let visible_at = self.visible_at(now, &options);
        let meta_json = encode_meta(&options)?;
        let sql = insert_sql(self.queue.table());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, self.queue.name()))?;
        let mut ids = Vec::with_capacity(values.len());
        for value in values {
            let raw = self.queue.codec().encode(value)?;
            let result = raw
                .bind_to(sqlx::query(&sql))
                .bind(meta_json.clone())
                .bind(now)
                .bind(visible_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify(e, self.queue.name()))?;
            ids.push(result.last_insert_rowid());
        }
        tx.commit()
            .await
            .map_err(|e| classify(e, self.queue.name()))?;

        debug!(queue = self.queue.name(), count = ids.len(), "sent batch");
        Ok(ids)
    }

    fn visible_at(&self, now: i64, options: &SendOptions) -> i64 {
        let delay = options.delay.unwrap_or(self.queue.options().delay);
        now.saturating_add(duration_ms(delay))
    }
}

fn encode_meta(options: &SendOptions) -> Result<Option<String>> {
    Ok(match &options.meta {
        Some(meta) => Some(serde_json::to_string(meta)?),
        None => None,
    })
}

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (payload, meta, attempts, created_at, visible_at) \
         VALUES (?, ?, 0, ?, ?)"
    )
}

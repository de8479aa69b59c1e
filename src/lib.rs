//! Message queues layered on ordinary relational tables.
//!
//! Each queue is backed by one SQLite table. Producers append rows;
//! consumers claim them under an implicit, time-bounded lease encoded in
//! the row's `visible_at` timestamp; a schema manager creates and
//! additively evolves the backing table from the queue's declared shape.
//! The storage engine's transactions are the only coordination between
//! concurrent producers and consumers, which yields at-least-once
//! delivery with no duplicate processing while a lease is live.
//!
//! ```no_run
//! use rowq::{Queue, Producer, Consumer, codec::Json};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Job { url: String }
//!
//! # #[tokio::main]
//! # async fn main() -> rowq::Result<()> {
//! let pool = rowq::db::connect("jobs.db").await?;
//! let queue = Queue::new("crawl", Json::<Job>::new())?;
//! rowq::schema::synchronize(&pool, &queue).await?;
//!
//! let producer = Producer::new(pool.clone(), queue.clone());
//! producer.send(&Job { url: "https://example.com".into() }).await?;
//!
//! let consumer = Consumer::new(pool, queue);
//! if let Some(message) = consumer.receive().await? {
//!     // ... process ...
//!     consumer.delete(&message).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod codec;
pub mod consumer;
pub mod db;
pub mod error;
pub mod producer;
pub mod queue;
pub mod schema;

pub use codec::{Bytes, ColumnType, Int, Json, PayloadCodec, PayloadValue, Text};
pub use consumer::{
    Consumer, ConsumerOptions, FailOptions, FailOutcome, Message, QueueStats, RetryPolicy,
};
pub use error::{Error, Result};
pub use producer::{Producer, SendOptions};
pub use queue::{Queue, QueueOptions};

/// Message identifier, assigned monotonically by storage at insert.
pub type MessageId = i64;

//! Operator CLI over JSON-payload queues.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::codec::Json;
use crate::consumer::{Consumer, FailOptions, RetryPolicy};
use crate::producer::{Producer, SendOptions};
use crate::queue::{Queue, QueueOptions};
use crate::{db, schema};

/// rowq CLI interface
#[derive(Parser, Debug)]
#[command(name = "rowq", about = "Message queues on top of a relational table")]
pub struct Cli {
    /// Path to the queue database file
    #[arg(long, global = true, default_value = "rowq.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue management commands
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Message commands
    #[command(subcommand)]
    Message(MessageCommands),
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Create or update the backing table for a queue
    Sync {
        /// Queue name
        name: String,
        /// Maximum claim attempts before dead-lettering
        #[arg(long, default_value_t = 5)]
        max_attempts: u32,
        /// Visibility timeout in milliseconds
        #[arg(long, default_value_t = 60_000)]
        visibility_ms: u64,
        /// Default delivery delay in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Show ready/leased/dead-lettered counts
    Stats {
        /// Queue name
        name: String,
    },
    /// Peek eligible messages without leasing
    Peek {
        /// Queue name
        name: String,
        /// Number of messages to peek
        #[arg(long, default_value_t = 1)]
        limit: usize,
    },
    /// Peek dead-lettered messages
    Dead {
        /// Queue name
        name: String,
        /// Number of messages to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete all messages in the queue
    Purge {
        /// Queue name
        name: String,
    },
    /// Delete dead-lettered messages
    Sweep {
        /// Queue name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum MessageCommands {
    /// Enqueue a JSON message
    Send {
        /// Queue name
        queue: String,
        /// Inline JSON payload (e.g. '{"k":"v"}')
        #[arg(long)]
        payload: String,
        /// Delay visibility in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Claim (lease) up to N messages
    Receive {
        /// Queue name
        queue: String,
        /// Batch size
        #[arg(long, default_value_t = 1)]
        batch: usize,
    },
    /// Acknowledge (delete) messages by id
    Delete {
        /// Queue name
        queue: String,
        /// Comma-separated message ids, e.g. 1,2,3
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
    },
    /// Negative-acknowledge messages by id
    Fail {
        /// Queue name
        queue: String,
        /// Comma-separated message ids, e.g. 1,2,3
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
        /// Make failed messages eligible again immediately
        #[arg(long)]
        now: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let pool = db::connect(&self.db)
            .await
            .with_context(|| format!("failed to open database at {}", self.db.display()))?;

        match self.command {
            Commands::Queue(cmd) => run_queue_command(pool, cmd).await,
            Commands::Message(cmd) => run_message_command(pool, cmd).await,
        }
    }
}

fn json_queue(name: &str) -> Result<Queue<Json<Value>>> {
    Ok(Queue::new(name, Json::<Value>::new())?)
}

async fn run_queue_command(pool: sqlx::SqlitePool, cmd: QueueCommands) -> Result<()> {
    match cmd {
        QueueCommands::Sync { name, max_attempts, visibility_ms, delay_ms } => {
            let options = QueueOptions {
                delay: Duration::from_millis(delay_ms),
                max_attempts,
                visibility_timeout: Duration::from_millis(visibility_ms),
            };
            let queue = Queue::with_options(&name, Json::<Value>::new(), options)?;
            schema::synchronize(&pool, &queue).await?;
            println!("Synchronized queue '{}' (table {})", queue.name(), queue.table());
        }
        QueueCommands::Stats { name } => {
            let consumer = Consumer::new(pool, json_queue(&name)?);
            let stats = consumer.stats().await?;
            println!("Queue '{name}'");
            println!("  ready:         {}", stats.ready);
            println!("  leased:        {}", stats.leased);
            println!("  dead_lettered: {}", stats.dead_lettered);
            println!("  total:         {}", stats.total);
        }
        QueueCommands::Peek { name, limit } => {
            let consumer = Consumer::new(pool, json_queue(&name)?);
            for m in consumer.peek(limit).await? {
                println!("[id={}] attempts={} payload={}", m.id, m.attempts, m.payload);
            }
        }
        QueueCommands::Dead { name, limit } => {
            let consumer = Consumer::new(pool, json_queue(&name)?);
            for m in consumer.peek_dead_letters(limit).await? {
                println!("[id={}] attempts={} payload={}", m.id, m.attempts, m.payload);
            }
        }
        QueueCommands::Purge { name } => {
            let consumer = Consumer::new(pool, json_queue(&name)?);
            let removed = consumer.purge().await?;
            println!("Purged {removed} message(s) from '{name}'");
        }
        QueueCommands::Sweep { name } => {
            let consumer = Consumer::new(pool, json_queue(&name)?);
            let removed = consumer.sweep_dead_letters().await?;
            println!("Swept {removed} dead-lettered message(s) from '{name}'");
        }
    }
    Ok(())
}

async fn run_message_command(pool: sqlx::SqlitePool, cmd: MessageCommands) -> Result<()> {
    match cmd {
        MessageCommands::Send { queue, payload, delay_ms } => {
            let value: Value = serde_json::from_str(&payload).context("invalid JSON payload")?;
            let producer = Producer::new(pool, json_queue(&queue)?);
            let options = SendOptions {
                delay: delay_ms.map(Duration::from_millis),
                meta: None,
            };
            let id = producer.send_with(&value, options).await?;
            println!("Sent message {id} to '{queue}'");
        }
        MessageCommands::Receive { queue, batch } => {
            let consumer = Consumer::new(pool, json_queue(&queue)?);
            let messages = consumer.receive_batch(batch).await?;
            if messages.is_empty() {
                println!("No messages available in '{queue}'");
            }
            for m in messages {
                println!(
                    "[id={}] attempts={} visible_at={} payload={}",
                    m.id, m.attempts, m.visible_at, m.payload
                );
            }
        }
        MessageCommands::Delete { queue, ids } => {
            let consumer = Consumer::new(pool, json_queue(&queue)?);
            let removed = consumer.delete_ids(&ids).await?;
            println!("Deleted {removed} message(s)");
        }
        MessageCommands::Fail { queue, ids, now } => {
            let consumer = Consumer::new(pool, json_queue(&queue)?);
            let retry = if now { RetryPolicy::Immediate } else { RetryPolicy::AfterTimeout };
            let (dead, requeued) = consumer.fail_ids(&ids, FailOptions { retry }).await?;
            println!("Failed: dead_lettered={dead} requeued={requeued}");
        }
    }
    Ok(())
}

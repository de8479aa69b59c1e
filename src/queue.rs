use std::time::Duration;

use crate::codec::PayloadCodec;
use crate::error::{Error, Result};

/// Queue names map directly to table names with this prefix: a queue
/// named `customer_mail` is backed by the table `q_customer_mail`.
pub const TABLE_PREFIX: &str = "q_";

const QUEUE_NAME_MAX_LENGTH: usize = 63;

/// Tunable queue behavior. Defaults: messages visible immediately, five
/// delivery attempts, sixty-second visibility timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Delay before a freshly sent message becomes visible to consumers.
    /// A per-send delay (see `SendOptions`) takes priority over this.
    pub delay: Duration,
    /// Claims a message may receive before it is dead-lettered.
    pub max_attempts: u32,
    /// How long a claimed message stays hidden from other consumers
    /// before it becomes reclaimable again.
    pub visibility_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            delay: Duration::ZERO,
            max_attempts: 5,
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// Immutable description of a named queue: identifying name, payload
/// codec (which fixes the storage column type) and options. Pure data;
/// producers, consumers and the schema manager all take one of these.
#[derive(Debug, Clone)]
pub struct Queue<C: PayloadCodec> {
    name: String,
    table: String,
    codec: C,
    options: QueueOptions,
}

impl<C: PayloadCodec> Queue<C> {
    pub fn new(name: impl Into<String>, codec: C) -> Result<Self> {
        Self::with_options(name, codec, QueueOptions::default())
    }

    pub fn with_options(name: impl Into<String>, codec: C, options: QueueOptions) -> Result<Self> {
        let name = name.into();
        check_queue_name(&name)?;
        check_options(&options)?;
        let table = format!("{TABLE_PREFIX}{name}");
        Ok(Queue { name, table, codec, options })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing table name (`q_` + queue name).
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }
}

fn check_queue_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("queue name is empty".into()));
    }
    if name.starts_with(TABLE_PREFIX) {
        return Err(Error::Config(format!(
            "queue name must not begin with '{TABLE_PREFIX}': name it '{}' instead of '{name}'",
            &name[TABLE_PREFIX.len()..]
        )));
    }
    if name.len() > QUEUE_NAME_MAX_LENGTH {
        return Err(Error::Config(format!(
            "queue name length must be <= {QUEUE_NAME_MAX_LENGTH} (current: {}, length {})",
            name,
            name.len()
        )));
    }
    // The name becomes a table name verbatim, so it has to stay a plain
    // identifier.
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::Config(format!(
            "queue name contains illegal symbols; allowed: a-z, 0-9, _ (current: {name})"
        )));
    }
    Ok(())
}

fn check_options(options: &QueueOptions) -> Result<()> {
    if options.max_attempts == 0 {
        return Err(Error::Config(
            "max_attempts must be greater than zero".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Text;

    #[test]
    fn valid_queue_gets_prefixed_table() {
        let q = Queue::new("customer_mail", Text).unwrap();
        assert_eq!(q.name(), "customer_mail");
        assert_eq!(q.table(), "q_customer_mail");
        assert_eq!(q.options().max_attempts, 5);
    }

    #[test]
    fn rejects_bad_names() {
        assert!(Queue::new("", Text).is_err());
        assert!(Queue::new("q_already_prefixed", Text).is_err());
        assert!(Queue::new("Has-Caps", Text).is_err());
        assert!(Queue::new("semi;colon", Text).is_err());
        assert!(Queue::new("a".repeat(64), Text).is_err());
        assert!(Queue::new("a".repeat(63), Text).is_ok());
    }

    #[test]
    fn rejects_zero_attempts() {
        let options = QueueOptions { max_attempts: 0, ..QueueOptions::default() };
        assert!(Queue::with_options("jobs", Text, options).is_err());
    }
}

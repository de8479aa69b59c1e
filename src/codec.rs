//! Payload shape catalog.
//!
//! Every queue stores its payload in a single column whose SQL type is
//! decided by the queue's codec. The catalog is open: anything
//! implementing [`PayloadCodec`] can back a queue. Provided shapes mirror
//! the common cases: JSON documents, plain text, raw bytes and integers.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};

use crate::error::{Error, Result};

/// SQL column type backing a payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Blob,
    Integer,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Integer => "INTEGER",
        }
    }
}

/// A payload as it crosses the storage boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Text(String),
    Blob(Vec<u8>),
    Integer(i64),
}

impl PayloadValue {
    pub(crate) fn bind_to<'q>(
        self,
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            PayloadValue::Text(s) => query.bind(s),
            PayloadValue::Blob(b) => query.bind(b),
            PayloadValue::Integer(i) => query.bind(i),
        }
    }

    pub(crate) fn from_row(
        row: &SqliteRow,
        column: &str,
        column_type: ColumnType,
    ) -> sqlx::Result<Self> {
        Ok(match column_type {
            ColumnType::Text => PayloadValue::Text(row.try_get(column)?),
            ColumnType::Blob => PayloadValue::Blob(row.try_get(column)?),
            ColumnType::Integer => PayloadValue::Integer(row.try_get(column)?),
        })
    }

    fn shape_name(&self) -> &'static str {
        match self {
            PayloadValue::Text(_) => "text",
            PayloadValue::Blob(_) => "blob",
            PayloadValue::Integer(_) => "integer",
        }
    }
}

/// Serialize/deserialize pair plus the column type it maps to.
pub trait PayloadCodec: Send + Sync {
    type Value: Send + Sync;

    fn column_type(&self) -> ColumnType;
    fn encode(&self, value: &Self::Value) -> Result<PayloadValue>;
    fn decode(&self, raw: PayloadValue) -> Result<Self::Value>;
}

fn shape_mismatch(expected: ColumnType, got: &PayloadValue) -> Error {
    Error::Config(format!(
        "payload shape mismatch: queue expects {expected:?}, stored value is {}",
        got.shape_name()
    ))
}

/// JSON documents of type `T`, stored as TEXT.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    pub fn new() -> Self {
        Json(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Json<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Copy for Json<T> {}

impl<T> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Json")
    }
}

impl<T> PayloadCodec for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    type Value = T;

    fn column_type(&self) -> ColumnType {
        ColumnType::Text
    }

    fn encode(&self, value: &T) -> Result<PayloadValue> {
        Ok(PayloadValue::Text(serde_json::to_string(value)?))
    }

    fn decode(&self, raw: PayloadValue) -> Result<T> {
        match raw {
            PayloadValue::Text(s) => Ok(serde_json::from_str(&s)?),
            other => Err(shape_mismatch(ColumnType::Text, &other)),
        }
    }
}

/// Plain strings, stored as TEXT.
#[derive(Debug, Clone, Copy, Default)]
pub struct Text;

impl PayloadCodec for Text {
    type Value = String;

    fn column_type(&self) -> ColumnType {
        ColumnType::Text
    }

    fn encode(&self, value: &String) -> Result<PayloadValue> {
        Ok(PayloadValue::Text(value.clone()))
    }

    fn decode(&self, raw: PayloadValue) -> Result<String> {
        match raw {
            PayloadValue::Text(s) => Ok(s),
            other => Err(shape_mismatch(ColumnType::Text, &other)),
        }
    }
}

/// Raw byte payloads, stored as BLOB. The most serialization-agnostic
/// shape; pick it unless something outside the engine needs to read the
/// column.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bytes;

impl PayloadCodec for Bytes {
    type Value = Vec<u8>;

    fn column_type(&self) -> ColumnType {
        ColumnType::Blob
    }

    fn encode(&self, value: &Vec<u8>) -> Result<PayloadValue> {
        Ok(PayloadValue::Blob(value.clone()))
    }

    fn decode(&self, raw: PayloadValue) -> Result<Vec<u8>> {
        match raw {
            PayloadValue::Blob(b) => Ok(b),
            other => Err(shape_mismatch(ColumnType::Blob, &other)),
        }
    }
}

/// 64-bit integer payloads, stored as INTEGER.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int;

impl PayloadCodec for Int {
    type Value = i64;

    fn column_type(&self) -> ColumnType {
        ColumnType::Integer
    }

    fn encode(&self, value: &i64) -> Result<PayloadValue> {
        Ok(PayloadValue::Integer(*value))
    }

    fn decode(&self, raw: PayloadValue) -> Result<i64> {
        match raw {
            PayloadValue::Integer(i) => Ok(i),
            other => Err(shape_mismatch(ColumnType::Integer, &other)),
        }
    }
}

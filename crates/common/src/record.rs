use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Normalized primary key of a fetched entity. REST resources carry numeric
/// ids, GraphQL resources carry `gid://` strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(id) => write!(f, "{id}"),
            RecordKey::Text(id) => write!(f, "{id}"),
        }
    }
}

/// One fetched entity instance: normalized key and updated-at plus the raw
/// payload. Held only between fetch and write.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: RecordKey,
    pub updated_at: DateTime<Utc>,
    pub payload: Value,
}

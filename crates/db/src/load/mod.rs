pub mod schema;
pub mod writer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("schema conflict on {table}.{column}: {existing} vs {incoming}")]
    SchemaConflict {
        table: String,
        column: String,
        existing: String,
        incoming: String,
    },

    #[error("destination unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

impl LoadError {
    /// Connection-level failures abort the whole invocation; statement-level
    /// failures abort only the current chunk.
    pub(crate) fn from_sqlx(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_) => LoadError::Unavailable(e.to_string()),
            other => LoadError::Database(other.to_string()),
        }
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cursor::models::ResourceCursor;
use shopsync_common::error::ShopsyncResult;

/// Durable per-resource position store.
///
/// `advance` is conditional so overlapping invocations cannot race the
/// watermark backward or double-advance; there is deliberately no lock
/// operation here.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Get or create the cursor for a given shop+resource pair.
    async fn get_or_create(&self, shop: &str, resource: &str) -> ShopsyncResult<ResourceCursor>;

    /// Transition `not_started -> backfilling`, pinning the overall start of
    /// the backfill. Idempotent: returns the current row if already past
    /// `not_started`.
    async fn begin_backfill(
        &self,
        id: Uuid,
        overall_start: DateTime<Utc>,
    ) -> ShopsyncResult<ResourceCursor>;

    /// Move the watermark forward, but only if the stored value still equals
    /// `expected` and the move is not backward. Returns `false` when another
    /// writer got there first; the caller must stop advancing this resource.
    async fn advance(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        new_watermark: DateTime<Utc>,
    ) -> ShopsyncResult<bool>;

    /// Transition `backfilling -> steady`. Idempotent after the first call.
    async fn complete_backfill(&self, id: Uuid) -> ShopsyncResult<ResourceCursor>;

    /// Record an operator-visible failure on the cursor row. Never touches
    /// the watermark.
    async fn mark_failed(&self, id: Uuid, error_message: &str) -> ShopsyncResult<()>;
}

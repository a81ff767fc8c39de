use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::cursor::models::{ResourceCursor, SyncState};
use crate::cursor::repositories::CursorStore;
use shopsync_common::error::{ShopsyncError, ShopsyncResult};

const CURSOR_COLUMNS: &str =
    "id, shop, resource, state, watermark, backfill_start, error_message, created_at, updated_at";

#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the cursor table if it does not exist yet. Called once at
    /// startup; all other operations assume the table is present.
    pub async fn ensure_table(&self) -> ShopsyncResult<()> {
        sqlx::query(
            "create table if not exists resource_cursors (
               id uuid primary key,
               shop text not null,
               resource text not null,
               state text not null default 'not_started',
               watermark timestamptz,
               backfill_start timestamptz,
               error_message text,
               created_at timestamptz not null default now(),
               updated_at timestamptz not null default now(),
               unique (shop, resource)
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ShopsyncError::Database(e.to_string()))?;

        Ok(())
    }

    fn map_row(row: sqlx::postgres::PgRow) -> ShopsyncResult<ResourceCursor> {
        let state_raw: String = row.get("state");
        let state = SyncState::from_str(&state_raw).map_err(ShopsyncError::Internal)?;

        Ok(ResourceCursor {
            id: row.get("id"),
            shop: row.get("shop"),
            resource: row.get("resource"),
            state,
            watermark: row.get("watermark"),
            backfill_start: row.get("backfill_start"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn fetch_by_id(&self, id: Uuid) -> ShopsyncResult<ResourceCursor> {
        let row = sqlx::query(&format!(
            "select {CURSOR_COLUMNS} from resource_cursors where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ShopsyncError::Database(e.to_string()))?
        .ok_or_else(|| ShopsyncError::NotFound(format!("cursor {id}")))?;

        Self::map_row(row)
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn get_or_create(&self, shop: &str, resource: &str) -> ShopsyncResult<ResourceCursor> {
        let row = sqlx::query(&format!(
            "insert into resource_cursors (id, shop, resource)
             values ($1, $2, $3)
             on conflict (shop, resource) do update set updated_at = now()
             returning {CURSOR_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(shop)
        .bind(resource)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ShopsyncError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn begin_backfill(
        &self,
        id: Uuid,
        overall_start: DateTime<Utc>,
    ) -> ShopsyncResult<ResourceCursor> {
        let row = sqlx::query(&format!(
            "update resource_cursors
             set state = 'backfilling', backfill_start = $1, error_message = null, updated_at = now()
             where id = $2 and state = 'not_started'
             returning {CURSOR_COLUMNS}"
        ))
        .bind(overall_start)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ShopsyncError::Database(e.to_string()))?;

        match row {
            Some(r) => Self::map_row(r),
            // Already backfilling or steady; hand back the current row.
            None => self.fetch_by_id(id).await,
        }
    }

    async fn advance(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        new_watermark: DateTime<Utc>,
    ) -> ShopsyncResult<bool> {
        let result = sqlx::query(
            "update resource_cursors
             set watermark = $1, error_message = null, updated_at = now()
             where id = $2
               and watermark is not distinct from $3
               and (watermark is null or watermark <= $1)",
        )
        .bind(new_watermark)
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(|e| ShopsyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_backfill(&self, id: Uuid) -> ShopsyncResult<ResourceCursor> {
        let row = sqlx::query(&format!(
            "update resource_cursors
             set state = 'steady', updated_at = now()
             where id = $1 and state = 'backfilling'
             returning {CURSOR_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ShopsyncError::Database(e.to_string()))?;

        match row {
            Some(r) => Self::map_row(r),
            None => self.fetch_by_id(id).await,
        }
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> ShopsyncResult<()> {
        sqlx::query(
            "update resource_cursors
             set error_message = $1, updated_at = now()
             where id = $2",
        )
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| ShopsyncError::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;
    use chrono::TimeZone;

    async fn test_store() -> Option<(PgCursorStore, PgPool)> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.expect("db should connect");

        let store = PgCursorStore::new(pool.clone());
        store.ensure_table().await.ok()?;

        Some((store, pool))
    }

    fn ts(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn get_or_create_inserts_new() {
        let (store, _pool) = match test_store().await {
            Some(s) => s,
            None => return,
        };
        let shop = format!("shop-{}", Uuid::new_v4());
        let cursor = store
            .get_or_create(&shop, "orders")
            .await
            .expect("should work");
        assert_eq!(cursor.shop, shop);
        assert_eq!(cursor.resource, "orders");
        assert_eq!(cursor.state, SyncState::NotStarted);
        assert!(cursor.watermark.is_none());
    }

    #[tokio::test]
    async fn get_or_create_returns_existing() {
        let (store, _pool) = match test_store().await {
            Some(s) => s,
            None => return,
        };
        let shop = format!("shop-{}", Uuid::new_v4());
        let first = store.get_or_create(&shop, "orders").await.expect("first");
        let second = store.get_or_create(&shop, "orders").await.expect("second");
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn begin_backfill_transitions_once() {
        let (store, _pool) = match test_store().await {
            Some(s) => s,
            None => return,
        };
        let shop = format!("shop-{}", Uuid::new_v4());
        let cursor = store.get_or_create(&shop, "orders").await.expect("create");

        let started = store
            .begin_backfill(cursor.id, ts(2024, 1, 1))
            .await
            .expect("begin");
        assert_eq!(started.state, SyncState::Backfilling);
        assert_eq!(started.backfill_start, Some(ts(2024, 1, 1)));

        // Second call must not reset the pinned start.
        let again = store
            .begin_backfill(cursor.id, ts(2025, 6, 1))
            .await
            .expect("begin again");
        assert_eq!(again.state, SyncState::Backfilling);
        assert_eq!(again.backfill_start, Some(ts(2024, 1, 1)));
    }

    #[tokio::test]
    async fn advance_succeeds_when_expected_matches() {
        let (store, _pool) = match test_store().await {
            Some(s) => s,
            None => return,
        };
        let shop = format!("shop-{}", Uuid::new_v4());
        let cursor = store.get_or_create(&shop, "orders").await.expect("create");

        let moved = store
            .advance(cursor.id, None, ts(2024, 1, 8))
            .await
            .expect("advance");
        assert!(moved);

        let moved = store
            .advance(cursor.id, Some(ts(2024, 1, 8)), ts(2024, 1, 15))
            .await
            .expect("advance");
        assert!(moved);
    }

    #[tokio::test]
    async fn advance_fails_on_stale_expected() {
        let (store, _pool) = match test_store().await {
            Some(s) => s,
            None => return,
        };
        let shop = format!("shop-{}", Uuid::new_v4());
        let cursor = store.get_or_create(&shop, "orders").await.expect("create");

        assert!(store
            .advance(cursor.id, None, ts(2024, 1, 8))
            .await
            .expect("advance"));

        // A second writer that still believes the watermark is unset loses.
        let moved = store
            .advance(cursor.id, None, ts(2024, 1, 15))
            .await
            .expect("advance");
        assert!(!moved);

        let current = store.get_or_create(&shop, "orders").await.expect("read");
        assert_eq!(current.watermark, Some(ts(2024, 1, 8)));
    }

    #[tokio::test]
    async fn advance_never_moves_backward() {
        let (store, _pool) = match test_store().await {
            Some(s) => s,
            None => return,
        };
        let shop = format!("shop-{}", Uuid::new_v4());
        let cursor = store.get_or_create(&shop, "orders").await.expect("create");

        assert!(store
            .advance(cursor.id, None, ts(2024, 2, 1))
            .await
            .expect("advance"));

        let moved = store
            .advance(cursor.id, Some(ts(2024, 2, 1)), ts(2024, 1, 1))
            .await
            .expect("advance");
        assert!(!moved);

        let current = store.get_or_create(&shop, "orders").await.expect("read");
        assert_eq!(current.watermark, Some(ts(2024, 2, 1)));
    }

    #[tokio::test]
    async fn complete_backfill_is_idempotent() {
        let (store, _pool) = match test_store().await {
            Some(s) => s,
            None => return,
        };
        let shop = format!("shop-{}", Uuid::new_v4());
        let cursor = store.get_or_create(&shop, "orders").await.expect("create");
        store
            .begin_backfill(cursor.id, ts(2024, 1, 1))
            .await
            .expect("begin");

        let done = store.complete_backfill(cursor.id).await.expect("complete");
        assert_eq!(done.state, SyncState::Steady);

        let again = store.complete_backfill(cursor.id).await.expect("again");
        assert_eq!(again.state, SyncState::Steady);
    }

    #[tokio::test]
    async fn mark_failed_sets_error_and_keeps_watermark() {
        let (store, _pool) = match test_store().await {
            Some(s) => s,
            None => return,
        };
        let shop = format!("shop-{}", Uuid::new_v4());
        let cursor = store.get_or_create(&shop, "orders").await.expect("create");
        assert!(store
            .advance(cursor.id, None, ts(2024, 3, 1))
            .await
            .expect("advance"));

        store
            .mark_failed(cursor.id, "missing access scope read_orders")
            .await
            .expect("mark failed");

        let current = store.get_or_create(&shop, "orders").await.expect("read");
        assert_eq!(
            current.error_message.as_deref(),
            Some("missing access scope read_orders")
        );
        assert_eq!(current.watermark, Some(ts(2024, 3, 1)));
    }
}

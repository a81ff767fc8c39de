use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

use shopsync_common::error::{ShopsyncError, ShopsyncResult};
use shopsync_db::cursor::models::SyncState;
use shopsync_db::cursor::repositories::CursorStore;
use shopsync_db::load::schema::infer_fields;
use shopsync_db::load::writer::Destination;
use shopsync_db::load::LoadError;

use crate::catalog::{self, Resource};
use crate::chunks;
use crate::report::{ResourceFailure, ResourceOutcome, RunReport};
use crate::shopify::{FetchError, ShopifyClient};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub backfill_start: Option<DateTime<Utc>>,
    pub chunk_width_days: i64,
    pub max_chunks_per_run: u32,
}

impl PipelineOptions {
    pub fn from_env() -> Result<Self, String> {
        let backfill_start = match std::env::var("BACKFILL_START_DATE").ok() {
            Some(raw) => Some(parse_start_date(&raw)?),
            None => None,
        };
        let chunk_width_days = std::env::var("CHUNK_WIDTH_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7);
        if chunk_width_days < 1 {
            return Err("CHUNK_WIDTH_DAYS must be at least 1".to_string());
        }
        let max_chunks_per_run = std::env::var("MAX_CHUNKS_PER_RUN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(64);

        Ok(Self {
            backfill_start,
            chunk_width_days,
            max_chunks_per_run,
        })
    }
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
pub fn parse_start_date(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .map_err(|e| format!("invalid date '{raw}': {e}"))
}

/// Drives resources through `not_started -> backfilling -> steady`,
/// delegating fetches to the client, writes to the destination, and
/// position-keeping to the cursor store. Resources fail independently; only
/// an unavailable destination aborts the invocation.
pub struct Pipeline<C, D> {
    shop: String,
    client: ShopifyClient,
    cursors: C,
    destination: D,
    options: PipelineOptions,
}

impl<C, D> Pipeline<C, D>
where
    C: CursorStore,
    D: Destination,
{
    pub fn new(
        shop: &str,
        client: ShopifyClient,
        cursors: C,
        destination: D,
        options: PipelineOptions,
    ) -> Self {
        Self {
            shop: shop.to_string(),
            client,
            cursors,
            destination,
            options,
        }
    }

    /// Entry point one: chunked historical backfill per resource, oldest
    /// chunk first, switching each resource to steady state (plus one
    /// incremental pull) once its history is drained. Safe to re-invoke; a
    /// partially backfilled resource resumes at its watermark.
    pub async fn run_backfill_then_incremental(
        &self,
        resources: &[Resource],
    ) -> ShopsyncResult<RunReport> {
        let overall_start = self.options.backfill_start.ok_or_else(|| {
            ShopsyncError::Config("BACKFILL_START_DATE is required for a backfill run".to_string())
        })?;

        let mut report = RunReport::new();
        for resource in resources {
            if report.aborted {
                let mut outcome = ResourceOutcome::new(resource.name);
                outcome.failure = Some(ResourceFailure::Skipped(
                    "invocation aborted: destination unavailable".to_string(),
                ));
                report.push(outcome);
                continue;
            }

            let outcome = self.backfill_resource(resource, overall_start).await;
            if matches!(
                outcome.failure,
                Some(ResourceFailure::DestinationUnavailable(_))
            ) {
                report.aborted = true;
            }
            report.push(outcome);
        }

        report.finish();
        report.log();
        Ok(report)
    }

    /// Entry point two: one incremental window per named resource, from its
    /// watermark (or an explicit start) to now. Resources still backfilling
    /// are reported, not processed.
    pub async fn run_incremental(
        &self,
        names: &[String],
        start_override: Option<DateTime<Utc>>,
    ) -> ShopsyncResult<RunReport> {
        let mut report = RunReport::new();
        for name in names {
            if report.aborted {
                let mut outcome = ResourceOutcome::new(name);
                outcome.failure = Some(ResourceFailure::Skipped(
                    "invocation aborted: destination unavailable".to_string(),
                ));
                report.push(outcome);
                continue;
            }

            let outcome = self.incremental_resource(name, start_override).await;
            if matches!(
                outcome.failure,
                Some(ResourceFailure::DestinationUnavailable(_))
            ) {
                report.aborted = true;
            }
            report.push(outcome);
        }

        report.finish();
        report.log();
        Ok(report)
    }

    async fn backfill_resource(
        &self,
        resource: &Resource,
        overall_start: DateTime<Utc>,
    ) -> ResourceOutcome {
        let mut outcome = ResourceOutcome::new(resource.name);

        if !self.client.is_configured(resource) {
            outcome.failure = Some(ResourceFailure::Skipped(format!(
                "{} is not configured",
                resource.name
            )));
            return outcome;
        }

        let cursor = match self.cursors.get_or_create(&self.shop, resource.name).await {
            Ok(c) => c,
            Err(e) => {
                outcome.failure = Some(ResourceFailure::Load(e.to_string()));
                return outcome;
            }
        };

        let cursor = if cursor.state == SyncState::NotStarted {
            match self.cursors.begin_backfill(cursor.id, overall_start).await {
                Ok(c) => c,
                Err(e) => {
                    outcome.failure = Some(ResourceFailure::Load(e.to_string()));
                    return outcome;
                }
            }
        } else {
            cursor
        };

        outcome.state = Some(cursor.state);
        let mut watermark = cursor.watermark;

        if cursor.state == SyncState::Backfilling {
            let grid_start = cursor.backfill_start.unwrap_or(overall_start);
            let width = Duration::days(self.options.chunk_width_days);
            let mut processed: u32 = 0;
            let mut rounds: u32 = 0;

            loop {
                let pending = chunks::plan(grid_start, Utc::now(), width, watermark);
                if pending.is_empty() {
                    break;
                }

                for chunk in pending {
                    if processed >= self.options.max_chunks_per_run {
                        tracing::info!(
                            resource = resource.name,
                            processed,
                            "per-run chunk limit reached, resuming next run"
                        );
                        return outcome;
                    }

                    tracing::info!(
                        resource = resource.name,
                        index = chunk.index,
                        start = %chunk.start,
                        end = %chunk.end,
                        "processing chunk"
                    );

                    let count = match self.load_window(resource, chunk.start, chunk.end).await {
                        Ok(count) => count,
                        Err(failure) => {
                            self.record_failure(cursor.id, &failure).await;
                            outcome.failure = Some(failure);
                            return outcome;
                        }
                    };

                    match self.cursors.advance(cursor.id, watermark, chunk.end).await {
                        Ok(true) => {
                            watermark = Some(chunk.end);
                            outcome.records_loaded += count;
                            outcome.chunks_completed += 1;
                            processed += 1;
                        }
                        Ok(false) => {
                            outcome.failure = Some(ResourceFailure::Skipped(
                                "another run advanced the cursor".to_string(),
                            ));
                            return outcome;
                        }
                        Err(e) => {
                            outcome.failure = Some(ResourceFailure::Load(e.to_string()));
                            return outcome;
                        }
                    }
                }

                // Re-plan once with a fresh `now`, so records created while
                // the backfill ran get a catch-up chunk before the steady
                // transition.
                rounds += 1;
                if rounds >= 2 {
                    break;
                }
            }

            match self.cursors.complete_backfill(cursor.id).await {
                Ok(c) => outcome.state = Some(c.state),
                Err(e) => {
                    outcome.failure = Some(ResourceFailure::Load(e.to_string()));
                    return outcome;
                }
            }
        }

        if outcome.state == Some(SyncState::Steady) {
            let start = watermark.unwrap_or(overall_start);
            let now = Utc::now();
            if start < now {
                match self.load_window(resource, start, now).await {
                    Ok(count) => match self.cursors.advance(cursor.id, watermark, now).await {
                        Ok(true) => outcome.records_loaded += count,
                        Ok(false) => {
                            outcome.failure = Some(ResourceFailure::Skipped(
                                "another run advanced the cursor".to_string(),
                            ));
                        }
                        Err(e) => {
                            outcome.failure = Some(ResourceFailure::Load(e.to_string()));
                        }
                    },
                    Err(failure) => {
                        self.record_failure(cursor.id, &failure).await;
                        outcome.failure = Some(failure);
                    }
                }
            }
        }

        outcome
    }

    async fn incremental_resource(
        &self,
        name: &str,
        start_override: Option<DateTime<Utc>>,
    ) -> ResourceOutcome {
        let mut outcome = ResourceOutcome::new(name);

        let Some(resource) = catalog::find(name) else {
            outcome.failure = Some(ResourceFailure::Skipped(format!(
                "unknown resource '{name}'"
            )));
            return outcome;
        };

        if !self.client.is_configured(resource) {
            outcome.failure = Some(ResourceFailure::Skipped(format!(
                "{} is not configured",
                resource.name
            )));
            return outcome;
        }

        let cursor = match self.cursors.get_or_create(&self.shop, resource.name).await {
            Ok(c) => c,
            Err(e) => {
                outcome.failure = Some(ResourceFailure::Load(e.to_string()));
                return outcome;
            }
        };
        outcome.state = Some(cursor.state);

        let start = match (cursor.state, start_override, cursor.watermark) {
            (SyncState::Steady, Some(s), _) => s,
            (SyncState::Steady, None, Some(w)) => w,
            (SyncState::Steady, None, None) => {
                outcome.failure = Some(ResourceFailure::Skipped(
                    "steady cursor has no watermark; pass --start-date".to_string(),
                ));
                return outcome;
            }
            // An explicit start point is allowed regardless of state.
            (_, Some(s), _) => s,
            (state, None, _) => {
                outcome.failure = Some(ResourceFailure::Skipped(format!(
                    "resource is {}; run the backfill first or pass --start-date",
                    state.as_str()
                )));
                return outcome;
            }
        };

        let now = Utc::now();
        if start >= now {
            return outcome;
        }

        tracing::info!(resource = resource.name, start = %start, end = %now, "incremental window");

        match self.load_window(resource, start, now).await {
            Ok(count) => match self.cursors.advance(cursor.id, cursor.watermark, now).await {
                Ok(true) => outcome.records_loaded += count,
                Ok(false) => {
                    outcome.failure = Some(ResourceFailure::Skipped(
                        "another run advanced the cursor".to_string(),
                    ));
                }
                Err(e) => {
                    outcome.failure = Some(ResourceFailure::Load(e.to_string()));
                }
            },
            Err(failure) => {
                self.record_failure(cursor.id, &failure).await;
                outcome.failure = Some(failure);
            }
        }

        outcome
    }

    /// Fetch one window and land it: infer fields, reconcile the schema,
    /// upsert in a single transaction. The cursor is the caller's concern.
    async fn load_window(
        &self,
        resource: &Resource,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, ResourceFailure> {
        let records = self
            .client
            .fetch_window(resource, start, end)
            .await
            .map_err(fetch_failure)?;

        if records.is_empty() {
            return Ok(0);
        }

        let fields = infer_fields(resource.table, resource.key_field, resource.key_type, &records)
            .map_err(load_failure)?;

        self.destination
            .ensure_schema(resource.table, resource.key_field, &fields)
            .await
            .map_err(load_failure)?;

        let count = self
            .destination
            .upsert(resource.table, resource.key_field, &fields, &records)
            .await
            .map_err(load_failure)?;

        tracing::debug!(resource = resource.name, count, "window committed");
        Ok(count)
    }

    async fn record_failure(&self, cursor_id: Uuid, failure: &ResourceFailure) {
        // No point writing to a destination that just went away.
        if matches!(failure, ResourceFailure::DestinationUnavailable(_)) {
            return;
        }
        if let Err(e) = self.cursors.mark_failed(cursor_id, &failure.to_string()).await {
            tracing::warn!(error = %e, "failed to record failure on cursor");
        }
    }
}

fn fetch_failure(e: FetchError) -> ResourceFailure {
    match e {
        FetchError::MissingScope { scope, .. } => ResourceFailure::MissingScope { scope },
        other => ResourceFailure::Fetch(other.to_string()),
    }
}

fn load_failure(e: LoadError) -> ResourceFailure {
    match e {
        LoadError::SchemaConflict { .. } => ResourceFailure::SchemaConflict(e.to_string()),
        LoadError::Unavailable(msg) => ResourceFailure::DestinationUnavailable(msg),
        LoadError::Database(msg) => ResourceFailure::Load(msg),
    }
}

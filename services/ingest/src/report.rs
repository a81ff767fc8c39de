use chrono::{DateTime, Utc};
use shopsync_db::cursor::models::SyncState;

/// Why a resource made no (further) progress this run.
#[derive(Debug, thiserror::Error)]
pub enum ResourceFailure {
    #[error("missing access scope {scope}")]
    MissingScope { scope: String },

    #[error("{0}")]
    SchemaConflict(String),

    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("skipped: {0}")]
    Skipped(String),
}

#[derive(Debug)]
pub struct ResourceOutcome {
    pub resource: String,
    pub records_loaded: u64,
    pub chunks_completed: u32,
    pub state: Option<SyncState>,
    pub failure: Option<ResourceFailure>,
}

impl ResourceOutcome {
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            records_loaded: 0,
            chunks_completed: 0,
            state: None,
            failure: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Aggregate outcome of one invocation. Surfaced through the log, never
/// persisted.
#[derive(Debug)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub aborted: bool,
    pub resources: Vec<ResourceOutcome>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            aborted: false,
            resources: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: ResourceOutcome) {
        self.resources.push(outcome);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn total_records(&self) -> u64 {
        self.resources.iter().map(|r| r.records_loaded).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.resources.iter().filter(|r| !r.succeeded()).count()
    }

    pub fn log(&self) {
        for outcome in &self.resources {
            match &outcome.failure {
                None => tracing::info!(
                    resource = %outcome.resource,
                    records = outcome.records_loaded,
                    chunks = outcome.chunks_completed,
                    state = outcome.state.map(|s| s.as_str()),
                    "resource completed"
                ),
                Some(failure) => tracing::error!(
                    resource = %outcome.resource,
                    records = outcome.records_loaded,
                    chunks = outcome.chunks_completed,
                    error = %failure,
                    "resource failed"
                ),
            }
        }
        tracing::info!(
            total_records = self.total_records(),
            failed = self.failed_count(),
            aborted = self.aborted,
            "run finished"
        );
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_span_resources() {
        let mut report = RunReport::new();

        let mut ok = ResourceOutcome::new("orders");
        ok.records_loaded = 10;
        ok.chunks_completed = 2;
        report.push(ok);

        let mut failed = ResourceOutcome::new("inventory_levels");
        failed.failure = Some(ResourceFailure::MissingScope {
            scope: "read_inventory".into(),
        });
        report.push(failed);

        report.finish();

        assert_eq!(report.total_records(), 10);
        assert_eq!(report.failed_count(), 1);
        assert!(report.finished_at.is_some());
        assert!(!report.aborted);
    }
}

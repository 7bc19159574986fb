use std::sync::Arc;
use chrono::Utc;
use crate::error::Result;
use crate::interfaces::PriceStore;
use crate::observability::metrics::JOB_RUNS;
use crate::types::{JobRun, JobStatus};

/// Records one row per batch invocation. Finishing a run never fails the caller:
/// bookkeeping errors are logged and swallowed.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn PriceStore>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn PriceStore>) -> Self {
        JobTracker { store }
    }

    pub async fn start(&self, job_type: &str) -> Result<JobRun> {
        let run = self.store.create_job_run(job_type, Utc::now()).await?;
        JOB_RUNS.with_label_values(&[job_type, JobStatus::Running.as_str()]).inc();
        tracing::info!(job_id = run.id, job_type, "job started");
        Ok(run)
    }

    pub async fn complete(&self, mut run: JobRun, processed: usize, total: usize) -> JobRun {
        run.status = JobStatus::Completed;
        run.finished_at = Some(Utc::now());
        run.symbols_processed = Some(processed as i64);
        run.symbols_total = Some(total as i64);
        self.finish(&run).await;
        tracing::info!(job_id = run.id, job_type = %run.job_type, processed, total, "job completed");
        run
    }

    pub async fn fail(&self, mut run: JobRun, error: &str) -> JobRun {
        run.status = JobStatus::Failed;
        run.finished_at = Some(Utc::now());
        run.error_message = Some(error.to_string());
        self.finish(&run).await;
        tracing::error!(job_id = run.id, job_type = %run.job_type, error, "job failed");
        run
    }

    async fn finish(&self, run: &JobRun) {
        JOB_RUNS.with_label_values(&[run.job_type.as_str(), run.status.as_str()]).inc();
        if let Err(e) = self.store.finish_job_run(run).await {
            tracing::error!(job_id = run.id, job_type = %run.job_type, error = %e, "failed to record job outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;

    #[tokio::test]
    async fn lifecycle_is_persisted() {
        let store: Arc<dyn PriceStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let tracker = JobTracker::new(store.clone());

        let run = tracker.start("metrics_crypto").await.unwrap();
        assert_eq!(run.status, JobStatus::Running);
        tracker.complete(run, 2, 3).await;

        let failed = tracker.start("metrics_crypto").await.unwrap();
        tracker.fail(failed, "database went away").await;

        let runs = store.job_runs("metrics_crypto").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, JobStatus::Completed);
        assert_eq!(runs[0].symbols_processed, Some(2));
        assert_eq!(runs[0].symbols_total, Some(3));
        assert!(runs[0].finished_at.is_some());
        assert_eq!(runs[1].status, JobStatus::Failed);
        assert_eq!(runs[1].error_message.as_deref(), Some("database went away"));
    }
}

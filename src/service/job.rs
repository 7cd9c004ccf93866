use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::model::Job;
use crate::scratch::ScratchStore;
use crate::store::JobStore;

/// State shared by both pipeline stages: the store, the scratch directory
/// and the retry policy.
pub(crate) struct StageContext {
    pub store: Arc<dyn JobStore>,
    pub scratch: ScratchStore,
    pub cancel: CancellationToken,
    pub max_retry: i32,
}

impl StageContext {
    /// Routes a failed lease: below the retry budget the row goes back to
    /// idle with the error recorded; at the budget the job is dropped for
    /// good, scratch file included.
    pub async fn fail_job(&self, job: &Job, err: anyhow::Error) {
        error!(
            job_id = job.id,
            job_type = %job.kind,
            attempt = job.retry,
            "job failed: {:#}",
            err
        );
        if job.retry >= self.max_retry {
            error!(job_id = job.id, "max attempts reached, dropping job");
            self.cleanup(job).await;
            return;
        }
        if let Err(err) = self.store.set_error(job.id, &format!("{:#}", err)).await {
            error!(job_id = job.id, "failed to record job error: {}", err);
        }
    }

    /// Terminal removal. The scratch file goes before the row so a crash in
    /// between cannot leave orphan bytes behind a deleted job.
    pub async fn cleanup(&self, job: &Job) {
        if let Err(err) = self.scratch.delete(&job.file) {
            error!(job_id = job.id, "failed to delete scratch file: {}", err);
        }
        if let Err(err) = self.store.delete(job.id).await {
            error!(job_id = job.id, "failed to delete job: {}", err);
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use crate::model::{FileDescriptor, Job, JobConfig, JobState};
    use crate::store::JobStore;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RowState {
        Idle,
        Active,
    }

    #[derive(Debug, Clone)]
    pub struct Row {
        pub id: i64,
        pub kind: String,
        pub file: FileDescriptor,
        pub retry: i32,
        pub error: Option<String>,
        pub state: RowState,
    }

    /// In-memory stand-in for the SQL store, with the same lease semantics.
    #[derive(Default)]
    pub struct MemJobStore {
        pub rows: Mutex<Vec<Row>>,
        pub fail_set_error: Mutex<bool>,
    }

    impl MemJobStore {
        pub fn row(&self, id: i64) -> Option<Row> {
            self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned()
        }

        pub fn insert(&self, kind: &str, file: FileDescriptor) -> i64 {
            let mut rows = self.rows.lock().unwrap();
            let id = rows.iter().map(|r| r.id).max().unwrap_or(0) + 1;
            rows.push(Row {
                id,
                kind: kind.to_string(),
                file,
                retry: 0,
                error: None,
                state: RowState::Idle,
            });
            id
        }
    }

    #[async_trait]
    impl JobStore for MemJobStore {
        async fn create(
            &self,
            kind: &str,
            _config: &JobConfig,
            file: &FileDescriptor,
        ) -> Result<()> {
            self.insert(kind, file.clone());
            Ok(())
        }

        async fn update(&self, state: JobState, job: &Job) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .iter_mut()
                .find(|r| r.id == job.id)
                .ok_or_else(|| anyhow!("no row {}", job.id))?;
            row.kind = job.kind.clone();
            row.file = job.file.clone();
            row.retry = job.retry;
            row.error = None;
            row.state = match state {
                JobState::Idle => RowState::Idle,
                JobState::Active => RowState::Active,
            };
            Ok(())
        }

        async fn set_error(&self, id: i64, err: &str) -> Result<()> {
            if *self.fail_set_error.lock().unwrap() {
                return Err(anyhow!("store unavailable"));
            }
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| anyhow!("no row {}", id))?;
            row.error = Some(err.to_string());
            row.state = RowState::Idle;
            Ok(())
        }

        async fn fetch(&self, limit: i64, kind: &str) -> Result<Vec<Job>> {
            let mut rows = self.rows.lock().unwrap();
            let mut leased = Vec::new();
            for row in rows.iter_mut() {
                if leased.len() as i64 >= limit {
                    break;
                }
                if row.state == RowState::Idle && row.kind == kind {
                    row.state = RowState::Active;
                    row.retry += 1;
                    leased.push(Job {
                        id: row.id,
                        kind: row.kind.clone(),
                        file: row.file.clone(),
                        config: JobConfig::default(),
                        // Pre-increment value, same as the SQL statement.
                        retry: row.retry - 1,
                    });
                }
            }
            Ok(leased)
        }

        async fn delete(&self, id: i64) -> Result<()> {
            self.rows.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{MemJobStore, RowState};
    use super::*;
    use crate::model::{FileDescriptor, JOB_TYPE_TRANSCODING};
    use std::io::Write;
    use tempfile::TempDir;

    fn context(store: Arc<MemJobStore>, scratch: &TempDir, max_retry: i32) -> StageContext {
        StageContext {
            store,
            scratch: ScratchStore::new(scratch.path()).unwrap(),
            cancel: CancellationToken::new(),
            max_retry,
        }
    }

    fn scratch_file(ctx: &StageContext) -> FileDescriptor {
        let mut file = FileDescriptor::default();
        let mut writer = ctx.scratch.new_writer(&mut file, "raw").unwrap();
        writer.write_all(b"payload").unwrap();
        file
    }

    #[tokio::test]
    async fn failure_below_budget_returns_job_to_idle() {
        let store = Arc::new(MemJobStore::default());
        let tmp = TempDir::new().unwrap();
        let ctx = context(store.clone(), &tmp, 3);

        let file = scratch_file(&ctx);
        let id = store.insert(JOB_TYPE_TRANSCODING, file.clone());
        let mut jobs = store.fetch(1, JOB_TYPE_TRANSCODING).await.unwrap();
        let mut job = jobs.remove(0);
        job.retry += 1;

        ctx.fail_job(&job, anyhow::anyhow!("transcoder crashed")).await;

        let row = store.row(id).unwrap();
        assert_eq!(row.state, RowState::Idle);
        assert!(row.error.as_deref().unwrap().contains("transcoder crashed"));
        // The scratch file survives for the next attempt.
        assert!(std::path::Path::new(&file.path).exists());
    }

    #[tokio::test]
    async fn failure_at_budget_drops_file_then_row() {
        let store = Arc::new(MemJobStore::default());
        let tmp = TempDir::new().unwrap();
        let ctx = context(store.clone(), &tmp, 2);

        let file = scratch_file(&ctx);
        let id = store.insert(JOB_TYPE_TRANSCODING, file.clone());
        let job = crate::model::Job {
            id,
            kind: JOB_TYPE_TRANSCODING.into(),
            file: file.clone(),
            config: Default::default(),
            retry: 2,
        };

        ctx.fail_job(&job, anyhow::anyhow!("still broken")).await;

        assert!(store.row(id).is_none());
        assert!(!std::path::Path::new(&file.path).exists());
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::model::{FileDescriptor, Job, JobConfig, JobState};

/// Persistence contract of the job pipeline. Stages talk to this trait so
/// they can run against an in-memory store in tests.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, kind: &str, config: &JobConfig, file: &FileDescriptor) -> Result<()>;
    /// Rewrites type/file/config/retry/state for an existing row.
    async fn update(&self, state: JobState, job: &Job) -> Result<()>;
    /// Records the error and returns the row to idle, making it re-leasable.
    async fn set_error(&self, id: i64, err: &str) -> Result<()>;
    /// Atomically leases up to `limit` idle rows of the given type owned by
    /// this instance, oldest first.
    async fn fetch(&self, limit: i64, kind: &str) -> Result<Vec<Job>>;
    async fn delete(&self, id: i64) -> Result<()>;
}

pub struct PgJobStore {
    pool: PgPool,
    instance: String,
}

#[derive(FromRow)]
struct JobRow {
    id: i64,
    #[sqlx(rename = "type")]
    kind: String,
    file: Json<FileDescriptor>,
    config: Json<JobConfig>,
    retry: i32,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            kind: row.kind,
            file: row.file.0,
            config: row.config.0,
            retry: row.retry,
        }
    }
}

impl PgJobStore {
    pub async fn connect(dsn: &str, max_connections: u32, instance: String) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await
            .context("connecting to job store")?;
        Ok(Self { pool, instance })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"create table if not exists file_jobs
(
    id          bigserial primary key,
    type        text        not null,
    instance    text        not null,
    state       int         not null default 0,
    file        jsonb       not null,
    config      jsonb       not null default '{}'::jsonb,
    retry       int         not null default 0,
    error       text,
    created_at  timestamptz not null default now(),
    activity_at timestamptz not null default now()
)"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "create index if not exists file_jobs_lease_idx on file_jobs (instance, type, state, created_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reclaims rows left active by a previous run of this instance. Called
    /// once at startup, before any stage starts leasing.
    pub async fn reset(&self) -> Result<()> {
        let result = sqlx::query("update file_jobs set state = $1 where instance = $2")
            .bind(JobState::Idle.as_i32())
            .bind(&self.instance)
            .execute(&self.pool)
            .await
            .context("resetting job store")?;
        debug!(
            instance = %self.instance,
            rows = result.rows_affected(),
            "reclaimed in-flight jobs"
        );
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, kind: &str, config: &JobConfig, file: &FileDescriptor) -> Result<()> {
        sqlx::query(
            "insert into file_jobs (type, instance, file, config) values ($1, $2, $3, $4)",
        )
        .bind(kind)
        .bind(&self.instance)
        .bind(Json(file))
        .bind(Json(config))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, state: JobState, job: &Job) -> Result<()> {
        sqlx::query(
            r#"update file_jobs
set state       = $1,
    type        = $2,
    file        = $3,
    config      = $4,
    error       = null,
    retry       = $5,
    activity_at = now()
where id = $6"#,
        )
        .bind(state.as_i32())
        .bind(&job.kind)
        .bind(Json(&job.file))
        .bind(Json(&job.config))
        .bind(job.retry)
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_error(&self, id: i64, err: &str) -> Result<()> {
        sqlx::query(
            r#"update file_jobs
set error       = $1,
    state       = $2,
    activity_at = now()
where id = $3"#,
        )
        .bind(err)
        .bind(JobState::Idle.as_i32())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(&self, limit: i64, kind: &str) -> Result<Vec<Job>> {
        // Lease in a single statement so no two workers ever hold one row.
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"update file_jobs j
set state       = $1,
    activity_at = now(),
    retry       = j.retry + 1
from (
    select id, type, file, config, retry
    from file_jobs
    where state = $2
      and instance = $3
      and type = $4
    order by created_at
    limit $5
    for update skip locked
) x
where x.id = j.id
returning x.id, x.type, x.file, x.config, x.retry"#,
        )
        .bind(JobState::Active.as_i32())
        .bind(JobState::Idle.as_i32())
        .bind(&self.instance)
        .bind(kind)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("delete from file_jobs where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// Round-trip tests against a real database. Run with
// LIVEREC_TEST_DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JOB_TYPE_TRANSCODING;

    async fn store() -> PgJobStore {
        let dsn = std::env::var("LIVEREC_TEST_DATABASE_URL")
            .expect("LIVEREC_TEST_DATABASE_URL must point at a test database");
        let store = PgJobStore::connect(&dsn, 2, format!("test-{}", crate::model::new_id()))
            .await
            .unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore]
    async fn lease_is_exclusive_per_row() {
        let store = store().await;
        let file = FileDescriptor {
            name: "rec".into(),
            path: "/tmp/rec.raw".into(),
            ..Default::default()
        };
        store
            .create(JOB_TYPE_TRANSCODING, &JobConfig::default(), &file)
            .await
            .unwrap();

        let first = store.fetch(10, JOB_TYPE_TRANSCODING).await.unwrap();
        assert_eq!(first.len(), 1);
        // The row is active now; a second fetch must not see it.
        let second = store.fetch(10, JOB_TYPE_TRANSCODING).await.unwrap();
        assert!(second.is_empty());

        store.delete(first[0].id).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn set_error_makes_row_leasable_again() {
        let store = store().await;
        let file = FileDescriptor::default();
        store
            .create(JOB_TYPE_TRANSCODING, &JobConfig::default(), &file)
            .await
            .unwrap();

        let jobs = store.fetch(1, JOB_TYPE_TRANSCODING).await.unwrap();
        let job = &jobs[0];
        store.set_error(job.id, "boom").await.unwrap();

        let again = store.fetch(1, JOB_TYPE_TRANSCODING).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, job.id);
        // Retry grows monotonically across leases.
        assert!(again[0].retry > job.retry);

        store.delete(job.id).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn reset_returns_active_rows_to_idle() {
        let store = store().await;
        store
            .create(
                JOB_TYPE_TRANSCODING,
                &JobConfig::default(),
                &FileDescriptor::default(),
            )
            .await
            .unwrap();
        let jobs = store.fetch(1, JOB_TYPE_TRANSCODING).await.unwrap();
        assert_eq!(jobs.len(), 1);

        store.reset().await.unwrap();
        let again = store.fetch(1, JOB_TYPE_TRANSCODING).await.unwrap();
        assert_eq!(again.len(), 1);
        store.delete(again[0].id).await.unwrap();
    }
}

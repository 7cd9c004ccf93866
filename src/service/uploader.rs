use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config;
use crate::model::{Job, JOB_TYPE_UPLOAD};
use crate::pool::WorkerPool;
use crate::scratch::ScratchStore;
use crate::service::StageContext;
use crate::storage::{FileStorage, UploadMetadata, UPLOAD_CHUNK_SIZE};
use crate::store::JobStore;

/// Second pipeline stage: leases `upload` jobs and streams the transcoded
/// artifact to the remote file service, metadata frame first.
pub struct Uploader {
    ctx: StageContext,
    pool: WorkerPool,
    storage: FileStorage,
    limit: i64,
}

impl Uploader {
    pub fn new(
        cancel: CancellationToken,
        cfg: &config::Stage,
        store: Arc<dyn JobStore>,
        scratch: ScratchStore,
        storage: FileStorage,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: StageContext {
                store,
                scratch,
                cancel: cancel.clone(),
                max_retry: cfg.max_retry,
            },
            pool: WorkerPool::new(cancel, cfg.workers, cfg.queue),
            storage,
            limit: cfg.fetch_limit(),
        })
    }

    pub fn start(
        cancel: CancellationToken,
        cfg: &config::Stage,
        store: Arc<dyn JobStore>,
        scratch: ScratchStore,
        storage: FileStorage,
    ) -> Arc<Self> {
        let stage = Self::new(cancel, cfg, store, scratch, storage);
        tokio::spawn(stage.clone().listen());
        stage
    }

    async fn listen(self: Arc<Self>) {
        debug!("listening for upload jobs");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let jobs = match self.ctx.store.fetch(self.limit, JOB_TYPE_UPLOAD).await {
                        Ok(jobs) => jobs,
                        Err(err) => {
                            error!("failed to lease upload jobs: {}", err);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    for mut job in jobs {
                        job.retry += 1;
                        let stage = self.clone();
                        if !self.pool.submit(async move { stage.execute(job).await }).await {
                            return;
                        }
                    }
                }
            }
        }
        self.pool.close();
        self.pool.wait().await;
        debug!("upload listener closed");
    }

    pub(crate) async fn execute(self: Arc<Self>, job: Job) {
        let started = Instant::now();
        debug!(job_id = job.id, attempt = job.retry, "execute upload job");
        match self.upload(&job).await {
            Err(err) => self.ctx.fail_job(&job, err).await,
            Ok(()) => {
                debug!(
                    job_id = job.id,
                    duration = ?started.elapsed(),
                    "upload finished"
                );
                self.ctx.cleanup(&job).await;
            }
        }
    }

    async fn upload(&self, job: &Job) -> anyhow::Result<()> {
        let mut src = self.ctx.scratch.new_reader(&job.file).await?;
        let metadata = UploadMetadata::from_file(&job.file);
        let mut stream = self.storage.open_upload(&metadata).await?;

        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.send_chunk(Bytes::copy_from_slice(&buf[..n])).await?;
        }
        stream.finish().await
    }
}

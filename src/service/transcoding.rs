use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config;
use crate::model::{FileDescriptor, Job, JobConfig, JobState, JOB_TYPE_TRANSCODING, JOB_TYPE_UPLOAD};
use crate::pool::WorkerPool;
use crate::scratch::ScratchStore;
use crate::service::ffmpeg::Transcoder;
use crate::service::StageContext;
use crate::store::JobStore;

/// First pipeline stage: leases `transcoding` jobs, remuxes the raw capture
/// into MP4 and morphs the row into an `upload` job.
pub struct Transcoding {
    ctx: StageContext,
    pool: WorkerPool,
    transcoder: Transcoder,
    limit: i64,
}

impl Transcoding {
    pub fn new(
        cancel: CancellationToken,
        cfg: &config::Stage,
        store: Arc<dyn JobStore>,
        scratch: ScratchStore,
        transcoder: Transcoder,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: StageContext {
                store,
                scratch,
                cancel: cancel.clone(),
                max_retry: cfg.max_retry,
            },
            pool: WorkerPool::new(cancel, cfg.workers, cfg.queue),
            transcoder,
            limit: cfg.fetch_limit(),
        })
    }

    pub fn start(
        cancel: CancellationToken,
        cfg: &config::Stage,
        store: Arc<dyn JobStore>,
        scratch: ScratchStore,
        transcoder: Transcoder,
    ) -> Arc<Self> {
        let stage = Self::new(cancel, cfg, store, scratch, transcoder);
        tokio::spawn(stage.clone().listen());
        stage
    }

    /// Entry point for the recorder: every finished session becomes one
    /// transcoding job.
    pub async fn create_job(&self, file: &FileDescriptor) -> anyhow::Result<()> {
        self.ctx
            .store
            .create(JOB_TYPE_TRANSCODING, &JobConfig::default(), file)
            .await
    }

    async fn listen(self: Arc<Self>) {
        debug!("listening for transcoding jobs");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let jobs = match self.ctx.store.fetch(self.limit, JOB_TYPE_TRANSCODING).await {
                        Ok(jobs) => jobs,
                        Err(err) => {
                            error!("failed to lease transcoding jobs: {}", err);
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
        debug!("transcoding listener closed");
    }

    pub(crate) async fn execute(self: Arc<Self>, job: Job) {
        debug!(job_id = job.id, attempt = job.retry, "execute transcoding job");
        let mut output = job.file.clone();
        output.path = String::new();
        output.mime_type = "video/mp4".to_string();

        match self.transcode(&job, &mut output).await {
            Err(err) => self.ctx.fail_job(&job, err).await,
            Ok(()) => self.success(&job, output).await,
        }
    }

    async fn transcode(&self, job: &Job, output: &mut FileDescriptor) -> anyhow::Result<()> {
        if job.file.path.is_empty() {
            return Err(anyhow!("transcoding job without an input path"));
        }
        // Surface a missing input before spending an ffmpeg run on it.
        let probe = self.ctx.scratch.new_reader(&job.file).await?;
        drop(probe);
        self.ctx.scratch.new_path(output, "mp4")?;
        self.transcoder.run(&job.file.path, &output.path).await
    }

    async fn success(&self, job: &Job, output: FileDescriptor) {
        debug!(job_id = job.id, "transcoding finished, queueing upload");
        if let Err(err) = self.ctx.scratch.delete(&job.file) {
            error!(job_id = job.id, "failed to delete raw capture: {}", err);
        }
        let upload = Job {
            id: job.id,
            kind: JOB_TYPE_UPLOAD.to_string(),
            file: output,
            config: job.config.clone(),
            retry: 0,
        };
        if let Err(err) = self.ctx.store.update(JobState::Idle, &upload).await {
            error!(job_id = job.id, "failed to morph job into upload: {}", err);
        }
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backend::{CaptionBackend, CaptionRequest, CaptionResult};
use super::model::{final_status, BatchJob, BatchJobItem, ItemOutcome, JobStatus};
use super::schedule::{readiness, Readiness};
use super::store::BatchStore;
use crate::config::QueueConfig;
use crate::media::captions::{append_caption, write_job_info, CaptionRecord, JobInfo};
use crate::media::{secure_path, SecurePathOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub max_concurrent_jobs: usize,
    pub max_item_retries: u32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            max_concurrent_jobs: cfg.max_concurrent_jobs.max(1),
            max_item_retries: cfg.max_item_retries,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(10)),
        }
    }
}

/// Cheap handle used by request handlers to poke the worker.
#[derive(Debug, Clone, Default)]
pub struct QueueHandle {
    notify: Arc<Notify>,
    running: Arc<DashMap<Uuid, CancellationToken>>,
}

impl QueueHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the worker look at the queue now instead of at the next tick.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Fires the token of a running job. False when the job is not running here.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.running.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.running.contains_key(&job_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

struct WorkerInner {
    store: BatchStore,
    backend: Arc<dyn CaptionBackend>,
    settings: WorkerSettings,
    handle: QueueHandle,
    semaphore: Arc<Semaphore>,
    workspace: PathBuf,
}

/// Claims ready jobs and runs their items through the caption backend.
#[derive(Clone)]
pub struct QueueWorker {
    inner: Arc<WorkerInner>,
}

impl QueueWorker {
    pub fn new(
        store: BatchStore,
        backend: Arc<dyn CaptionBackend>,
        settings: WorkerSettings,
        handle: QueueHandle,
        workspace: PathBuf,
    ) -> Self {
        let permits = settings.max_concurrent_jobs;
        Self {
            inner: Arc::new(WorkerInner {
                store,
                backend,
                settings,
                handle,
                semaphore: Arc::new(Semaphore::new(permits)),
                workspace,
            }),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.inner.handle.clone()
    }

    /// Runs the dispatch loop until `shutdown` fires. In-flight jobs are
    /// interrupted and stay `running`, so the next start requeues them.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                max_concurrent_jobs = self.inner.settings.max_concurrent_jobs,
                "Batch queue worker started"
            );
            loop {
                self.dispatch_ready(&shutdown).await;

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.inner.handle.notify.notified() => {}
                    _ = tokio::time::sleep(self.inner.settings.poll_interval) => {}
                }
            }
            info!("Batch queue worker stopped");
        })
    }

    async fn dispatch_ready(&self, shutdown: &CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let Ok(permit) = self.inner.semaphore.clone().try_acquire_owned() else {
                return;
            };

            let store = self.inner.store.clone();
            let claimed = tokio::task::spawn_blocking(move || claim_next_job(&store)).await;
            let job_id = match claimed {
                Ok(Ok(Some(job_id))) => job_id,
                Ok(Ok(None)) => return,
                Ok(Err(err)) => {
                    error!(error = ?err, "Failed to claim next batch job");
                    return;
                }
                Err(err) => {
                    error!(error = %err, "Claim task panicked");
                    return;
                }
            };

            let token = shutdown.child_token();
            self.inner.handle.running.insert(job_id, token.clone());
            let worker = self.clone();
            tokio::spawn(async move { worker.run_job(job_id, token, permit).await });
        }
    }

    async fn run_job(self, job_id: Uuid, token: CancellationToken, permit: OwnedSemaphorePermit) {
        let _permit = permit;
        info!(%job_id, "Batch job started");

        if let Err(err) = self.process_job(job_id, &token).await {
            error!(%job_id, error = ?err, "Batch job failed");
            let store = self.inner.store.clone();
            let reason = format!("{err:#}");
            let marked =
                tokio::task::spawn_blocking(move || store.fail_job(job_id, &reason)).await;
            if let Ok(Err(mark_err)) = marked {
                error!(%job_id, error = ?mark_err, "Failed to persist job failure");
            }
        }

        self.inner.handle.running.remove(&job_id);
        self.inner.handle.wake();
    }

    async fn process_job(&self, job_id: Uuid, token: &CancellationToken) -> Result<()> {
        let job = self
            .blocking(move |store| store.get_job(job_id))
            .await?
            .with_context(|| format!("batch job {job_id} disappeared"))?;
        if job.status != JobStatus::Running {
            debug!(%job_id, status = %job.status, "Skipping job that is no longer running");
            return Ok(());
        }

        let items = self.blocking(move |store| store.pending_items(job_id)).await?;
        for item in items {
            if token.is_cancelled() {
                break;
            }
            let item_id = item.id;
            if !self.blocking(move |store| store.start_item(item_id)).await? {
                continue;
            }

            let Some(outcome) = self.process_item(&job, &item, token).await else {
                break;
            };
            if let ItemOutcome::Failed { error, .. } = &outcome {
                warn!(%job_id, image = %item.image_path, perspective = %item.perspective, error = %error, "Batch item failed");
            }
            let counts = self
                .blocking(move |store| store.finish_item(job_id, item_id, &outcome))
                .await?;
            debug!(%job_id, processed = counts.processed, failed = counts.failed, total = counts.total, "Batch item finished");
        }

        if token.is_cancelled() {
            info!(%job_id, "Batch job interrupted");
            return Ok(());
        }

        let job = self
            .blocking(move |store| store.get_job(job_id))
            .await?
            .with_context(|| format!("batch job {job_id} disappeared"))?;
        let status = final_status(job.processed_images, job.failed_images);
        if self
            .blocking(move |store| store.complete_job(job_id, status))
            .await?
        {
            info!(
                %job_id,
                status = %status,
                processed = job.processed_images,
                failed = job.failed_images,
                "Batch job finished"
            );
        }
        Ok(())
    }

    /// `None` when the worker is shutting down and the item should stay for the next run.
    async fn process_item(
        &self,
        job: &BatchJob,
        item: &BatchJobItem,
        token: &CancellationToken,
    ) -> Option<ItemOutcome> {
        let started = Instant::now();
        let elapsed_ms = |started: Instant| started.elapsed().as_millis() as i64;

        let image = match secure_path(
            &item.image_path,
            &self.inner.workspace,
            SecurePathOptions::readable(),
        ) {
            Ok(image) => image,
            Err(err) => {
                return Some(ItemOutcome::Failed {
                    error: format!("{}: {err}", item.image_path),
                    processing_time_ms: elapsed_ms(started),
                })
            }
        };

        let request = CaptionRequest {
            job_id: job.job_id,
            perspective: item.perspective.clone(),
            image_path: image.absolute.clone(),
            options: job.config.options.clone(),
        };

        let mut attempt: u32 = 0;
        loop {
            let backend = Arc::clone(&self.inner.backend);
            let call_request = request.clone();
            let call = tokio::task::spawn_blocking(move || backend.caption(&call_request));

            let joined = tokio::select! {
                joined = call => joined,
                _ = token.cancelled() => return self.interrupted_outcome(job.job_id).await,
            };

            let error = match joined {
                Ok(Ok(caption)) => {
                    return Some(match self.write_output(job, item, image.absolute.clone(), caption).await {
                        Ok(()) => ItemOutcome::Completed {
                            processing_time_ms: elapsed_ms(started),
                        },
                        Err(err) => ItemOutcome::Failed {
                            error: format!("{err:#}"),
                            processing_time_ms: elapsed_ms(started),
                        },
                    });
                }
                Ok(Err(err)) if err.retryable && attempt < self.inner.settings.max_item_retries => {
                    err
                }
                Ok(Err(err)) => {
                    return Some(ItemOutcome::Failed {
                        error: err.to_string(),
                        processing_time_ms: elapsed_ms(started),
                    })
                }
                Err(join_err) => {
                    return Some(ItemOutcome::Failed {
                        error: format!("caption task panicked: {join_err}"),
                        processing_time_ms: elapsed_ms(started),
                    })
                }
            };

            let backoff = self
                .inner
                .settings
                .retry_backoff
                .saturating_mul(2u32.saturating_pow(attempt));
            attempt += 1;
            debug!(
                job_id = %job.job_id,
                image = %item.image_path,
                attempt,
                max_retries = self.inner.settings.max_item_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Caption attempt failed; retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = token.cancelled() => return self.interrupted_outcome(job.job_id).await,
            }
        }
    }

    async fn interrupted_outcome(&self, job_id: Uuid) -> Option<ItemOutcome> {
        match self.blocking(move |store| store.job_status(job_id)).await {
            Ok(Some(JobStatus::Cancelled)) => Some(ItemOutcome::Cancelled),
            Ok(_) => None,
            Err(err) => {
                warn!(%job_id, error = ?err, "Could not read status of interrupted job");
                None
            }
        }
    }

    async fn write_output(
        &self,
        job: &BatchJob,
        item: &BatchJobItem,
        image: PathBuf,
        caption: CaptionResult,
    ) -> Result<()> {
        let record = CaptionRecord {
            filename: item.image_path.clone(),
            config_name: item.perspective.clone(),
            version: caption.version,
            model: caption.model.clone(),
            provider: caption.provider.clone(),
            parsed: caption.result,
        };
        let info = JobInfo {
            job_id: Some(job.job_id.to_string()),
            completed_at: Some(Utc::now().to_rfc3339()),
            provider: Some(caption.provider),
            model: Some(caption.model),
        };
        let perspective = item.perspective.clone();
        tokio::task::spawn_blocking(move || {
            let dir = append_caption(&image, &perspective, &record)?;
            write_job_info(&dir, &info)
        })
        .await
        .context("caption writer task panicked")?
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BatchStore) -> Result<T> + Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .context("queue store task panicked")?
    }
}

/// Fails pending jobs whose dependencies can no longer succeed (repeating
/// until nothing changes, so failures cascade), then claims the first ready
/// job in `(priority, created_at)` order.
pub fn claim_next_job(store: &BatchStore) -> Result<Option<Uuid>> {
    loop {
        let queued = store.queued_jobs()?;
        let dependency_ids: Vec<Uuid> = queued
            .iter()
            .flat_map(|job| job.dependencies.iter().copied())
            .collect();
        let statuses = store.statuses_of(&dependency_ids)?;

        let mut failed_any = false;
        for job in queued.iter().filter(|job| job.status == JobStatus::Pending) {
            let state = readiness(job, &statuses);
            if let Some(reason) = state.block_reason() {
                if store.fail_job(job.job_id, &reason)? {
                    warn!(job_id = %job.job_id, reason = %reason, "Batch job cannot run");
                    failed_any = true;
                }
            }
        }
        if failed_any {
            continue;
        }

        for job in queued.iter().filter(|job| job.status == JobStatus::Pending) {
            if readiness(job, &statuses) == Readiness::Ready && store.claim_job(job.job_id)? {
                return Ok(Some(job.job_id));
            }
        }
        return Ok(None);
    }
}

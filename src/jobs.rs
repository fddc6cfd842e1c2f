//! Download job queue.
//!
//! Jobs are admitted in submission order and at most `max_concurrent` of
//! them run at once. Each admitted job is driven to completion by a
//! [`Fetcher`]; when it finishes its slot is released and the next queued
//! job is admitted. Every status transition is published on a broadcast
//! channel; callers may also poll by id.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{DownloadJob, DownloadRequest, JobId, JobStatus};
use crate::error::ChartError;
use crate::fs_util::ExtractObserver;

pub const MAX_CONCURRENT_JOBS: usize = 3;
pub const JOB_RETENTION: Duration = Duration::from_secs(60 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const EVENT_CAPACITY: usize = 256;

/// Drives one job from admission to a terminal result.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, job: JobContext) -> impl Future<Output = Result<(), ChartError>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    pub max_concurrent: usize,
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_concurrent: MAX_CONCURRENT_JOBS,
            retention: JOB_RETENTION,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobEvent {
    pub id: JobId,
    pub status: JobStatus,
}

struct JobRecord {
    job: DownloadJob,
    cancel: CancellationToken,
}

#[derive(Default)]
struct JobTable {
    jobs: BTreeMap<JobId, JobRecord>,
    in_flight: usize,
    next_sequence: u64,
}

struct Shared {
    table: Mutex<JobTable>,
    events: broadcast::Sender<JobEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, id: JobId, status: JobStatus) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent { id, status });
    }

    /// Applies `update` to a live job. Jobs that already reached a terminal
    /// state are left untouched, so a cancelled job stops reporting progress.
    fn update<T>(&self, id: JobId, update: impl FnOnce(&mut DownloadJob) -> T) -> Option<T> {
        let mut table = self.lock();
        let record = table.jobs.get_mut(&id)?;
        if record.job.status.is_terminal() {
            return None;
        }
        Some(update(&mut record.job))
    }
}

/// Handle given to a [`Fetcher`] for reporting on the job it runs.
#[derive(Clone)]
pub struct JobContext {
    id: JobId,
    target_directory: PathBuf,
    requested_name: Option<String>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Current source url; redirects rewrite it.
    pub fn url(&self) -> String {
        self.shared
            .lock()
            .jobs
            .get(&self.id)
            .map(|record| record.job.source_url.clone())
            .unwrap_or_default()
    }

    pub fn target_directory(&self) -> &Path {
        &self.target_directory
    }

    pub fn requested_name(&self) -> Option<&str> {
        self.requested_name.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn redirect(&self, location: &str) {
        self.shared.update(self.id, |job| {
            job.source_url = location.to_string();
        });
    }

    pub fn set_status(&self, status: JobStatus) {
        let changed = self.shared.update(self.id, |job| {
            let changed = job.status != status;
            job.status = status;
            changed
        });
        if changed == Some(true) {
            self.shared.publish(self.id, status);
        }
    }

    pub fn set_total(&self, bytes_total: u64) {
        self.shared.update(self.id, |job| job.bytes_total = bytes_total);
    }

    /// Accounts a received chunk. Network transfer fills progress up to 90%;
    /// without a known total, progress stays where it is.
    pub fn add_transferred(&self, bytes: u64) {
        self.shared.update(self.id, |job| {
            job.bytes_transferred += bytes;
            if job.bytes_total > 0 {
                let percent =
                    u128::from(job.bytes_transferred) * 90 / u128::from(job.bytes_total);
                job.progress_percent = percent.min(90) as u8;
            }
        });
    }

    pub fn set_progress(&self, percent: u8) {
        self.shared
            .update(self.id, |job| job.progress_percent = percent.min(100));
    }

    /// Records `filename` as being written before its stream opens.
    pub fn register_target(&self, filename: &str) -> Result<(), ChartError> {
        self.shared
            .update(self.id, |job| job.target_filenames.push(filename.to_string()))
            .ok_or(ChartError::Cancelled)
    }

    pub fn mark_extracted(&self, filename: &str) {
        self.shared.update(self.id, |job| {
            job.extracted_filenames.push(filename.to_string())
        });
    }
}

impl ExtractObserver for JobContext {
    fn entry_opened(&self, filename: &str) -> Result<(), ChartError> {
        self.register_target(filename)
    }

    fn entry_written(&self, filename: &str) {
        self.mark_extracted(filename);
    }
}

struct Inner<F> {
    shared: Arc<Shared>,
    fetcher: F,
    settings: JobSettings,
    runtime: Handle,
}

/// Bounded-concurrency download queue.
pub struct JobManager<F: Fetcher> {
    inner: Arc<Inner<F>>,
}

impl<F: Fetcher> Clone for JobManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: Fetcher> JobManager<F> {
    /// Must be called from within a tokio runtime; jobs are spawned on it.
    pub fn new(fetcher: F, settings: JobSettings) -> Result<Self, ChartError> {
        let runtime = Handle::try_current()
            .map_err(|err| ChartError::Runtime(err.to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    table: Mutex::new(JobTable::default()),
                    events,
                }),
                fetcher,
                settings,
                runtime,
            }),
        })
    }

    pub fn settings(&self) -> JobSettings {
        self.inner.settings
    }

    /// Queues a download and returns its id right away.
    pub fn submit(&self, request: DownloadRequest) -> Result<JobId, ChartError> {
        reqwest::Url::parse(&request.url)
            .map_err(|err| ChartError::InvalidUrl(format!("{}: {err}", request.url)))?;

        let id = {
            let mut table = self.inner.shared.lock();
            table.next_sequence += 1;
            let id = JobId::new(table.next_sequence);
            let job = DownloadJob {
                id,
                source_url: request.url,
                target_directory: request.target_directory,
                requested_name: request.name,
                status: JobStatus::Queued,
                progress_percent: 0,
                bytes_transferred: 0,
                bytes_total: 0,
                target_filenames: Vec::new(),
                extracted_filenames: Vec::new(),
                error: None,
                created_at: Utc::now(),
                finished_at: None,
            };
            info!(job = %id, url = %job.source_url, "download queued");
            table.jobs.insert(
                id,
                JobRecord {
                    job,
                    cancel: CancellationToken::new(),
                },
            );
            id
        };
        self.inner.shared.publish(id, JobStatus::Queued);
        self.inner.schedule();
        Ok(id)
    }

    pub fn job(&self, id: JobId) -> Option<DownloadJob> {
        self.inner
            .shared
            .lock()
            .jobs
            .get(&id)
            .map(|record| record.job.clone())
    }

    /// All retained jobs, most recent first.
    pub fn jobs(&self) -> Vec<DownloadJob> {
        self.inner
            .shared
            .lock()
            .jobs
            .values()
            .rev()
            .map(|record| record.job.clone())
            .collect()
    }

    pub fn running(&self) -> usize {
        self.inner.shared.lock().in_flight
    }

    /// Id of a live job currently writing `filename` into `directory`.
    pub fn pending_target(&self, directory: &Path, filename: &str) -> Option<JobId> {
        self.inner
            .shared
            .lock()
            .jobs
            .values()
            .find(|record| {
                !record.job.status.is_terminal()
                    && record.job.target_directory == directory
                    && record.job.target_filenames.iter().any(|name| name == filename)
            })
            .map(|record| record.job.id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Waits until the job reaches a terminal state.
    pub async fn wait(&self, id: JobId) -> Result<DownloadJob, ChartError> {
        let mut events = self.subscribe();
        loop {
            let job = self
                .job(id)
                .ok_or_else(|| ChartError::JobNotFound(id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ChartError::JobNotFound(id.to_string()));
                }
            }
        }
    }

    /// Fails a live job with "cancelled" and deletes every file it has
    /// registered. Deletion is best effort: a file still being written may
    /// survive on some filesystems. Terminal jobs are returned unchanged.
    pub async fn cancel(&self, id: JobId) -> Result<DownloadJob, ChartError> {
        let (job, cleanup) = {
            let mut table = self.inner.shared.lock();
            let record = table
                .jobs
                .get_mut(&id)
                .ok_or_else(|| ChartError::JobNotFound(id.to_string()))?;
            if record.job.status.is_terminal() {
                return Ok(record.job.clone());
            }
            record.cancel.cancel();
            record.job.status = JobStatus::Failed;
            record.job.error = Some(ChartError::Cancelled.to_string());
            record.job.finished_at = Some(Utc::now());
            let cleanup = record
                .job
                .target_filenames
                .iter()
                .map(|name| record.job.target_directory.join(name))
                .collect::<Vec<_>>();
            (record.job.clone(), cleanup)
        };
        info!(job = %id, files = cleanup.len(), "download cancelled");
        self.inner.shared.publish(id, JobStatus::Failed);

        for path in cleanup {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(job = %id, path = %path.display(), "removed download target"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(job = %id, path = %path.display(), error = %err, "failed to remove download target")
                }
            }
        }
        Ok(job)
    }

    /// Drops terminal jobs that finished more than the retention window
    /// before `now`. Files on disk are not touched.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.inner.settings.retention)
            .unwrap_or(chrono::Duration::MAX);
        let mut table = self.inner.shared.lock();
        let before = table.jobs.len();
        table.jobs.retain(|_, record| match record.job.finished_at {
            Some(finished) if record.job.status.is_terminal() => {
                now.signed_duration_since(finished) <= retention
            }
            _ => true,
        });
        let purged = before - table.jobs.len();
        if purged > 0 {
            debug!(purged, "purged expired download jobs");
        }
        purged
    }

    /// Runs [`purge_expired`](Self::purge_expired) every sweep interval until
    /// the manager is dropped.
    pub fn spawn_retention_sweep(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.sweep_interval;
        self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                JobManager { inner }.purge_expired(Utc::now());
            }
        })
    }
}

/// Concurrency slot held by a running job. Dropping it releases the slot
/// and admits the next queued job, also when the fetch panicked or its task
/// was dropped unpolled; in that case the job is failed first.
struct Slot<F: Fetcher> {
    id: JobId,
    inner: Arc<Inner<F>>,
    settled: bool,
}

impl<F: Fetcher> Drop for Slot<F> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.finish(
                self.id,
                Err(ChartError::Runtime("download task ended unexpectedly".to_string())),
            );
        }
        self.inner.shared.lock().in_flight -= 1;
        self.inner.schedule();
    }
}

impl<F: Fetcher> Inner<F> {
    /// Admits queued jobs, oldest first, while slots are free.
    fn schedule(self: &Arc<Self>) {
        loop {
            let context = {
                let mut table = self.shared.lock();
                if table.in_flight >= self.settings.max_concurrent {
                    return;
                }
                let Some(record) = table
                    .jobs
                    .values_mut()
                    .find(|record| record.job.status == JobStatus::Queued)
                else {
                    return;
                };
                record.job.status = JobStatus::Downloading;
                let context = JobContext {
                    id: record.job.id,
                    target_directory: record.job.target_directory.clone(),
                    requested_name: record.job.requested_name.clone(),
                    cancel: record.cancel.clone(),
                    shared: self.shared.clone(),
                };
                table.in_flight += 1;
                context
            };

            info!(job = %context.id, "download started");
            self.shared.publish(context.id, JobStatus::Downloading);
            let mut slot = Slot {
                id: context.id,
                inner: self.clone(),
                settled: false,
            };
            self.runtime.spawn(async move {
                let result = slot.inner.fetcher.fetch(context).await;
                slot.inner.finish(slot.id, result);
                slot.settled = true;
            });
        }
    }

    fn finish(&self, id: JobId, result: Result<(), ChartError>) {
        let status = self.shared.update(id, |job| {
            job.finished_at = Some(Utc::now());
            match &result {
                Ok(()) => {
                    job.status = JobStatus::Completed;
                    job.progress_percent = 100;
                }
                Err(err) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(err.to_string());
                }
            }
            job.status
        });
        match (status, &result) {
            (Some(status), Ok(())) => {
                info!(job = %id, "download completed");
                self.shared.publish(id, status);
            }
            (Some(status), Err(err)) => {
                warn!(job = %id, error = %err, "download failed");
                self.shared.publish(id, status);
            }
            // Already failed through cancellation.
            (None, _) => debug!(job = %id, "job finished after cancellation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFetcher;

    impl Fetcher for NoopFetcher {
        async fn fetch(&self, _job: JobContext) -> Result<(), ChartError> {
            Ok(())
        }
    }

    fn request(name: &str) -> DownloadRequest {
        DownloadRequest {
            url: format!("https://example.invalid/{name}.mbtiles"),
            target_directory: PathBuf::from("/tmp/charts"),
            name: None,
        }
    }

    #[tokio::test]
    async fn progress_capped_at_ninety_during_transfer() {
        let manager = JobManager::new(NoopFetcher, JobSettings::default()).unwrap();
        let id = manager.submit(request("a")).unwrap();
        manager.wait(id).await.unwrap();

        // Terminal jobs ignore further updates.
        let shared = manager.inner.shared.clone();
        let context = JobContext {
            id,
            target_directory: PathBuf::from("/tmp/charts"),
            requested_name: None,
            cancel: CancellationToken::new(),
            shared: shared.clone(),
        };
        context.add_transferred(10);
        assert_eq!(manager.job(id).unwrap().bytes_transferred, 0);

        shared.lock().jobs.get_mut(&id).unwrap().job.status = JobStatus::Downloading;
        context.set_total(200);
        context.add_transferred(100);
        assert_eq!(manager.job(id).unwrap().progress_percent, 45);
        context.add_transferred(100);
        assert_eq!(manager.job(id).unwrap().progress_percent, 90);
        context.add_transferred(100);
        assert_eq!(manager.job(id).unwrap().progress_percent, 90);
    }

    #[tokio::test]
    async fn rejects_unparsable_urls() {
        let manager = JobManager::new(NoopFetcher, JobSettings::default()).unwrap();
        let err = manager
            .submit(DownloadRequest {
                url: "not a url".to_string(),
                target_directory: PathBuf::from("/tmp"),
                name: None,
            })
            .unwrap_err();
        assert!(matches!(err, ChartError::InvalidUrl(_)));
        assert!(manager.jobs().is_empty());
    }

    #[tokio::test]
    async fn purge_respects_retention() {
        let manager = JobManager::new(NoopFetcher, JobSettings::default()).unwrap();
        let id = manager.submit(request("a")).unwrap();
        let job = manager.wait(id).await.unwrap();
        let finished = job.finished_at.unwrap();

        assert_eq!(manager.purge_expired(finished + chrono::Duration::minutes(59)), 0);
        assert_eq!(manager.purge_expired(finished + chrono::Duration::minutes(61)), 1);
        assert!(manager.job(id).is_none());
    }
}

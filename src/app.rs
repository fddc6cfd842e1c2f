use std::sync::Arc;

use serde::Serialize;

use crate::domain::{ChartDescriptor, DownloadJob, DownloadRequest, JobId};
use crate::error::ChartError;
use crate::jobs::{Fetcher, JobManager};
use crate::registry::{self, ChartRegistry, ChartSnapshot};
use crate::store::{FlagStore, Store};
use crate::tiles::{self, TileReply};

#[derive(Debug, Clone, Serialize)]
pub struct ChartEntry {
    #[serde(flatten)]
    pub chart: ChartDescriptor,
    pub relative_path: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartListResult {
    pub charts: Vec<ChartEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListResult {
    pub jobs: Vec<DownloadJob>,
}

/// Ties the chart registry, the enable/disable flags and the download queue
/// together for the outer surfaces.
pub struct App<F: Fetcher> {
    store: Store,
    registry: ChartRegistry,
    flags: FlagStore,
    jobs: JobManager<F>,
}

impl<F: Fetcher> App<F> {
    pub fn new(store: Store, flags: FlagStore, jobs: JobManager<F>) -> Self {
        let registry = ChartRegistry::new(store.chart_root().as_std_path());
        Self {
            store,
            registry,
            flags,
            jobs,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn jobs(&self) -> &JobManager<F> {
        &self.jobs
    }

    pub fn snapshot(&self) -> Arc<ChartSnapshot> {
        self.registry.snapshot()
    }

    pub fn refresh_charts(&self) -> Arc<ChartSnapshot> {
        self.registry.refresh()
    }

    /// Like [`refresh_charts`](Self::refresh_charts), but walks the chart
    /// root on the blocking pool.
    pub async fn rescan_charts(&self) -> Result<Arc<ChartSnapshot>, ChartError> {
        let root = self.registry.root().to_path_buf();
        let snapshot = tokio::task::spawn_blocking(move || registry::discover(&root))
            .await
            .map_err(|err| ChartError::Runtime(err.to_string()))?;
        Ok(self.registry.replace(snapshot))
    }

    /// Charts of the current snapshot with their flags. Disabled charts are
    /// only included when asked for.
    pub fn list_charts(&self, include_disabled: bool) -> ChartListResult {
        let snapshot = self.registry.snapshot();
        let charts = snapshot
            .charts()
            .map(|chart| {
                let relative_path = snapshot.relative_path(chart);
                let enabled = self.flags.is_enabled(&relative_path);
                ChartEntry {
                    chart: chart.clone(),
                    relative_path,
                    enabled,
                }
            })
            .filter(|entry| include_disabled || entry.enabled)
            .collect();
        ChartListResult { charts }
    }

    /// Tile request against the current snapshot. Disabled charts answer
    /// like unknown ones.
    pub fn tile(&self, identifier: &str, z: u32, x: u32, y: u32) -> TileReply {
        let snapshot = self.registry.snapshot();
        let enabled = snapshot
            .get(identifier)
            .map(|chart| self.flags.is_enabled(&snapshot.relative_path(chart)))
            .unwrap_or(false);
        if !enabled {
            return tiles::reply(&ChartSnapshot::empty(snapshot.root()), identifier, z, x, y);
        }
        tiles::reply(&snapshot, identifier, z, x, y)
    }

    pub fn set_enabled(&self, relative_path: &str, enabled: bool) -> Result<(), ChartError> {
        self.flags.set_enabled(relative_path, enabled)
    }

    /// Queues a download into the chart root or a folder beneath it.
    pub fn submit_download(
        &self,
        url: &str,
        name: Option<String>,
        folder: Option<&str>,
    ) -> Result<JobId, ChartError> {
        let target_directory = self.store.download_dir(folder)?;
        self.jobs.submit(DownloadRequest {
            url: url.to_string(),
            target_directory: target_directory.into_std_path_buf(),
            name,
        })
    }

    pub fn job(&self, id: JobId) -> Result<DownloadJob, ChartError> {
        self.jobs
            .job(id)
            .ok_or_else(|| ChartError::JobNotFound(id.to_string()))
    }

    pub fn list_jobs(&self) -> JobListResult {
        JobListResult {
            jobs: self.jobs.jobs(),
        }
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<DownloadJob, ChartError> {
        self.jobs.cancel(id).await
    }
}

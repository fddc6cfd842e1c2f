use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::ChartError;
use crate::fetch::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_REDIRECTS};
use crate::jobs::{JOB_RETENTION, JobSettings, MAX_CONCURRENT_JOBS, SWEEP_INTERVAL};
use crate::store::{FLAGS_FILE, Store, default_chart_root};

pub const DEFAULT_CONFIG_FILE: &str = "chartkeeper.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub chart_root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub flags_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,
    #[serde(default)]
    pub retention_secs: Option<u64>,
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub max_redirects: Option<usize>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub chart_root: Utf8PathBuf,
    pub flags_path: Utf8PathBuf,
    pub jobs: JobSettings,
    pub max_redirects: usize,
    pub http_timeout: Duration,
}

impl ResolvedConfig {
    pub fn store(&self) -> Store {
        Store::new_with_paths(self.chart_root.clone(), self.flags_path.clone())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config at `path`, or `chartkeeper.json` in the working
    /// directory. Only an explicitly named file has to exist.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ChartError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ChartError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ChartError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ChartError> {
        let chart_root = match config.chart_root {
            Some(root) => root,
            None => default_chart_root()?,
        };
        let flags_path = config
            .flags_path
            .unwrap_or_else(|| chart_root.join(FLAGS_FILE));

        let max_concurrent = config.max_concurrent_jobs.unwrap_or(MAX_CONCURRENT_JOBS);
        if max_concurrent == 0 {
            return Err(ChartError::ConfigParse(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }

        let jobs = JobSettings {
            max_concurrent,
            retention: config
                .retention_secs
                .map(Duration::from_secs)
                .unwrap_or(JOB_RETENTION),
            sweep_interval: config
                .sweep_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(SWEEP_INTERVAL),
        };

        Ok(ResolvedConfig {
            chart_root,
            flags_path,
            jobs,
            max_redirects: config.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS),
            http_timeout: config
                .http_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        })
    }
}

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::sync::{PoisonError, RwLock};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::Builder;

use crate::error::ChartError;

pub const FLAGS_FILE: &str = ".chartkeeper-flags.json";

/// On-disk layout: the chart root scanned for charts, and the file holding
/// enable/disable flags.
#[derive(Debug, Clone)]
pub struct Store {
    chart_root: Utf8PathBuf,
    flags_path: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, ChartError> {
        let chart_root = default_chart_root()?;
        let flags_path = chart_root.join(FLAGS_FILE);
        Ok(Self {
            chart_root,
            flags_path,
        })
    }

    pub fn new_with_paths(chart_root: Utf8PathBuf, flags_path: Utf8PathBuf) -> Self {
        Self {
            chart_root,
            flags_path,
        }
    }

    pub fn chart_root(&self) -> &Utf8Path {
        &self.chart_root
    }

    pub fn flags_path(&self) -> &Utf8Path {
        &self.flags_path
    }

    pub fn ensure_chart_root(&self) -> Result<(), ChartError> {
        fs::create_dir_all(self.chart_root.as_std_path())
            .map_err(|err| ChartError::Filesystem(err.to_string()))
    }

    /// Download destination: the chart root, or a relative folder beneath it.
    pub fn download_dir(&self, subdir: Option<&str>) -> Result<Utf8PathBuf, ChartError> {
        let Some(subdir) = subdir.map(str::trim).filter(|dir| !dir.is_empty()) else {
            return Ok(self.chart_root.clone());
        };
        let relative = Utf8Path::new(subdir);
        let escapes = relative
            .components()
            .any(|part| !matches!(part, Utf8Component::Normal(_) | Utf8Component::CurDir));
        if escapes {
            return Err(ChartError::Filesystem(format!(
                "download folder must stay inside the chart root: {subdir}"
            )));
        }
        Ok(self.chart_root.join(relative))
    }
}

pub fn default_chart_root() -> Result<Utf8PathBuf, ChartError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_dir().join("chartkeeper").join("charts")).ok()
        })
        .ok_or_else(|| ChartError::Filesystem("unable to resolve data directory".to_string()))
}

/// Enable/disable flags keyed by chart path relative to the chart root.
/// Charts are enabled unless a flag says otherwise.
#[derive(Debug)]
pub struct FlagStore {
    path: Utf8PathBuf,
    flags: RwLock<BTreeMap<String, bool>>,
}

impl FlagStore {
    /// Loads flags from `path`; a missing file means every chart is enabled.
    pub fn load(path: &Utf8Path) -> Result<Self, ChartError> {
        let flags = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => serde_json::from_str(&content).map_err(|err| ChartError::Parse {
                path: path.as_std_path().to_path_buf(),
                message: err.to_string(),
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(ChartError::Filesystem(err.to_string())),
        };
        Ok(Self {
            path: path.to_path_buf(),
            flags: RwLock::new(flags),
        })
    }

    pub fn is_enabled(&self, relative_path: &str) -> bool {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(relative_path)
            .copied()
            .unwrap_or(true)
    }

    pub fn set_enabled(&self, relative_path: &str, enabled: bool) -> Result<(), ChartError> {
        let mut flags = self.flags.write().unwrap_or_else(PoisonError::into_inner);
        flags.insert(relative_path.to_string(), enabled);
        let content = serde_json::to_vec_pretty(&*flags)
            .map_err(|err| ChartError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&self.path, &content)
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ChartError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| ChartError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".chartkeeper")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| ChartError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| ChartError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| ChartError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_dir_stays_under_root() {
        let store = Store::new_with_paths(
            Utf8PathBuf::from("/charts"),
            Utf8PathBuf::from("/charts/.flags.json"),
        );
        assert_eq!(store.download_dir(None).unwrap(), "/charts");
        assert_eq!(store.download_dir(Some("  ")).unwrap(), "/charts");
        assert_eq!(store.download_dir(Some("uk/south")).unwrap(), "/charts/uk/south");
        assert!(store.download_dir(Some("../etc")).is_err());
        assert!(store.download_dir(Some("/etc")).is_err());
    }

    #[test]
    fn flags_default_enabled_and_persist() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("flags.json")).unwrap();

        let flags = FlagStore::load(&path).unwrap();
        assert!(flags.is_enabled("harbour.mbtiles"));
        flags.set_enabled("harbour.mbtiles", false).unwrap();
        assert!(!flags.is_enabled("harbour.mbtiles"));

        let reloaded = FlagStore::load(&path).unwrap();
        assert!(!reloaded.is_enabled("harbour.mbtiles"));
        assert!(reloaded.is_enabled("other"));
    }
}

//! Chart discovery.
//!
//! A scan walks the chart root depth-first and produces an immutable
//! [`ChartSnapshot`]. Entries of every directory are visited in lexical
//! order, so when two sources resolve to the same identifier the
//! lexically-last one wins. A directory that is itself a chart source is
//! never descended into: its children are tiles, not charts.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::{CHART_FILE_EXTENSION, ChartDescriptor};
use crate::error::ChartError;
use crate::formats::{DirectoryFormat, mbtiles, metadata_json, tms};

const HIDDEN_PREFIX: char = '.';
const SKIPPED_DIRECTORIES: &[&str] = &["node_modules"];

/// The set of charts found by one discovery scan.
#[derive(Debug, Clone)]
pub struct ChartSnapshot {
    root: PathBuf,
    charts: BTreeMap<String, ChartDescriptor>,
    scanned_at: DateTime<Utc>,
}

impl ChartSnapshot {
    pub fn empty(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            charts: BTreeMap::new(),
            scanned_at: Utc::now(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scanned_at(&self) -> DateTime<Utc> {
        self.scanned_at
    }

    pub fn get(&self, identifier: &str) -> Option<&ChartDescriptor> {
        self.charts.get(identifier)
    }

    pub fn charts(&self) -> impl Iterator<Item = &ChartDescriptor> {
        self.charts.values()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.charts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.charts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.charts.is_empty()
    }

    /// Path of a chart's source relative to the scan root, with `/`
    /// separators. This is the key used by the enable/disable store.
    pub fn relative_path(&self, chart: &ChartDescriptor) -> String {
        let relative = chart
            .source_path
            .strip_prefix(&self.root)
            .unwrap_or(&chart.source_path);
        relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Walks `root` and returns every valid chart beneath it. Sources that fail
/// to parse are logged and skipped; they never abort the walk.
pub fn discover(root: &Path) -> ChartSnapshot {
    let mut snapshot = ChartSnapshot::empty(root);
    let mut visited = HashSet::new();

    // Worklist of entries still to visit; children are pushed in reverse so
    // they pop in lexical order.
    let mut stack = Vec::new();
    push_children(root, &mut stack, &mut visited);

    while let Some(path) = stack.pop() {
        let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            continue;
        };
        if name.starts_with(HIDDEN_PREFIX) || SKIPPED_DIRECTORIES.contains(&name.as_str()) {
            continue;
        }

        if path.is_dir() {
            match DirectoryFormat::detect(&path) {
                Some(format) => register(&mut snapshot, &path, parse_directory(&path, &name, format)),
                None => push_children(&path, &mut stack, &mut visited),
            }
        } else if is_chart_file(&path) {
            let identifier = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or(name);
            register(&mut snapshot, &path, mbtiles::parse(&path, &identifier));
        }
    }

    info!(
        root = %root.display(),
        charts = snapshot.len(),
        "chart discovery finished"
    );
    snapshot
}

fn parse_directory(
    dir: &Path,
    identifier: &str,
    format: DirectoryFormat,
) -> Result<ChartDescriptor, ChartError> {
    match format {
        DirectoryFormat::TileMapService => tms::parse(dir, identifier),
        DirectoryFormat::MetadataJson => metadata_json::parse(dir, identifier),
    }
}

fn register(
    snapshot: &mut ChartSnapshot,
    path: &Path,
    parsed: Result<ChartDescriptor, ChartError>,
) {
    match parsed {
        Ok(chart) => {
            if let Some(previous) = snapshot.charts.get(&chart.identifier) {
                debug!(
                    identifier = %chart.identifier,
                    replaced = %previous.source_path.display(),
                    by = %path.display(),
                    "duplicate chart identifier"
                );
            }
            snapshot.charts.insert(chart.identifier.clone(), chart);
        }
        Err(ChartError::SourceInvalid(reason)) => {
            debug!(path = %path.display(), %reason, "skipping invalid chart source");
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read chart source");
        }
    }
}

fn push_children(dir: &Path, stack: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) {
    let canonical = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    if !visited.insert(canonical) {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "failed to list directory");
            return;
        }
    };
    let mut children = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect::<Vec<_>>();
    children.sort();
    stack.extend(children.into_iter().rev());
}

fn is_chart_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(CHART_FILE_EXTENSION))
        .unwrap_or(false)
}

/// Holds the most recent snapshot. Readers clone the `Arc` and keep using it
/// while a rescan builds its replacement.
#[derive(Debug)]
pub struct ChartRegistry {
    root: PathBuf,
    current: RwLock<Arc<ChartSnapshot>>,
}

impl ChartRegistry {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            current: RwLock::new(Arc::new(ChartSnapshot::empty(root))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> Arc<ChartSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rescans the root and commits the result as the current snapshot.
    pub fn refresh(&self) -> Arc<ChartSnapshot> {
        self.replace(discover(&self.root))
    }

    /// Commits a snapshot produced elsewhere, e.g. by a scan on a blocking
    /// thread.
    pub fn replace(&self, snapshot: ChartSnapshot) -> Arc<ChartSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_file_extension_is_case_insensitive() {
        assert!(is_chart_file(Path::new("/charts/a.mbtiles")));
        assert!(is_chart_file(Path::new("/charts/a.MBTiles")));
        assert!(!is_chart_file(Path::new("/charts/a.mbtiles.part")));
        assert!(!is_chart_file(Path::new("/charts/mbtiles")));
    }

    #[test]
    fn relative_path_uses_forward_slashes() {
        let root = PathBuf::from("/charts");
        let snapshot = ChartSnapshot::empty(&root);
        let chart = ChartDescriptor {
            identifier: "harbour".to_string(),
            source: crate::domain::ChartSource::Directory,
            source_path: root.join("uk").join("harbour"),
            name: None,
            description: None,
            bounds: [0.0, 0.0, 1.0, 1.0],
            min_zoom: None,
            max_zoom: None,
            tile_format: Some("png".to_string()),
            layer_type: crate::domain::TILE_LAYER_TYPE.to_string(),
            scale: crate::domain::DEFAULT_SCALE,
            vertical_flip: false,
            layers: Vec::new(),
        };
        assert_eq!(snapshot.relative_path(&chart), "uk/harbour");
    }
}

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::ChartError;
use crate::formats::mbtiles::MbtilesContainer;

/// Scale assigned to charts that do not declare one (or declare garbage).
pub const DEFAULT_SCALE: u32 = 250_000;

/// Layer type reported for raster and vector tile charts alike.
pub const TILE_LAYER_TYPE: &str = "tilelayer";

/// Extension of single-file chart containers.
pub const CHART_FILE_EXTENSION: &str = "mbtiles";

/// `[min_lon, min_lat, max_lon, max_lat]`
pub type Bounds = [f64; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    ContainerDatabase,
    Directory,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::ContainerDatabase => write!(f, "container-database"),
            SourceKind::Directory => write!(f, "directory"),
        }
    }
}

/// Backing storage of a chart. A container chart always carries its open
/// handle; a directory chart is addressed through `source_path`.
#[derive(Debug, Clone)]
pub enum ChartSource {
    Container(Arc<MbtilesContainer>),
    Directory,
}

impl ChartSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            ChartSource::Container(_) => SourceKind::ContainerDatabase,
            ChartSource::Directory => SourceKind::Directory,
        }
    }
}

impl Serialize for ChartSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.kind().serialize(serializer)
    }
}

/// Uniform description of one chart, whatever format it came from.
///
/// Descriptors are immutable; a changed file on disk only shows up after a
/// fresh discovery scan.
#[derive(Debug, Clone, Serialize)]
pub struct ChartDescriptor {
    pub identifier: String,
    #[serde(rename = "source_kind")]
    pub source: ChartSource,
    pub source_path: PathBuf,
    pub name: Option<String>,
    pub description: Option<String>,
    pub bounds: Bounds,
    #[serde(rename = "minzoom")]
    pub min_zoom: Option<u32>,
    #[serde(rename = "maxzoom")]
    pub max_zoom: Option<u32>,
    #[serde(rename = "format")]
    pub tile_format: Option<String>,
    #[serde(rename = "type")]
    pub layer_type: String,
    pub scale: u32,
    pub vertical_flip: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<String>,
}

impl ChartDescriptor {
    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn container(&self) -> Option<&MbtilesContainer> {
        match &self.source {
            ChartSource::Container(handle) => Some(handle),
            ChartSource::Directory => None,
        }
    }
}

/// Integer parsing that accepts a leading integer prefix (`"12px"` is 12,
/// `"3.7"` is 3) and yields `None` for anything without one.
pub fn lenient_int(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    let (sign, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (-1, &trimmed[1..]),
        Some(b'+') => (1, &trimmed[1..]),
        _ => (1, trimmed),
    };
    let end = digits
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    digits[..end].parse::<i64>().ok().map(|number| sign * number)
}

/// Lenient integer over a JSON value: numbers are truncated when finite,
/// strings go through [`lenient_int`].
pub fn lenient_int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                return Some(int);
            }
            number
                .as_f64()
                .filter(|float| float.is_finite())
                .map(|float| float.trunc() as i64)
        }
        Value::String(text) => lenient_int(text),
        _ => None,
    }
}

pub fn zoom_level(value: Option<i64>) -> Option<u32> {
    value.and_then(|zoom| u32::try_from(zoom).ok())
}

pub fn scale_or_default(value: Option<i64>) -> u32 {
    value
        .and_then(|scale| u32::try_from(scale).ok())
        .unwrap_or(DEFAULT_SCALE)
}

/// Parses `"minLon,minLat,maxLon,maxLat"` with whitespace around each element.
pub fn parse_bounds_str(value: &str) -> Option<Bounds> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect::<Option<Vec<_>>>()?;
    parts.try_into().ok()
}

pub fn parse_bounds_value(value: &Value) -> Option<Bounds> {
    match value {
        Value::String(text) => parse_bounds_str(text),
        Value::Array(items) => {
            let parts = items
                .iter()
                .map(|item| item.as_f64().filter(|v| v.is_finite()))
                .collect::<Option<Vec<_>>>()?;
            parts.try_into().ok()
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct JobId(u64);

impl JobId {
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ChartError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| ChartError::JobNotFound(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Extracting,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::Downloading | JobStatus::Extracting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Extracting => "extracting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a download job, as returned to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub source_url: String,
    pub target_directory: PathBuf,
    pub requested_name: Option<String>,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub target_filenames: Vec<String>,
    pub extracted_filenames: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub target_directory: PathBuf,
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn lenient_int_prefixes() {
        assert_eq!(lenient_int("12"), Some(12));
        assert_eq!(lenient_int(" 7 "), Some(7));
        assert_eq!(lenient_int("3.9"), Some(3));
        assert_eq!(lenient_int("-4"), Some(-4));
        assert_eq!(lenient_int("18z"), Some(18));
        assert_eq!(lenient_int("abc"), None);
        assert_eq!(lenient_int(""), None);
        assert_eq!(lenient_int("-"), None);
    }

    #[test]
    fn lenient_int_from_json() {
        assert_eq!(lenient_int_value(&json!(14)), Some(14));
        assert_eq!(lenient_int_value(&json!(2.5)), Some(2));
        assert_eq!(lenient_int_value(&json!("9")), Some(9));
        assert_eq!(lenient_int_value(&json!(null)), None);
        assert_eq!(lenient_int_value(&json!([1])), None);
    }

    #[test]
    fn scale_defaults_when_unparsable() {
        assert_eq!(scale_or_default(lenient_int("abc")), DEFAULT_SCALE);
        assert_eq!(scale_or_default(lenient_int("-5")), DEFAULT_SCALE);
        assert_eq!(scale_or_default(lenient_int("50000")), 50_000);
    }

    #[test]
    fn bounds_from_string_trims_elements() {
        assert_eq!(
            parse_bounds_str("1.0, 2.0, 3.0, 4.0"),
            Some([1.0, 2.0, 3.0, 4.0])
        );
        assert_eq!(parse_bounds_str("1,2,3"), None);
        assert_eq!(parse_bounds_str("1,2,x,4"), None);
    }

    #[test]
    fn bounds_from_json_shapes() {
        assert_eq!(
            parse_bounds_value(&json!([-10, -5.5, 10, 5.5])),
            Some([-10.0, -5.5, 10.0, 5.5])
        );
        assert_eq!(parse_bounds_value(&json!([1, 2, 3, 4, 5])), None);
        assert_eq!(parse_bounds_value(&json!({"west": 1})), None);
        assert_eq!(parse_bounds_value(&json!(12)), None);
    }

    #[test]
    fn job_status_terminality() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Extracting.is_terminal());
        assert!(JobStatus::Extracting.is_running());
        assert!(!JobStatus::Queued.is_running());
    }
}

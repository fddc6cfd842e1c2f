use std::fs;
use std::io::{self, Read};
use std::path::Path;

use reqwest::Url;
use tracing::warn;

use crate::domain::CHART_FILE_EXTENSION;
use crate::error::ChartError;

/// Receives per-entry notifications while an archive is being extracted.
pub trait ExtractObserver {
    /// Called before the destination file is created. Returning an error
    /// stops extraction without touching the disk.
    fn entry_opened(&self, filename: &str) -> Result<(), ChartError>;

    /// Called once the destination file is fully written.
    fn entry_written(&self, filename: &str);
}

/// Reads a zip archive front to back from `reader` and writes every regular
/// file whose name ends in `.{extension}` into `target_dir`, flattened to its
/// base name. Other entries are drained and discarded.
///
/// Returns the written filenames in the order they completed.
pub fn extract_matching<R: Read>(
    mut reader: R,
    target_dir: &Path,
    extension: &str,
    observer: &dyn ExtractObserver,
) -> Result<Vec<String>, ChartError> {
    let mut written = Vec::new();

    loop {
        let entry = zip::read::read_zipfile_from_stream(&mut reader)
            .map_err(|err| ChartError::Archive(err.to_string()))?;
        let Some(mut entry) = entry else {
            break;
        };

        let filename = if entry.is_file() {
            matching_entry_name(entry.name(), extension)
        } else {
            None
        };
        let Some(filename) = filename else {
            io::copy(&mut entry, &mut io::sink())
                .map_err(|err| ChartError::Archive(err.to_string()))?;
            continue;
        };

        observer.entry_opened(&filename)?;
        let path = target_dir.join(&filename);
        if let Err(err) = write_entry(&mut entry, &path) {
            remove_file_quietly(&path);
            return Err(err);
        }
        observer.entry_written(&filename);
        written.push(filename);
    }

    if written.is_empty() {
        return Err(ChartError::NoMatchingFiles);
    }
    Ok(written)
}

fn write_entry(entry: &mut impl Read, path: &Path) -> Result<(), ChartError> {
    let mut file = fs::File::create(path)
        .map_err(|err| ChartError::WriteFailure(format!("{}: {err}", path.display())))?;
    io::copy(entry, &mut file)
        .map_err(|err| ChartError::WriteFailure(format!("{}: {err}", path.display())))?;
    file.sync_all()
        .map_err(|err| ChartError::WriteFailure(format!("{}: {err}", path.display())))?;
    Ok(())
}

/// Base name of an archive entry if it is a chart file worth extracting.
/// macOS resource-fork entries (`__MACOSX/`, `._name`) never match.
pub fn matching_entry_name(entry_name: &str, extension: &str) -> Option<String> {
    if entry_name.split('/').any(|part| part == "__MACOSX") {
        return None;
    }
    let base = entry_name.rsplit(['/', '\\']).next()?;
    if base.is_empty() || base.starts_with("._") || !has_extension(base, extension) {
        return None;
    }
    Some(base.to_string())
}

fn has_extension(name: &str, extension: &str) -> bool {
    name.rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

fn with_chart_extension(name: &str) -> String {
    if has_extension(name, CHART_FILE_EXTENSION) {
        name.to_string()
    } else {
        format!("{name}.{CHART_FILE_EXTENSION}")
    }
}

/// Destination filename of a direct (non-archive) download. An explicit name
/// wins over the last path segment of the url; either way the chart
/// extension is appended when missing.
pub fn destination_filename(requested: Option<&str>, url: &str) -> Result<String, ChartError> {
    let requested = requested
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .and_then(|name| name.rsplit(['/', '\\']).next())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..");
    if let Some(name) = requested {
        return Ok(with_chart_extension(name));
    }

    let parsed = Url::parse(url).map_err(|err| ChartError::InvalidUrl(format!("{url}: {err}")))?;
    let segment = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
        .filter(|segment| *segment != "." && *segment != "..")
        .ok_or_else(|| ChartError::InvalidUrl(format!("{url}: no filename in path")))?;
    Ok(with_chart_extension(segment))
}

/// Best-effort removal used for cleanup; a missing file is not an error and
/// anything else is only logged.
pub fn remove_file_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove file"),
    }
}

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::error;

use crate::domain::{ChartDescriptor, ChartSource};
use crate::error::ChartError;
use crate::registry::ChartSnapshot;

pub const TILE_CACHE_CONTROL: &str = "public, max-age=7776000";

/// Row to read for a requested top-left row `y`, or `None` when the
/// coordinate lies outside the pyramid at zoom `z`.
pub fn effective_row(z: u32, y: u32, vertical_flip: bool) -> Option<u32> {
    if z >= 32 {
        return None;
    }
    let max_index = (1u64 << z) - 1;
    if u64::from(y) > max_index {
        return None;
    }
    if vertical_flip {
        u32::try_from(max_index - u64::from(y)).ok()
    } else {
        Some(y)
    }
}

/// Returns the tile bytes for `(z, x, y)`, `Ok(None)` when no tile exists.
pub fn resolve(
    chart: &ChartDescriptor,
    z: u32,
    x: u32,
    y: u32,
) -> Result<Option<Vec<u8>>, ChartError> {
    match &chart.source {
        ChartSource::Container(container) => container.tile(z, x, y),
        ChartSource::Directory => {
            let Some(path) = directory_tile_path(chart, z, x, y) else {
                return Ok(None);
            };
            match fs::read(&path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(ChartError::Filesystem(format!(
                    "read tile {}: {err}",
                    path.display()
                ))),
            }
        }
    }
}

fn directory_tile_path(chart: &ChartDescriptor, z: u32, x: u32, y: u32) -> Option<PathBuf> {
    let format = chart.tile_format.as_deref()?;
    let row = effective_row(z, y, chart.vertical_flip)?;
    Some(
        chart
            .source_path
            .join(z.to_string())
            .join(x.to_string())
            .join(format!("{row}.{format}")),
    )
}

pub fn content_type(format: Option<&str>) -> &'static str {
    match format.map(|f| f.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("pbf") | Some("mvt") => "application/x-protobuf",
        _ => "application/octet-stream",
    }
}

/// What the tile endpoint sends back for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileReply {
    pub status: u16,
    pub content_type: &'static str,
    pub cache_control: Option<&'static str>,
    pub body: Vec<u8>,
}

impl TileReply {
    fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain",
            cache_control: None,
            body: b"Not found".to_vec(),
        }
    }

    fn internal_error() -> Self {
        Self {
            status: 500,
            content_type: "text/plain",
            cache_control: None,
            body: b"Internal server error".to_vec(),
        }
    }
}

/// Maps a `{identifier}/{z}/{x}/{y}` request onto a reply.
pub fn reply(snapshot: &ChartSnapshot, identifier: &str, z: u32, x: u32, y: u32) -> TileReply {
    let Some(chart) = snapshot.get(identifier) else {
        return TileReply::not_found();
    };
    match resolve(chart, z, x, y) {
        Ok(Some(body)) => TileReply {
            status: 200,
            content_type: content_type(chart.tile_format.as_deref()),
            cache_control: Some(TILE_CACHE_CONTROL),
            body,
        },
        Ok(None) => TileReply::not_found(),
        Err(err) => {
            error!(chart = %identifier, z, x, y, error = %err, "tile lookup failed");
            TileReply::internal_error()
        }
    }
}

//! Per-format chart parsers. Each one reads a single chart source and turns
//! its metadata into a [`ChartDescriptor`](crate::domain::ChartDescriptor).

pub mod mbtiles;
pub mod metadata_json;
pub mod tms;

use std::path::Path;

/// Marker file of a tile-map-service directory.
pub const TMS_DESCRIPTOR_FILE: &str = "tilemapresource.xml";

/// Marker file of a directory chart described by a JSON sidecar.
pub const METADATA_JSON_FILE: &str = "metadata.json";

/// Directory chart formats, in the order they are probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryFormat {
    TileMapService,
    MetadataJson,
}

impl DirectoryFormat {
    /// Returns the format of `dir` if it is a chart root, `None` for an
    /// ordinary folder.
    pub fn detect(dir: &Path) -> Option<Self> {
        if dir.join(TMS_DESCRIPTOR_FILE).is_file() {
            Some(DirectoryFormat::TileMapService)
        } else if dir.join(METADATA_JSON_FILE).is_file() {
            Some(DirectoryFormat::MetadataJson)
        } else {
            None
        }
    }
}

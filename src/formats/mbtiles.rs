use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde_json::Value;

use crate::domain::{
    ChartDescriptor, ChartSource, TILE_LAYER_TYPE, lenient_int, parse_bounds_str,
    scale_or_default, zoom_level,
};
use crate::error::ChartError;

/// Open, read-only handle on an MBTiles container.
pub struct MbtilesContainer {
    path: PathBuf,
    connection: Mutex<Connection>,
}

impl fmt::Debug for MbtilesContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MbtilesContainer")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl MbtilesContainer {
    pub fn open(path: &Path) -> Result<Self, ChartError> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| ChartError::Database(format!("open {}: {err}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            connection: Mutex::new(connection),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole `metadata` table. Non-text values are cast to text.
    pub fn metadata(&self) -> Result<HashMap<String, String>, ChartError> {
        let guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let mut statement = guard
            .prepare("SELECT name, CAST(value AS TEXT) FROM metadata")
            .map_err(|err| self.parse_error(err))?;
        let rows = statement
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(|err| self.parse_error(err))?;

        let mut metadata = HashMap::new();
        for row in rows {
            let (name, value) = row.map_err(|err| self.parse_error(err))?;
            if let Some(value) = value {
                metadata.insert(name, value);
            }
        }
        Ok(metadata)
    }

    /// Fetches a tile addressed with a top-left origin. MBTiles stores rows
    /// bottom-left, so the row is flipped here and nowhere else.
    pub fn tile(&self, z: u32, x: u32, y: u32) -> Result<Option<Vec<u8>>, ChartError> {
        if z >= 32 {
            return Ok(None);
        }
        let max_index = (1u64 << z) - 1;
        if u64::from(x) > max_index || u64::from(y) > max_index {
            return Ok(None);
        }
        let tms_row = max_index - u64::from(y);

        let guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .query_row(
                "SELECT tile_data FROM tiles \
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                params![z, x, tms_row as i64],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(|err| {
                ChartError::Database(format!("tile {z}/{x}/{y} in {}: {err}", self.path.display()))
            })
    }

    fn parse_error(&self, err: rusqlite::Error) -> ChartError {
        ChartError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

/// Opens an MBTiles file and builds its descriptor. A container without a
/// `bounds` row is not a chart.
pub fn parse(path: &Path, identifier: &str) -> Result<ChartDescriptor, ChartError> {
    let container = MbtilesContainer::open(path)?;
    let metadata = container.metadata()?;

    let bounds = metadata
        .get("bounds")
        .and_then(|value| parse_bounds_str(value))
        .ok_or_else(|| {
            ChartError::SourceInvalid(format!("{}: missing bounds", path.display()))
        })?;

    let layers = metadata
        .get("json")
        .map(|json| vector_layer_ids(json))
        .unwrap_or_default();

    Ok(ChartDescriptor {
        identifier: identifier.to_string(),
        source_path: path.to_path_buf(),
        name: metadata.get("name").cloned(),
        description: metadata.get("description").cloned(),
        bounds,
        min_zoom: zoom_level(metadata.get("minzoom").and_then(|v| lenient_int(v))),
        max_zoom: zoom_level(metadata.get("maxzoom").and_then(|v| lenient_int(v))),
        tile_format: metadata.get("format").cloned(),
        layer_type: TILE_LAYER_TYPE.to_string(),
        scale: scale_or_default(metadata.get("scale").and_then(|v| lenient_int(v))),
        vertical_flip: false,
        layers,
        source: ChartSource::Container(Arc::new(container)),
    })
}

/// Flattens `{"vector_layers": [{"id": ..}, ..]}` into the list of ids.
fn vector_layer_ids(json: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(json) else {
        return Vec::new();
    };
    value
        .get("vector_layers")
        .and_then(|layers| layers.as_array())
        .map(|layers| {
            layers
                .iter()
                .filter_map(|layer| layer.get("id").and_then(|id| id.as_str()))
                .map(|id| id.to_string())
                .collect()
        })
        .unwrap_or_default()
}

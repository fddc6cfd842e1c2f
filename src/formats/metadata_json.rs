use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::domain::{
    ChartDescriptor, ChartSource, TILE_LAYER_TYPE, lenient_int_value, parse_bounds_value,
    scale_or_default, zoom_level,
};
use crate::error::ChartError;
use crate::formats::METADATA_JSON_FILE;

/// Parses a directory chart described by `metadata.json`. Tiles are
/// addressed top-left, so no vertical flip is needed.
pub fn parse(dir: &Path, identifier: &str) -> Result<ChartDescriptor, ChartError> {
    let metadata_path = dir.join(METADATA_JSON_FILE);
    let content = fs::read_to_string(&metadata_path).map_err(|err| ChartError::Parse {
        path: metadata_path.clone(),
        message: err.to_string(),
    })?;
    let metadata: Value = serde_json::from_str(&content).map_err(|err| ChartError::Parse {
        path: metadata_path.clone(),
        message: err.to_string(),
    })?;
    from_value(&metadata, dir, identifier).map_err(|reason| {
        ChartError::SourceInvalid(format!("{}: {reason}", metadata_path.display()))
    })
}

fn from_value(metadata: &Value, dir: &Path, identifier: &str) -> Result<ChartDescriptor, String> {
    let text = |key: &str| {
        metadata
            .get(key)
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
    };
    let int = |key: &str| metadata.get(key).and_then(lenient_int_value);

    let bounds = metadata
        .get("bounds")
        .and_then(parse_bounds_value)
        .ok_or_else(|| "missing bounds".to_string())?;
    let tile_format = text("format")
        .filter(|format| !format.is_empty())
        .ok_or_else(|| "missing format".to_string())?;

    Ok(ChartDescriptor {
        identifier: identifier.to_string(),
        source: ChartSource::Directory,
        source_path: dir.to_path_buf(),
        name: text("name"),
        description: text("description"),
        bounds,
        min_zoom: zoom_level(int("minzoom")),
        max_zoom: zoom_level(int("maxzoom")),
        tile_format: Some(tile_format),
        layer_type: text("type").unwrap_or_else(|| TILE_LAYER_TYPE.to_string()),
        scale: scale_or_default(int("scale")),
        vertical_flip: false,
        layers: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::domain::DEFAULT_SCALE;

    fn parse_value(value: Value) -> Result<ChartDescriptor, String> {
        from_value(&value, &PathBuf::from("/charts/harbour"), "harbour")
    }

    #[test]
    fn string_bounds_and_defaults() {
        let chart = parse_value(json!({
            "name": "Harbour",
            "bounds": "1.0, 2.0, 3.0, 4.0",
            "format": "png",
            "minzoom": "8",
            "maxzoom": 16.0,
        }))
        .unwrap();
        assert_eq!(chart.bounds, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(chart.min_zoom, Some(8));
        assert_eq!(chart.max_zoom, Some(16));
        assert_eq!(chart.layer_type, TILE_LAYER_TYPE);
        assert_eq!(chart.scale, DEFAULT_SCALE);
        assert!(!chart.vertical_flip);
    }

    #[test]
    fn array_bounds_and_explicit_type() {
        let chart = parse_value(json!({
            "bounds": [-1, -2, 3, 4],
            "format": "pbf",
            "type": "overlay",
            "scale": "50000",
        }))
        .unwrap();
        assert_eq!(chart.bounds, [-1.0, -2.0, 3.0, 4.0]);
        assert_eq!(chart.layer_type, "overlay");
        assert_eq!(chart.scale, 50_000);
    }

    #[test]
    fn unsupported_bounds_shape_rejected() {
        let err = parse_value(json!({"bounds": {"west": 1}, "format": "png"})).unwrap_err();
        assert!(err.contains("bounds"));
    }

    #[test]
    fn missing_format_rejected() {
        let err = parse_value(json!({"bounds": [0, 0, 1, 1]})).unwrap_err();
        assert!(err.contains("format"));
    }
}

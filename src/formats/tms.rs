use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::domain::{Bounds, ChartDescriptor, ChartSource, DEFAULT_SCALE, TILE_LAYER_TYPE, lenient_int};
use crate::error::ChartError;
use crate::formats::TMS_DESCRIPTOR_FILE;

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("attribute pattern")
});
static BOUNDING_BOX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<BoundingBox\b([^>]*)>").expect("bounding box pattern"));
static TILE_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<TileFormat\b([^>]*)>").expect("tile format pattern"));
static TILE_SET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<TileSet\b([^>]*)>").expect("tile set pattern"));
static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Title>(.*?)</Title>").expect("title pattern"));
static ABSTRACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Abstract>(.*?)</Abstract>").expect("abstract pattern"));

/// Fields of a `tilemapresource.xml` the registry cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct TileMapResource {
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub bounds: Option<Bounds>,
    pub min_zoom: Option<u32>,
    pub max_zoom: Option<u32>,
    pub extension: Option<String>,
}

impl TileMapResource {
    pub fn from_xml(xml: &str) -> Self {
        let bounds = BOUNDING_BOX
            .captures(xml)
            .map(|caps| attributes(&caps[1]))
            .and_then(|attrs| bounding_box(&attrs));

        let extension = TILE_FORMAT.captures(xml).and_then(|caps| {
            let attrs = attributes(&caps[1]);
            attrs
                .get("extension")
                .filter(|ext| !ext.is_empty())
                .cloned()
                .or_else(|| {
                    attrs
                        .get("mime-type")
                        .and_then(|mime| mime.rsplit('/').next())
                        .filter(|ext| !ext.is_empty())
                        .map(|ext| ext.to_string())
                })
        });

        // Zoom levels come from each TileSet's `order`, falling back to `href`.
        let levels = TILE_SET
            .captures_iter(xml)
            .filter_map(|caps| {
                let attrs = attributes(&caps[1]);
                attrs
                    .get("order")
                    .or_else(|| attrs.get("href"))
                    .and_then(|value| lenient_int(value))
                    .and_then(|level| u32::try_from(level).ok())
            })
            .collect::<Vec<_>>();

        Self {
            title: text_element(&TITLE, xml),
            abstract_text: text_element(&ABSTRACT, xml),
            bounds,
            min_zoom: levels.iter().copied().min(),
            max_zoom: levels.iter().copied().max(),
            extension,
        }
    }
}

/// Parses a TMS directory. Rows in this format count from the bottom of the
/// pyramid, so the descriptor always asks for a vertical flip.
pub fn parse(dir: &Path, identifier: &str) -> Result<ChartDescriptor, ChartError> {
    let descriptor_path = dir.join(TMS_DESCRIPTOR_FILE);
    let xml = fs::read_to_string(&descriptor_path).map_err(|err| ChartError::Parse {
        path: descriptor_path.clone(),
        message: err.to_string(),
    })?;
    let resource = TileMapResource::from_xml(&xml);

    let bounds = resource.bounds.ok_or_else(|| {
        ChartError::SourceInvalid(format!("{}: missing BoundingBox", descriptor_path.display()))
    })?;
    let tile_format = resource.extension.ok_or_else(|| {
        ChartError::SourceInvalid(format!("{}: missing TileFormat", descriptor_path.display()))
    })?;

    let description = resource.abstract_text.or_else(|| resource.title.clone());

    Ok(ChartDescriptor {
        identifier: identifier.to_string(),
        source: ChartSource::Directory,
        source_path: dir.to_path_buf(),
        name: resource.title,
        description,
        bounds,
        min_zoom: resource.min_zoom,
        max_zoom: resource.max_zoom,
        tile_format: Some(tile_format),
        layer_type: TILE_LAYER_TYPE.to_string(),
        scale: DEFAULT_SCALE,
        vertical_flip: true,
        layers: Vec::new(),
    })
}

fn attributes(fragment: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(fragment)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| unescape(m.as_str()))
                .unwrap_or_default();
            (caps[1].to_string(), value)
        })
        .collect()
}

fn bounding_box(attrs: &HashMap<String, String>) -> Option<Bounds> {
    let coord = |key: &str| {
        attrs
            .get(key)
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite())
    };
    Some([coord("minx")?, coord("miny")?, coord("maxx")?, coord("maxy")?])
}

fn text_element(pattern: &Regex, xml: &str) -> Option<String> {
    pattern
        .captures(xml)
        .map(|caps| unescape(caps[1].trim()))
        .filter(|text| !text.is_empty())
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

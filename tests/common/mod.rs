#![allow(dead_code)]

use std::fs;
use std::path::Path;

use rusqlite::{Connection, params};

/// Writes an MBTiles file. Tile rows are given in the file's own
/// bottom-left numbering.
pub fn write_mbtiles(path: &Path, metadata: &[(&str, &str)], tiles: &[(u32, u32, u32, &[u8])]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE metadata (name TEXT, value TEXT);
         CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB);",
    )
    .unwrap();
    for (name, value) in metadata {
        conn.execute(
            "INSERT INTO metadata (name, value) VALUES (?1, ?2)",
            params![name, value],
        )
        .unwrap();
    }
    for (z, x, row, data) in tiles {
        conn.execute(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
            params![z, x, row, data],
        )
        .unwrap();
    }
}

pub fn write_tms(dir: &Path, title: &str, bounds: Option<&str>) {
    fs::create_dir_all(dir).unwrap();
    let bounding_box = bounds.unwrap_or_default();
    let xml = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<TileMap version="1.0.0" tilemapservice="http://tms.osgeo.org/1.0.0">
  <Title>{title}</Title>
  <Abstract></Abstract>
  <SRS>EPSG:3857</SRS>
  {bounding_box}
  <TileFormat width="256" height="256" mime-type="image/png" extension="png"/>
  <TileSets profile="mercator">
    <TileSet href="3" units-per-pixel="19567.88" order="3"/>
    <TileSet href="4" units-per-pixel="9783.94" order="4"/>
  </TileSets>
</TileMap>"#
    );
    fs::write(dir.join("tilemapresource.xml"), xml).unwrap();
}

pub fn write_metadata_dir(dir: &Path, metadata: serde_json::Value) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("metadata.json"),
        serde_json::to_vec_pretty(&metadata).unwrap(),
    )
    .unwrap();
}

pub fn write_tile(dir: &Path, z: u32, x: u32, row: u32, ext: &str, data: &[u8]) {
    let tile_dir = dir.join(z.to_string()).join(x.to_string());
    fs::create_dir_all(&tile_dir).unwrap();
    fs::write(tile_dir.join(format!("{row}.{ext}")), data).unwrap();
}

pub const BOUNDING_BOX: &str = r#"<BoundingBox minx="-5.25" miny="49.9" maxx="-4.75" maxy="50.4"/>"#;

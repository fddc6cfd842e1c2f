mod common;

use std::fs;

use serde_json::json;

use chartkeeper::registry::discover;
use chartkeeper::tiles::{TILE_CACHE_CONTROL, reply, resolve};
use common::{BOUNDING_BOX, write_mbtiles, write_metadata_dir, write_tile, write_tms};

#[test]
fn tms_directory_rows_are_flipped() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("harbour");
    write_tms(&dir, "Harbour", Some(BOUNDING_BOX));
    // z=3, y=5 lives at row 2^3 - 1 - 5 = 2.
    write_tile(&dir, 3, 4, 2, "png", b"tms-tile");

    let snapshot = discover(temp.path());
    let chart = snapshot.get("harbour").unwrap();

    assert_eq!(resolve(chart, 3, 4, 5).unwrap(), Some(b"tms-tile".to_vec()));
    assert_eq!(resolve(chart, 3, 4, 2).unwrap(), None);

    let first = reply(&snapshot, "harbour", 3, 4, 5);
    let second = reply(&snapshot, "harbour", 3, 4, 5);
    assert_eq!(first, second);
    assert_eq!(first.status, 200);
    assert_eq!(first.content_type, "image/png");
    assert_eq!(first.cache_control, Some(TILE_CACHE_CONTROL));
}

#[test]
fn metadata_directory_is_read_top_left() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("approach");
    write_metadata_dir(&dir, json!({ "bounds": "0,0,1,1", "format": "jpg" }));
    write_tile(&dir, 2, 1, 3, "jpg", b"xyz-tile");

    let snapshot = discover(temp.path());
    let chart = snapshot.get("approach").unwrap();
    assert_eq!(resolve(chart, 2, 1, 3).unwrap(), Some(b"xyz-tile".to_vec()));

    let tile = reply(&snapshot, "approach", 2, 1, 3);
    assert_eq!(tile.status, 200);
    assert_eq!(tile.content_type, "image/jpeg");
}

#[test]
fn container_is_addressed_top_left() {
    let temp = tempfile::tempdir().unwrap();
    // Stored at TMS row 6 for z=3, which is row 1 counted from the top.
    write_mbtiles(
        &temp.path().join("coast.mbtiles"),
        &[("bounds", "0,0,1,1"), ("format", "png")],
        &[(3, 2, 6, b"container-tile")],
    );

    let snapshot = discover(temp.path());
    let chart = snapshot.get("coast").unwrap();
    assert_eq!(resolve(chart, 3, 2, 1).unwrap(), Some(b"container-tile".to_vec()));
    assert_eq!(resolve(chart, 3, 2, 6).unwrap(), None);
}

#[test]
fn unknown_charts_and_missing_tiles_are_not_found() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("harbour");
    write_tms(&dir, "Harbour", Some(BOUNDING_BOX));

    let snapshot = discover(temp.path());
    assert_eq!(reply(&snapshot, "nowhere", 0, 0, 0).status, 404);
    assert_eq!(reply(&snapshot, "harbour", 5, 1, 1).status, 404);
    // Rows past the pyramid edge never touch the disk.
    assert_eq!(reply(&snapshot, "harbour", 1, 0, 2).status, 404);
}

#[test]
fn unreadable_tiles_are_server_errors() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("approach");
    write_metadata_dir(&dir, json!({ "bounds": "0,0,1,1", "format": "png" }));
    // A directory where the tile file should be.
    fs::create_dir_all(dir.join("0/0/0.png")).unwrap();

    let snapshot = discover(temp.path());
    let tile = reply(&snapshot, "approach", 0, 0, 0);
    assert_eq!(tile.status, 500);
    assert_eq!(tile.cache_control, None);
}

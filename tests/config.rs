use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use chartkeeper::config::{Config, ConfigLoader};
use chartkeeper::error::ChartError;

#[test]
fn overrides_every_setting() {
    let config = Config {
        chart_root: Some(Utf8PathBuf::from("/srv/charts")),
        flags_path: Some(Utf8PathBuf::from("/etc/chartkeeper/flags.json")),
        max_concurrent_jobs: Some(5),
        retention_secs: Some(120),
        sweep_interval_secs: Some(30),
        max_redirects: Some(2),
        http_timeout_secs: Some(7),
    };

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.chart_root, "/srv/charts");
    assert_eq!(resolved.flags_path, "/etc/chartkeeper/flags.json");
    assert_eq!(resolved.jobs.max_concurrent, 5);
    assert_eq!(resolved.jobs.retention, Duration::from_secs(120));
    assert_eq!(resolved.jobs.sweep_interval, Duration::from_secs(30));
    assert_eq!(resolved.max_redirects, 2);
    assert_eq!(resolved.http_timeout, Duration::from_secs(7));

    let store = resolved.store();
    assert_eq!(store.chart_root(), "/srv/charts");
    assert_eq!(store.flags_path(), "/etc/chartkeeper/flags.json");
}

#[test]
fn zero_concurrency_is_rejected() {
    let config = Config {
        chart_root: Some(Utf8PathBuf::from("/srv/charts")),
        max_concurrent_jobs: Some(0),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(ChartError::ConfigParse(_))
    );
}

#[test]
fn reads_json_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("chartkeeper.json");
    std::fs::write(
        &path,
        r#"{ "chart_root": "/data/charts", "max_concurrent_jobs": 1 }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.chart_root, "/data/charts");
    assert_eq!(resolved.jobs.max_concurrent, 1);
}

#[test]
fn explicit_file_must_exist_and_parse() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(ChartError::ConfigRead(_))
    );

    let broken = temp.path().join("broken.json");
    std::fs::write(&broken, "{ chart_root").unwrap();
    assert_matches!(
        ConfigLoader::resolve(broken.to_str()),
        Err(ChartError::ConfigParse(_))
    );
}

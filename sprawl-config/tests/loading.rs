use std::fs;

use sprawl_config::{
    ConfigGuardRailError, CrawlerSettings, SettingsLoadError, SettingsLoader, StoreSettings,
    apply_guard_rails,
};

#[test]
fn json_and_toml_files_agree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let toml_path = dir.path().join("sprawl.toml");
    let json_path = dir.path().join("sprawl.json");
    fs::write(
        &toml_path,
        "[throttle]\nmin_crawl_delay_ms = 1500\n\n[scheduler]\nexclude_domains = [\"*.ads.test\"]\n",
    )
    .expect("write toml");
    fs::write(
        &json_path,
        r#"{"throttle":{"min_crawl_delay_ms":1500},"scheduler":{"exclude_domains":["*.ads.test"]}}"#,
    )
    .expect("write json");

    let from_toml = CrawlerSettings::load_from_file(&toml_path).expect("toml loads");
    let from_json = CrawlerSettings::load_from_file(&json_path).expect("json loads");
    assert_eq!(from_toml, from_json);
    assert_eq!(from_toml.crawler.throttle.min_crawl_delay_ms, 1500);
}

#[test]
fn unknown_extension_sniffs_the_format() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("crawl.conf");
    fs::write(&path, "[store]\nkind = \"disk\"\npath = \"cache\"\n").expect("write");

    let settings = CrawlerSettings::load_from_file(&path).expect("loads");
    assert_eq!(
        settings.store,
        StoreSettings::Disk {
            path: "cache".into()
        }
    );
}

#[test]
fn malformed_json_names_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sprawl.json");
    fs::write(&path, "{ \"throttle\": ").expect("write");

    let err = CrawlerSettings::load_from_file(&path).unwrap_err();
    assert!(format!("{err:#}").contains("sprawl.json"));
}

#[test]
fn guard_rails_reject_loaded_zero_concurrency() {
    let settings = CrawlerSettings::parse_json(r#"{"scheduler_stage":{"max_concurrent_items":0}}"#)
        .expect("parses");
    let err = apply_guard_rails(&settings).unwrap_err();
    assert!(matches!(err, ConfigGuardRailError::ZeroConcurrency { .. }));

    let wrapped: SettingsLoadError = err.into();
    assert!(wrapped.to_string().contains("max_concurrent_items"));
}

#[test]
fn missing_env_file_is_not_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let load = SettingsLoader::new()
        .with_env_file(dir.path().join(".env.absent"))
        .load()
        .expect("loads without env file");
    assert!(!load.env_file_loaded);
}

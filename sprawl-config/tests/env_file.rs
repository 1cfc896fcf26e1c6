//! Mutates the process environment through dotenvy, so it lives in its own test binary.

use sprawl_config::{SettingsLoader, SettingsSource};

#[test]
fn env_file_supplies_inline_settings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env_path = dir.path().join(".env");
    std::fs::write(
        &env_path,
        "SPRAWL_CONFIG_JSON='{\"throttle\":{\"min_crawl_delay_ms\":42},\"waiting_ttl_secs\":null}'\n",
    )
    .expect("write env file");

    let load = SettingsLoader::new()
        .with_env_file(&env_path)
        .load()
        .expect("loads");

    assert!(load.env_file_loaded);
    assert_eq!(load.source, SettingsSource::EnvInline);
    assert_eq!(load.settings.crawler.throttle.min_crawl_delay_ms, 42);
    assert_eq!(load.settings.crawler.waiting_ttl_secs, None);
    assert!(
        load.warnings
            .items
            .iter()
            .any(|w| w.message.contains("waiting_ttl_secs"))
    );
}

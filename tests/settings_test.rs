use rxfer_lib::settings::{Settings, SettingsError};
use rxfer_lib::xfer::{EndpointConfig, Protocol};
use rxfer_lib::LogFormat;

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load_or_default(&dir.path().join("none.json")).unwrap();
    assert!(settings.endpoints.is_empty());
    assert_eq!(settings.engine.pool.max_pool_size, 5);
    assert_eq!(settings.engine.scheduler.max_concurrent, 4);
}

#[test]
fn save_then_load_keeps_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/settings.json");
    let mut settings = Settings::default();
    let mut ep = EndpointConfig::new(Protocol::Ftps, "ftp.example.org", "ops");
    ep.name = Some("mirror".into());
    ep.ignore = vec![".git".into()];
    settings.endpoints.push(ep);
    settings.engine.scheduler.max_concurrent = 2;
    settings.log.format = LogFormat::Json;
    settings.save(&path).unwrap();

    let loaded = Settings::load(&path).unwrap();
    assert_eq!(loaded.engine.scheduler.max_concurrent, 2);
    assert_eq!(loaded.log.format, LogFormat::Json);
    let ep = loaded.endpoint("mirror").unwrap();
    assert_eq!(ep.effective_port(), 21);
    assert_eq!(ep.ignore, vec![".git"]);
    assert!(loaded.endpoint(&ep.key()).is_some());
}

#[test]
fn partial_document_fills_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(
        &path,
        r#"{ "endpoints": [ { "host": "h", "username": "u" } ], "engine": { "pool": { "maxPoolSize": 3 } } }"#,
    )
    .unwrap();
    let s = Settings::load(&path).unwrap();
    assert_eq!(s.engine.pool.max_pool_size, 3);
    assert_eq!(s.engine.pool.acquire_poll_ms, 50);
    assert_eq!(s.endpoints[0].remote_path, "/");
    assert!(s.endpoints[0].auto_reconnect);
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        Settings::load_or_default(&path),
        Err(SettingsError::Parse { .. })
    ));
}

#[test]
fn duplicate_endpoint_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(
        &path,
        r#"{ "endpoints": [
            { "host": "h", "username": "u" },
            { "host": "h", "username": "u", "port": 22 }
        ] }"#,
    )
    .unwrap();
    match Settings::load(&path) {
        Err(SettingsError::DuplicateEndpoint(key)) => assert_eq!(key, "h:22-u"),
        other => panic!("expected duplicate error, got {other:?}"),
    }
}

#[test]
fn default_path_lives_under_config_dir() {
    if let Ok(path) = Settings::default_path() {
        assert!(path.ends_with("rxfer/settings.json"));
    }
}

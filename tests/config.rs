use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use molid::config::{Config, ConfigLoader, EnvOverrides};
use molid::domain::SearchMode;
use molid::error::MolidError;

#[test]
fn file_values_override_defaults() {
    let config: Config = serde_json::from_str(
        r#"{
            "master_db": "/data/pubchem_master.db",
            "cache_db": "/data/cache.db",
            "mode": "offline-basic",
            "cache_enabled": false,
            "max_files": 4
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve_config(config, &EnvOverrides::default()).unwrap();
    assert_eq!(resolved.master_db, Utf8PathBuf::from("/data/pubchem_master.db"));
    assert_eq!(resolved.cache_db, Utf8PathBuf::from("/data/cache.db"));
    assert_eq!(resolved.mode, SearchMode::OfflineBasic);
    assert!(!resolved.cache_enabled);
    assert_eq!(resolved.max_files, Some(4));

    let search = resolved.search_configuration();
    assert_eq!(search.mode, SearchMode::OfflineBasic);
    assert_eq!(search.master_db, resolved.master_db);
}

#[test]
fn environment_overrides_file() {
    let config = Config {
        mode: Some(SearchMode::OnlineOnly),
        master_db: Some(Utf8PathBuf::from("/from/file.db")),
        ..Config::default()
    };
    let env = EnvOverrides::from_pairs([
        ("MOLID_MODE", "online-cached"),
        ("MOLID_MASTER_DB", "/from/env.db"),
        ("MOLID_CACHE_ENABLED", "off"),
        ("MOLID_MAX_FILES", "2"),
    ]);

    let resolved = ConfigLoader::resolve_config(config, &env).unwrap();
    assert_eq!(resolved.mode, SearchMode::OnlineCached);
    assert_eq!(resolved.master_db, Utf8PathBuf::from("/from/env.db"));
    assert!(!resolved.cache_enabled);
    assert_eq!(resolved.max_files, Some(2));
}

#[test]
fn invalid_mode_is_rejected() {
    let env = EnvOverrides::from_pairs([("MOLID_MODE", "auto")]);
    let err = ConfigLoader::resolve_config(Config::default(), &env).unwrap_err();
    assert_matches!(err, MolidError::InvalidMode(_));

    let err = serde_json::from_str::<Config>(r#"{"mode": "sometimes"}"#).unwrap_err();
    assert!(err.to_string().contains("sometimes"));
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope.json");
    let err = ConfigLoader::load(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, MolidError::ConfigRead(_));
}

#[test]
fn save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("nested").join("molid.json")).unwrap();
    let config = Config {
        mode: Some(SearchMode::OfflineAdvanced),
        cache_enabled: Some(true),
        ..Config::default()
    };
    ConfigLoader::save(&path, &config).unwrap();

    let loaded = ConfigLoader::load(Some(path.as_str())).unwrap();
    assert_eq!(loaded.mode, Some(SearchMode::OfflineAdvanced));
    assert_eq!(loaded.cache_enabled, Some(true));
    assert_eq!(loaded.master_db, None);
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("molid.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = ConfigLoader::load(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, MolidError::ConfigParse(_));
}

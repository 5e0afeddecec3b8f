use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use basekit_idempotency::config::{
    ConfigLayer, ConfigResolver, ConfigSource, StoreBackend, StoreLayer, explain,
};
use basekit_idempotency::{ErrorCaching, IdempotencyError, IdempotencyExecutorBuilder};
use tempfile::tempdir;

fn write_config(path: &PathBuf, contents: &str) {
    fs::create_dir_all(path.parent().expect("parent dir")).unwrap();
    fs::write(path, contents).unwrap();
}

#[test]
fn cli_overrides_env_overrides_file() {
    let tmp = tempdir().unwrap();
    let file = tmp.path().join("conf/idempotency.toml");
    write_config(
        &file,
        r#"
header_name = "X-File-Key"
default_ttl_secs = 60
fail_open = false

[operations]
provision = 120
"#,
    );

    let cli = ConfigLayer {
        default_ttl_secs: Some(30),
        ..Default::default()
    };

    let resolved = ConfigResolver::new()
        .with_file(&file)
        .with_env_vars([
            ("BASEKIT_IDEMPOTENCY_DEFAULT_TTL_SECS", "45"),
            ("BASEKIT_IDEMPOTENCY_FAIL_OPEN", "true"),
            ("BASEKIT_IDEMPOTENCY_OPERATION_TTL_PROVISION", "90"),
            ("UNRELATED_VARIABLE", "ignored"),
        ])
        .with_cli_overrides(cli)
        .load()
        .expect("resolve config");

    let config = &resolved.config;
    assert_eq!(config.header_name, "X-File-Key");
    assert_eq!(config.default_ttl_secs, 30);
    assert!(config.fail_open);
    assert_eq!(config.operations["provision"], 90);
    assert_eq!(config.operations["revoke"], 31_536_000);
    assert_eq!(config.operations["rotate"], 300);

    assert_eq!(resolved.source_of("header_name"), ConfigSource::File);
    assert_eq!(resolved.source_of("default_ttl_secs"), ConfigSource::Cli);
    assert_eq!(resolved.source_of("fail_open"), ConfigSource::Environment);
    assert_eq!(
        resolved.source_of("operations.provision"),
        ConfigSource::Environment
    );
    assert_eq!(resolved.source_of("operations.revoke"), ConfigSource::Default);
}

#[test]
fn json_file_and_enum_env_values() {
    let tmp = tempdir().unwrap();
    let file = tmp.path().join("idempotency.json");
    let db = tmp.path().join("keys.db");
    write_config(
        &file,
        &serde_json::json!({
            "error_caching": "client_errors",
            "store": { "backend": "sqlite", "path": db },
        })
        .to_string(),
    );

    let resolved = ConfigResolver::new()
        .with_file(&file)
        .with_env_vars([("BASEKIT_IDEMPOTENCY_ERROR_CACHING", "Always")])
        .load()
        .unwrap();

    assert_eq!(resolved.config.error_caching, ErrorCaching::Always);
    assert_eq!(resolved.config.store.backend, StoreBackend::Sqlite);
    assert_eq!(resolved.config.store.path.as_deref(), Some(db.as_path()));
    assert_eq!(resolved.source_of("store.path"), ConfigSource::File);
    assert!(
        resolved
            .warnings
            .iter()
            .any(|warning| warning.contains("error_caching = always"))
    );
}

#[test]
fn unknown_file_keys_are_rejected() {
    let tmp = tempdir().unwrap();
    let file = tmp.path().join("bad.toml");
    write_config(&file, "default_tll_secs = 10\n");

    let err = ConfigResolver::new()
        .with_file(&file)
        .with_env_vars(Vec::<(String, String)>::new())
        .load()
        .expect_err("typo must not be silently ignored");
    assert!(matches!(err, IdempotencyError::Config(_)), "{err}");
}

#[test]
fn malformed_env_value_is_an_error() {
    let err = ConfigResolver::new()
        .with_env_vars([("BASEKIT_IDEMPOTENCY_DEFAULT_TTL_SECS", "an hour")])
        .load()
        .expect_err("non-numeric ttl");
    assert!(err.to_string().contains("DEFAULT_TTL_SECS"), "{err}");
}

#[test]
fn sqlite_backend_without_path_fails_validation() {
    let cli = ConfigLayer {
        store: Some(StoreLayer {
            backend: Some(StoreBackend::Sqlite),
            ..Default::default()
        }),
        ..Default::default()
    };
    let result = ConfigResolver::new()
        .with_env_vars(Vec::<(String, String)>::new())
        .with_cli_overrides(cli)
        .load();
    assert!(matches!(result, Err(IdempotencyError::Config(_))));
}

#[test]
fn explain_lists_sources_and_warnings() {
    let resolved = ConfigResolver::new()
        .with_env_vars([("BASEKIT_IDEMPOTENCY_SWEEPER_INTERVAL_SECS", "60")])
        .load()
        .unwrap();

    let report = explain(&resolved);
    assert!(report.text.contains("sweeper.interval_secs"), "{}", report.text);
    assert!(report.text.contains("Environment"), "{}", report.text);
    assert_eq!(
        report.json["provenance"]["sweeper.interval_secs"],
        "environment"
    );
    assert!(
        report.json["warnings"]
            .as_array()
            .is_some_and(|warnings| !warnings.is_empty())
    );
}

#[tokio::test]
async fn resolved_config_builds_executor() {
    let tmp = tempdir().unwrap();
    let db = tmp.path().join("keys.db");
    let resolved = ConfigResolver::new()
        .with_env_vars([
            ("BASEKIT_IDEMPOTENCY_STORE_BACKEND", "sqlite"),
            ("BASEKIT_IDEMPOTENCY_STORE_PATH", db.to_str().unwrap()),
            ("BASEKIT_IDEMPOTENCY_DEFAULT_TTL_SECS", "15"),
        ])
        .load()
        .unwrap();

    let executor = IdempotencyExecutorBuilder::from_config(&resolved.config)
        .unwrap()
        .build();
    assert_eq!(executor.cache().backing_store().backend(), "sqlite");
    assert_eq!(executor.ttl_for("provision"), Duration::from_secs(15));
    assert_eq!(executor.ttl_for("rotate"), Duration::from_secs(300));
    assert!(db.exists());
}

use std::io::Write;

use trellis_core::config::AppConfig;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_iterations = 50
worker_count = 2
run_deadline_secs = 30
gate_sweep_interval_secs = 5
queue_depth = 16

[gateway]
bind = "0.0.0.0:9999"

[[gateway.api_keys]]
name = "ci"
key = "tk_ci_key"

[[gateway.api_keys]]
name = "ops"
key = "tk_ops_key"

[storage]
db_path = "/tmp/trellis-test.db"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_iterations, 50);
    assert_eq!(config.engine.worker_count, 2);
    assert_eq!(config.engine.run_deadline_secs, 30);
    assert_eq!(config.engine.gate_sweep_interval_secs, 5);
    assert_eq!(config.engine.queue_depth, 16);

    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
    assert_eq!(config.gateway.api_keys.len(), 2);
    assert_eq!(config.gateway.api_keys[0].name, "ci");
    assert_eq!(config.gateway.api_keys[1].key, "tk_ops_key");

    assert_eq!(config.storage.db_path, "/tmp/trellis-test.db");
}

#[test]
fn test_partial_config_fills_defaults() {
    let toml_content = r#"
[gateway]
bind = "127.0.0.1:7000"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.gateway.bind, "127.0.0.1:7000");
    assert!(config.gateway.api_keys.is_empty());
    assert_eq!(config.engine.max_iterations, 1000);
    assert_eq!(config.engine.worker_count, 8);
    assert_eq!(config.storage.db_path, "trellis.db");
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let config = AppConfig::load_or_default(std::path::Path::new("/nonexistent/trellis.toml"))
        .expect("defaults");

    assert_eq!(config.gateway.bind, "127.0.0.1:8790");
    assert_eq!(config.engine.run_deadline_secs, 300);
}

#[test]
fn test_malformed_toml_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_iterations = ").expect("write toml");

    assert!(AppConfig::load(tmp.path()).is_err());
}

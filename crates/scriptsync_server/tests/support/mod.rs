//! Shared integration-test server bootstrap helpers.

#![allow(dead_code)]

use axum_test::TestServer;
use scriptsync_server::{create_app, AppState, Config, Database};
use std::path::Path;
use tempfile::TempDir;

pub(crate) const TEST_TOKEN: &str = "test-token";

pub(crate) fn test_config_for_db_path(db_path: &Path) -> Config {
    Config {
        port: 0,
        db_path: db_path.to_str().expect("db path").to_string(),
        max_content_size: 10_000,
        api_token: None,
        rate_limit_per_minute: 0,
    }
}

pub(crate) fn test_state_for_config(config: Config) -> AppState {
    let db = Database::new(config.db_path.as_str()).expect("open db");
    AppState::new(config, db)
}

pub(crate) fn test_server_for_config(config: Config) -> TestServer {
    let app = create_app(test_state_for_config(config), false);
    TestServer::new(app).expect("server")
}

pub(crate) fn setup_test_server() -> (TestServer, TempDir) {
    setup_test_server_with(|_| {})
}

/// Start a server after letting the caller adjust its configuration.
pub(crate) fn setup_test_server_with(adjust: impl FnOnce(&mut Config)) -> (TestServer, TempDir) {
    let temp_dir = TempDir::new().expect("temp dir");
    let mut config = test_config_for_db_path(&temp_dir.path().join("db"));
    adjust(&mut config);
    (test_server_for_config(config), temp_dir)
}

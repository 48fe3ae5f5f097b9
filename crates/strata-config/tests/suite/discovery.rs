use std::ffi::OsString;
use std::sync::Mutex;

use strata_config::{
    discover_server_config, ExecutionMode, RepoOptions, ServerConfig, REPO_OPTIONS_FILE,
    SERVER_CONFIG_ENV_VAR,
};
use tempfile::tempdir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

struct EnvVarGuard {
    key: &'static str,
    prev: Option<OsString>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: &std::path::Path) -> Self {
        let prev = std::env::var_os(key);
        std::env::set_var(key, value);
        Self { key, prev }
    }

    fn unset(key: &'static str) -> Self {
        let prev = std::env::var_os(key);
        std::env::remove_var(key);
        Self { key, prev }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => std::env::set_var(self.key, v),
            None => std::env::remove_var(self.key),
        }
    }
}

#[test]
fn missing_server_config_yields_defaults() {
    let _lock = ENV_LOCK.lock().expect("ENV_LOCK mutex poisoned");
    let _env = EnvVarGuard::unset(SERVER_CONFIG_ENV_VAR);

    let (config, path) = ServerConfig::load(None).unwrap();
    assert_eq!(config, ServerConfig::default());
    assert_eq!(path, None);
}

#[test]
fn env_var_locates_server_config() {
    let _lock = ENV_LOCK.lock().expect("ENV_LOCK mutex poisoned");

    let dir = tempdir().unwrap();
    let config_path = dir.path().join("strata.toml");
    std::fs::write(
        &config_path,
        "[autoload]\ndb_path = \"db.json\"\nexecution_mode = \"cli\"\n",
    )
    .unwrap();
    let _env = EnvVarGuard::set(SERVER_CONFIG_ENV_VAR, &config_path);

    let (config, path) = ServerConfig::load(None).unwrap();
    assert_eq!(path.as_deref(), Some(config_path.as_path()));
    assert_eq!(config.autoload.db_path, "db.json");
    assert_eq!(config.autoload.execution_mode, ExecutionMode::Cli);
}

#[test]
fn explicit_path_wins_over_env_var() {
    let _lock = ENV_LOCK.lock().expect("ENV_LOCK mutex poisoned");

    let dir = tempdir().unwrap();
    let env_path = dir.path().join("env.toml");
    let explicit = dir.path().join("explicit.toml");
    let _env = EnvVarGuard::set(SERVER_CONFIG_ENV_VAR, &env_path);

    assert_eq!(discover_server_config(Some(&explicit)), Some(explicit.clone()));
}

#[test]
fn unreadable_explicit_config_is_an_error() {
    let dir = tempdir().unwrap();
    let err = ServerConfig::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
    assert!(err.to_string().contains("missing.toml"), "{err}");
}

#[test]
fn repo_options_root_is_the_directory_of_the_file() {
    let dir = tempdir().unwrap();
    let file = dir.path().join(REPO_OPTIONS_FILE);
    std::fs::write(&file, "[autoload]\ncache_breaker = \"x\"\n").unwrap();

    let options = RepoOptions::for_file(&file).unwrap();
    assert_eq!(options.root(), dir.path().canonicalize().unwrap());
    assert_eq!(options.autoload.cache_breaker, "x");
}

#[test]
fn malformed_repo_options_are_reported() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join(REPO_OPTIONS_FILE),
        "[autoload]\nindexed_method_attributes = \"Foo\"\n",
    )
    .unwrap();

    assert!(RepoOptions::load_for_root(dir.path()).is_err());
}

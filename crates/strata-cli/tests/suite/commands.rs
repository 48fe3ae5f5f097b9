use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

fn strata() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("strata"));
    cmd.env_remove("STRATA_CONFIG_PATH").env("RUST_LOG", "off");
    cmd
}

/// Writes a server config whose stores live under `stores`.
fn server_config(dir: &TempDir, stores: &TempDir) -> std::path::PathBuf {
    let template = stores.path().join("db_%{schema}.json");
    let config = dir.child("strata.toml");
    config
        .write_str(&format!(
            "[autoload]\ndb_path = {:?}\n\n[logging]\nlevel = \"off\"\n",
            template.display().to_string()
        ))
        .unwrap();
    config.path().to_path_buf()
}

fn repo() -> TempDir {
    let repo = TempDir::new().unwrap();
    repo.child("src/a.php").write_str("<?hh\n").unwrap();
    repo.child("src/b.hck").write_str("<?hh\n").unwrap();
    repo.child("README.md").write_str("readme\n").unwrap();
    repo.child(".strata.toml")
        .write_str("[autoload]\nindexed_method_attributes = [\"Foo\"]\n")
        .unwrap();
    repo
}

#[test]
fn help_mentions_core_commands() {
    strata().arg("--help").assert().success().stdout(
        predicate::str::contains("schema-version")
            .and(predicate::str::contains("db-path"))
            .and(predicate::str::contains("crawl"))
            .and(predicate::str::contains("index")),
    );
}

#[test]
fn schema_version_prints_the_constant() {
    strata()
        .arg("schema-version")
        .assert()
        .success()
        .stdout("1916337637\n");
}

#[test]
fn crawl_json_lists_matching_files() {
    let repo = repo();
    let output = strata()
        .arg("crawl")
        .arg(repo.path())
        .arg("--json")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["file_count"], 2);
    assert_eq!(v["exceeded_threshold"], false);
    assert_eq!(v["files"][0], "src/a.php");
    assert_eq!(v["files"][1], "src/b.hck");
}

#[test]
fn db_path_requires_a_template() {
    let repo = repo();
    strata()
        .arg("db-path")
        .arg(repo.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("autoload.db_path"));
}

#[test]
fn db_path_resolves_under_the_configured_template() {
    let dir = TempDir::new().unwrap();
    let stores = TempDir::new().unwrap();
    let config = server_config(&dir, &stores);
    let repo = repo();

    let output = strata()
        .arg("--config")
        .arg(&config)
        .arg("db-path")
        .arg(repo.path())
        .arg("--json")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let db_path = std::path::PathBuf::from(v["db_path"].as_str().unwrap());
    assert!(db_path.starts_with(stores.path()), "{}", db_path.display());
    let name = db_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("db_1916337637_"), "{name}");
}

#[test]
fn index_builds_a_session_and_persists_the_store() {
    let dir = TempDir::new().unwrap();
    let stores = TempDir::new().unwrap();
    let config = server_config(&dir, &stores);
    let repo = repo();

    let output = strata()
        .arg("--config")
        .arg(&config)
        .arg("index")
        .arg(repo.path())
        .arg("--json")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(v["files"], 2);
    assert_eq!(v["change_source"], "static");
    assert!(v["store"].as_str().unwrap().starts_with("WritableCreate("));

    let stores_written = std::fs::read_dir(stores.path()).unwrap().count();
    assert_eq!(stores_written, 1);
}

#[test]
fn index_rejects_malformed_watch_queries() {
    let dir = TempDir::new().unwrap();
    let stores = TempDir::new().unwrap();
    let config = server_config(&dir, &stores);
    let repo = TempDir::new().unwrap();
    repo.child(".strata.toml")
        .write_str("[autoload]\nquery = '{not valid json'\n")
        .unwrap();

    strata()
        .arg("--config")
        .arg(&config)
        .arg("index")
        .arg(repo.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid repository configuration"));
}

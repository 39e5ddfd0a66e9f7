//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

const HOSTS: &str = r#"{
  "web": { "hostname": "localhost" },
  "db": { "dockerImage": "postgres:16", "exposedPorts": "5432/tcp" }
}"#;

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    std::fs::write(dir.path().join("overcast.json"), HOSTS)
        .unwrap_or_else(|err| panic!("write hosts file: {err}"));
    dir
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("overcast");
    cmd.assert().failure().stderr(contains("Usage"));
}

#[test]
fn check_lists_backend_kinds() {
    let dir = workspace();
    let mut cmd = cargo_bin_cmd!("overcast");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .args(["check", "web", "db"]);
    cmd.assert()
        .success()
        .stdout("web\texisting\ndb\tcontainer\n");
}

#[test]
fn check_rejects_unknown_label() {
    let dir = workspace();
    let mut cmd = cargo_bin_cmd!("overcast");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .args(["check", "missing"]);
    cmd.assert().code(1).stderr(contains("missing"));
}

#[test]
fn up_keep_reports_existing_host() {
    let dir = workspace();
    let mut cmd = cargo_bin_cmd!("overcast");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("OVERCAST_LOG", "off")
        .args(["up", "--keep", "web"]);
    cmd.assert()
        .success()
        .stdout("web\tlocalhost\tlocalhost\n");
}

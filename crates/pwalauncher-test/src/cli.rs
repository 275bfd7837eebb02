//! CLI regression tests for the `pwalauncher` binary.
//!
//! These run the binary as a subprocess to pin down exit codes and startup
//! diagnostics. Requires the binary to be built (`cargo build -p pwalauncher`).

use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

use crate::gateway::find_binary;

fn pwalauncher() -> Command {
    let binary =
        find_binary().expect("pwalauncher binary not found, run `cargo build -p pwalauncher` first");
    let mut cmd = Command::new(binary);
    cmd.args(["--log-format", "pretty"]);
    cmd
}

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write config");
    path
}

// ---------------------------------------------------------------------------
// startup failures
// ---------------------------------------------------------------------------

#[test]
fn missing_config_exits_one() {
    pwalauncher()
        .arg("this-config-does-not-exist.yaml")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("not found"));
}

#[test]
fn ssl_port_without_ssl_exits_one() {
    let tmp = TempDir::new().expect("temp dir");
    let config = write(tmp.path(), "pwalauncher.yaml", "sslPort: 8443\n");

    pwalauncher()
        .arg(&config)
        .assert()
        .failure()
        .code(1)
        .stderr(contains("require ssl"));
}

#[test]
fn no_listener_exits_one() {
    let tmp = TempDir::new().expect("temp dir");
    let config = write(tmp.path(), "pwalauncher.yaml", "ports: [3000]\n");

    pwalauncher()
        .arg(&config)
        .assert()
        .failure()
        .code(1)
        .stderr(contains("at least one of port"));
}

#[test]
fn route_conflict_exits_one() {
    let tmp = TempDir::new().expect("temp dir");
    let config = write(
        tmp.path(),
        "pwalauncher.yaml",
        "port: 0\nports: [3000]\nproxy:\n  - path: '3000'\n    link: http://127.0.0.1:9000\n",
    );

    pwalauncher()
        .arg(&config)
        .assert()
        .failure()
        .code(1)
        .stderr(contains("route conflict"));
}

#[test]
fn unknown_config_extension_exits_one() {
    let tmp = TempDir::new().expect("temp dir");
    let config = write(tmp.path(), "pwalauncher.toml", "port = 80\n");

    pwalauncher()
        .arg(&config)
        .assert()
        .failure()
        .code(1)
        .stderr(contains("unsupported config format"));
}

#[test]
fn missing_certificate_file_exits_one() {
    let tmp = TempDir::new().expect("temp dir");
    let config = write(
        tmp.path(),
        "pwalauncher.json",
        r#"{"sslPort": 0, "ssl": {"key": "/nonexistent/key.pem", "cert": "/nonexistent/cert.pem"}}"#,
    );

    pwalauncher().arg(&config).assert().failure().code(1);
}

// ---------------------------------------------------------------------------
// flags
// ---------------------------------------------------------------------------

#[test]
fn invalid_log_format_exits_one() {
    let mut cmd = Command::new(find_binary().expect("pwalauncher binary"));
    cmd.args(["--log-format", "xml", "pwalauncher.yaml"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("invalid log format"));
}

#[test]
fn startup_event_names_the_service() {
    let mut cmd = Command::new(find_binary().expect("pwalauncher binary"));
    cmd.env_remove("RUST_LOG")
        .arg("this-config-does-not-exist.yaml")
        .assert()
        .failure()
        .stdout(contains(r#""event":"startup""#))
        .stdout(contains(r#""service":"pwalauncher""#));
}

#[test]
fn help_lists_flags() {
    let mut cmd = Command::new(find_binary().expect("pwalauncher binary"));
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("--log-level"))
        .stdout(contains("--log-format"));
}

#[test]
fn unknown_flag_exits_two() {
    // clap reports usage errors with exit code 2
    let mut cmd = Command::new(find_binary().expect("pwalauncher binary"));
    cmd.arg("--no-such-flag").assert().failure().code(2);
}

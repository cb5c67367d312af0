use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_claude-usage")
}

fn missing_credentials(home: &TempDir) -> PathBuf {
    home.path().join("no-such-credentials.json")
}

fn run_cmd(home: &TempDir, credentials: &PathBuf, args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .env("CLAUDE_USAGE_HOME", home.path())
        .env("CLAUDE_USAGE_CREDENTIALS", credentials)
        .env_remove("ANTHROPIC_ADMIN_API_KEY")
        .env("RUST_LOG", "debug")
        .output()
        .expect("run claude-usage")
}

#[test]
fn exits_with_error_when_no_credentials_exist() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &missing_credentials(&home), &[]);

    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No credentials found"), "stderr: {stderr}");
}

#[test]
fn first_start_writes_default_config_and_log_dir() {
    let home = TempDir::new().expect("temp home");
    let _ = run_cmd(&home, &missing_credentials(&home), &[]);

    let config = fs::read_to_string(home.path().join("config.toml")).expect("config written");
    assert!(config.contains("retention_seconds = 604800"));
    assert!(config.contains("code_poll_seconds = 30"));
    assert!(home.path().join("logs").is_dir());
}

#[test]
fn startup_failure_is_logged_to_file() {
    let home = TempDir::new().expect("temp home");
    let _ = run_cmd(&home, &missing_credentials(&home), &[]);

    let logs: String = fs::read_dir(home.path().join("logs"))
        .expect("log dir")
        .flatten()
        .filter_map(|entry| fs::read_to_string(entry.path()).ok())
        .collect();
    assert!(logs.contains("unable to determine monitoring mode"), "logs: {logs}");
}

#[test]
fn rejects_unknown_mode() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &missing_credentials(&home), &["--mode", "web"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid value 'web'"), "stderr: {stderr}");
}

#[test]
fn invalid_admin_key_fails_before_the_dashboard_starts() {
    let home = TempDir::new().expect("temp home");
    let credentials = home.path().join(".credentials.json");
    fs::write(
        &credentials,
        r#"{"anthropicConsole": {"adminApiKey": "sk-ant-api03-not-an-admin"}}"#,
    )
    .expect("write credentials");

    let output = run_cmd(&home, &credentials, &[]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("sk-ant-admin"), "stderr: {stderr}");
}

#[test]
fn existing_config_is_preserved() {
    let home = TempDir::new().expect("temp home");
    fs::write(home.path().join("config.toml"), "retention_seconds = 86400\n").expect("seed config");

    let _ = run_cmd(&home, &missing_credentials(&home), &[]);
    let config = fs::read_to_string(home.path().join("config.toml")).expect("read config");
    assert_eq!(config, "retention_seconds = 86400\n");
}

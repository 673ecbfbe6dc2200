#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::HomeEnvGuard;
use predicates::str::contains;
use std::process::{Child, Command as StdCommand};
use std::time::Duration;
use tempfile::tempdir;

struct RunGuard(Child);

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_run(home: &std::path::Path, config_path: &std::path::Path) -> RunGuard {
    let child = StdCommand::new(assert_cmd::cargo::cargo_bin!("svcinitd"))
        .arg("run")
        .arg("--config")
        .arg(config_path)
        .env("HOME", home)
        .spawn()
        .expect("spawn svcinitd run");
    std::thread::sleep(Duration::from_millis(500));
    RunGuard(child)
}

#[test]
fn setprop_and_getprop_round_trip_through_the_cli() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).expect("create home");
    let _guard = HomeEnvGuard::set(&home);

    let config_path = temp.path().join("svcinit.yaml");
    std::fs::write(
        &config_path,
        r#"version: "1"
services:
  demo:
    argv: ["/bin/sleep", "30"]
"#,
    )
    .expect("write config");

    let _run = spawn_run(&home, &config_path);

    Command::new(assert_cmd::cargo::cargo_bin!("svcinitd"))
        .env("HOME", &home)
        .args(["setprop", "debug.cli.example", "hi"])
        .assert()
        .success();

    Command::new(assert_cmd::cargo::cargo_bin!("svcinitd"))
        .env("HOME", &home)
        .args(["getprop", "debug.cli.example"])
        .assert()
        .success()
        .stdout(contains("hi"));
}

#[test]
fn status_reports_running_service_state() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).expect("create home");
    let _guard = HomeEnvGuard::set(&home);

    let config_path = temp.path().join("svcinit.yaml");
    std::fs::write(
        &config_path,
        r#"version: "1"
services:
  demo:
    argv: ["/bin/sleep", "30"]
"#,
    )
    .expect("write config");

    let _run = spawn_run(&home, &config_path);
    std::thread::sleep(Duration::from_millis(500));

    Command::new(assert_cmd::cargo::cargo_bin!("svcinitd"))
        .env("HOME", &home)
        .args(["status", "demo"])
        .assert()
        .success()
        .stdout(contains("running"));
}

#[test]
fn stop_command_transitions_service_to_stopped() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).expect("create home");
    let _guard = HomeEnvGuard::set(&home);

    let config_path = temp.path().join("svcinit.yaml");
    std::fs::write(
        &config_path,
        r#"version: "1"
services:
  demo:
    argv: ["/bin/sleep", "30"]
"#,
    )
    .expect("write config");

    let _run = spawn_run(&home, &config_path);
    std::thread::sleep(Duration::from_millis(500));

    Command::new(assert_cmd::cargo::cargo_bin!("svcinitd"))
        .env("HOME", &home)
        .args(["stop", "demo"])
        .assert()
        .success();

    std::thread::sleep(Duration::from_millis(300));

    Command::new(assert_cmd::cargo::cargo_bin!("svcinitd"))
        .env("HOME", &home)
        .args(["status", "demo"])
        .assert()
        .success()
        .stdout(contains("stopped"));
}

#[path = "common/mod.rs"]
mod common;

use common::{HomeEnvGuard, spawn_supervisor, wait_for_property};
use svcinit::constants::SERVICE_STATE_PREFIX;
use svcinit::property::client;
use tempfile::tempdir;

#[test]
fn boot_start_respects_depends_on_ordering() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());

    let config_path = temp.path().join("svcinit.yaml");
    std::fs::write(
        &config_path,
        r#"version: "1"
services:
  first:
    argv: ["/bin/sleep", "5"]
  second:
    argv: ["/bin/sleep", "5"]
    depends_on: ["first"]
"#,
    )
    .expect("write config");

    let socket_path = spawn_supervisor(&config_path);

    wait_for_property(&socket_path, &format!("{SERVICE_STATE_PREFIX}first"), "running");
    wait_for_property(&socket_path, &format!("{SERVICE_STATE_PREFIX}second"), "running");
}

#[test]
fn disabled_service_does_not_start_at_boot() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());

    let config_path = temp.path().join("svcinit.yaml");
    std::fs::write(
        &config_path,
        r#"version: "1"
services:
  demo:
    argv: ["/bin/sleep", "5"]
    disabled: true
"#,
    )
    .expect("write config");

    let socket_path = spawn_supervisor(&config_path);

    // Give the boot sequence a moment; the service must never reach running.
    std::thread::sleep(std::time::Duration::from_millis(300));
    let state = client::getprop(&socket_path, &format!("{SERVICE_STATE_PREFIX}demo"))
        .expect("getprop");
    assert_ne!(state.as_deref(), Some("running"));
}

#[test]
fn oneshot_service_transitions_to_stopped_after_exit() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());

    let config_path = temp.path().join("svcinit.yaml");
    std::fs::write(
        &config_path,
        r#"version: "1"
services:
  demo:
    argv: ["/bin/true"]
    oneshot: true
"#,
    )
    .expect("write config");

    let socket_path = spawn_supervisor(&config_path);

    wait_for_property(&socket_path, &format!("{SERVICE_STATE_PREFIX}demo"), "stopped");
}

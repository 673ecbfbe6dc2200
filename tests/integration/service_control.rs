#[path = "common/mod.rs"]
mod common;

use common::{HomeEnvGuard, spawn_supervisor, wait_for_property, write_config};
use svcinit::constants::SERVICE_STATE_PREFIX;
use svcinit::property::client;
use tempfile::tempdir;

#[test]
fn restart_transitions_through_restarting_back_to_running() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());
    let config = write_config(temp.path(), "demo", &["/bin/sleep", "5"]);
    let socket_path = spawn_supervisor(&config);

    let state_name = format!("{SERVICE_STATE_PREFIX}demo");
    wait_for_property(&socket_path, &state_name, "running");

    let code = client::ctl(&socket_path, "restart", "demo").expect("ctl restart");
    assert_eq!(code, 0);

    wait_for_property(&socket_path, &state_name, "running");
}

#[test]
fn two_independent_services_are_controlled_separately() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());

    let config_path = temp.path().join("svcinit.yaml");
    std::fs::write(
        &config_path,
        r#"version: "1"
services:
  alpha:
    argv: ["/bin/sleep", "5"]
  beta:
    argv: ["/bin/sleep", "5"]
"#,
    )
    .expect("write config");
    let socket_path = spawn_supervisor(&config_path);

    let alpha_state = format!("{SERVICE_STATE_PREFIX}alpha");
    let beta_state = format!("{SERVICE_STATE_PREFIX}beta");
    wait_for_property(&socket_path, &alpha_state, "running");
    wait_for_property(&socket_path, &beta_state, "running");

    client::ctl(&socket_path, "stop", "alpha").expect("ctl stop");
    wait_for_property(&socket_path, &alpha_state, "stopped");

    let beta = client::getprop(&socket_path, &beta_state).expect("getprop");
    assert_eq!(beta.as_deref(), Some("running"));
}

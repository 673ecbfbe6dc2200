mod common;

use common::{HomeEnvGuard, spawn_supervisor, wait_for_property, write_config};
use svcinit::constants::{RESTORECON_RECURSIVE_PROPERTY, SERVICE_STATE_PREFIX};
use svcinit::property::client;
use tempfile::tempdir;

#[test]
fn ctl_stop_then_start_round_trips_service_state() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());
    let config = write_config(temp.path(), "demo", &["/bin/sleep", "5"]);
    let socket_path = spawn_supervisor(&config);

    let state_name = format!("{SERVICE_STATE_PREFIX}demo");
    wait_for_property(&socket_path, &state_name, "running");

    let code = client::ctl(&socket_path, "stop", "demo").expect("ctl stop");
    assert_eq!(code, 0);
    wait_for_property(&socket_path, &state_name, "stopped");

    let code = client::ctl(&socket_path, "start", "demo").expect("ctl start");
    assert_eq!(code, 0);
    wait_for_property(&socket_path, &state_name, "running");
}

#[test]
fn ctl_request_for_unknown_service_reports_control_message_error() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());
    let config = write_config(temp.path(), "demo", &["/bin/true"]);
    let socket_path = spawn_supervisor(&config);

    let code = client::ctl(&socket_path, "start", "nonexistent").expect("ctl start");
    assert_eq!(code, 9); // PropertyErrorCode::ControlMessageError
}

#[test]
fn restorecon_recursive_write_is_echoed_back_by_the_worker() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());
    let config = write_config(temp.path(), "demo", &["/bin/true"]);
    let socket_path = spawn_supervisor(&config);

    let code = client::setprop(&socket_path, RESTORECON_RECURSIVE_PROPERTY, "/data/app")
        .expect("setprop");
    assert_eq!(code, 0);

    wait_for_property(&socket_path, RESTORECON_RECURSIVE_PROPERTY, "/data/app");
}

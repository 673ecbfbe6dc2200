mod common;

use common::{HomeEnvGuard, spawn_supervisor, write_config};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use svcinit::constants::{LEGACY_NAME_FIELD, LEGACY_VALUE_FIELD};
use svcinit::property::client;
use tempfile::tempdir;

const CMD_SETPROP: u32 = 1;

fn legacy_frame(name: &str, value: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&CMD_SETPROP.to_ne_bytes());
    let mut name_field = vec![0u8; LEGACY_NAME_FIELD];
    name_field[..name.len()].copy_from_slice(name.as_bytes());
    buf.extend_from_slice(&name_field);
    let mut value_field = vec![0u8; LEGACY_VALUE_FIELD];
    value_field[..value.len()].copy_from_slice(value.as_bytes());
    buf.extend_from_slice(&value_field);
    buf
}

#[test]
fn setprop_then_getprop_round_trips_over_the_socket() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());
    let config = write_config(temp.path(), "demo", &["/bin/true"]);
    let socket_path = spawn_supervisor(&config);

    let code = client::setprop(&socket_path, "debug.example", "hello").expect("setprop");
    assert_eq!(code, 0);

    let value = client::getprop(&socket_path, "debug.example").expect("getprop");
    assert_eq!(value, Some("hello".to_string()));
}

#[test]
fn getprop_on_unset_name_returns_none() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());
    let config = write_config(temp.path(), "demo", &["/bin/true"]);
    let socket_path = spawn_supervisor(&config);

    let value = client::getprop(&socket_path, "debug.never.set").expect("getprop");
    assert_eq!(value, None);
}

#[test]
fn legacy_fixed_width_setprop_frame_is_accepted() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());
    let config = write_config(temp.path(), "demo", &["/bin/true"]);
    let socket_path = spawn_supervisor(&config);

    let mut stream = UnixStream::connect(&socket_path).expect("connect");
    stream.write_all(&legacy_frame("debug.legacy", "value")).expect("write frame");

    let mut code_buf = [0u8; 4];
    stream.read_exact(&mut code_buf).expect("read result code");
    assert_eq!(u32::from_ne_bytes(code_buf), 0);

    let value = client::getprop(&socket_path, "debug.legacy").expect("getprop");
    assert_eq!(value, Some("value".to_string()));
}

#[test]
fn unknown_command_word_is_rejected() {
    let temp = tempdir().expect("tempdir");
    let _guard = HomeEnvGuard::set(temp.path());
    let config = write_config(temp.path(), "demo", &["/bin/true"]);
    let socket_path = spawn_supervisor(&config);

    let mut stream = UnixStream::connect(&socket_path).expect("connect");
    stream.write_all(&99u32.to_ne_bytes()).expect("write bogus command");

    let mut code_buf = [0u8; 4];
    stream.read_exact(&mut code_buf).expect("read result code");
    assert_ne!(u32::from_ne_bytes(code_buf), 0);
}

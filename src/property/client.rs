//! Client-side wire helpers for the `setprop`/`getprop`/`start`/`stop`/
//! `restart`/`status` CLI subcommands. These talk to the running
//! property server over the same socket real clients use; no special
//! privilege is assumed beyond what the socket's mode bits allow.
use crate::constants::{CLIENT_REQUEST_DEADLINE, CONTROL_PREFIX};
use crate::error::PropertyError;
use crate::property::protocol::read_length_prefixed_reply;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

const CMD_SETPROP2: u32 = 2;
const CMD_GETPROP: u32 = 3;

fn connect(socket_path: &Path) -> Result<UnixStream, PropertyError> {
    let stream = UnixStream::connect(socket_path).map_err(PropertyError::Io)?;
    stream.set_read_timeout(Some(CLIENT_REQUEST_DEADLINE)).map_err(PropertyError::Io)?;
    Ok(stream)
}

fn write_frame(stream: &mut UnixStream, name: &str, value: &str) -> Result<(), PropertyError> {
    stream.write_all(&CMD_SETPROP2.to_ne_bytes()).map_err(PropertyError::Io)?;
    stream.write_all(&(name.len() as u32).to_ne_bytes()).map_err(PropertyError::Io)?;
    stream.write_all(name.as_bytes()).map_err(PropertyError::Io)?;
    stream.write_all(&(value.len() as u32).to_ne_bytes()).map_err(PropertyError::Io)?;
    stream.write_all(value.as_bytes()).map_err(PropertyError::Io)?;
    Ok(())
}

fn read_code(stream: &mut UnixStream) -> Result<u32, PropertyError> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).map_err(PropertyError::Io)?;
    Ok(u32::from_ne_bytes(buf))
}

/// Sends a `SETPROP2` request and returns the wire result code.
pub fn setprop(socket_path: &Path, name: &str, value: &str) -> Result<u32, PropertyError> {
    let mut stream = connect(socket_path)?;
    write_frame(&mut stream, name, value)?;
    read_code(&mut stream)
}

/// Sends a `ctl.<verb>` control request, naming `target` as the service the
/// verb applies to.
pub fn ctl(socket_path: &Path, verb: &str, target: &str) -> Result<u32, PropertyError> {
    let mut stream = connect(socket_path)?;
    write_frame(&mut stream, &format!("{CONTROL_PREFIX}{verb}"), target)?;
    read_code(&mut stream)
}

/// Sends a `ctl.exec` control request carrying the
/// `[seclabel [uid [gid supp_gid*]] -- cmd args...]` argv, space-joined, and
/// returns the wire result code.
pub fn exec_oneshot(socket_path: &Path, argv: &[String]) -> Result<u32, PropertyError> {
    let mut stream = connect(socket_path)?;
    write_frame(&mut stream, &format!("{CONTROL_PREFIX}exec"), &argv.join(" "))?;
    read_code(&mut stream)
}

/// Sends a `GETPROP` request and returns the current value, if any.
pub fn getprop(socket_path: &Path, name: &str) -> Result<Option<String>, PropertyError> {
    let mut stream = connect(socket_path)?;
    stream.write_all(&CMD_GETPROP.to_ne_bytes()).map_err(PropertyError::Io)?;
    stream.write_all(&(name.len() as u32).to_ne_bytes()).map_err(PropertyError::Io)?;
    stream.write_all(name.as_bytes()).map_err(PropertyError::Io)?;

    let code = read_code(&mut stream)?;
    if code != crate::error::PropertyErrorCode::Success.as_u32() {
        return Err(PropertyError::InvalidName(name.to_string()));
    }
    let value = read_length_prefixed_reply(&mut stream).map_err(PropertyError::Io)?;
    if value.is_empty() { Ok(None) } else { Ok(Some(value)) }
}

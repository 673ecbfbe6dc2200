//! Client-socket wire protocol.
use crate::constants::{
    CLIENT_REQUEST_DEADLINE, FRAME_STRING_MAX, LEGACY_NAME_FIELD, LEGACY_VALUE_FIELD,
};
use crate::error::PropertyError;
use std::io::{Read, Write};
use std::time::Instant;

/// Command word read first on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Fixed-width legacy `SETPROP`.
    SetProp,
    /// Length-prefixed `SETPROP2`.
    SetProp2,
    /// Length-prefixed `GETPROP`; an addition to the upstream write-only
    /// protocol so `getprop`/`status` clients have a socket-level read path
    /// instead of reaching into the supervisor's in-memory store directly.
    GetProp,
}

const CMD_SETPROP: u32 = 1;
const CMD_SETPROP2: u32 = 2;
const CMD_GETPROP: u32 = 3;

impl Command {
    /// Decodes the `uint32` command word.
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            CMD_SETPROP => Some(Command::SetProp),
            CMD_SETPROP2 => Some(Command::SetProp2),
            CMD_GETPROP => Some(Command::GetProp),
            _ => None,
        }
    }

    /// Wire value for this command word.
    pub fn as_u32(self) -> u32 {
        match self {
            Command::SetProp => CMD_SETPROP,
            Command::SetProp2 => CMD_SETPROP2,
            Command::GetProp => CMD_GETPROP,
        }
    }
}

/// A decoded `SETPROP`/`SETPROP2` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetPropRequest {
    /// Property name.
    pub name: String,
    /// Property value.
    pub value: String,
    /// Whether this arrived as the fixed-width legacy `SETPROP` command
    /// (`true`) or `SETPROP2` (`false`). Legacy callers get no reply body —
    /// the result code is implicit — while `SETPROP2` always gets one.
    pub legacy: bool,
}

/// A single request decoded off the client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// `SETPROP`/`SETPROP2`/`ctl.*` write.
    Set(SetPropRequest),
    /// `GETPROP` read.
    Get {
        /// Property name to look up.
        name: String,
    },
}

/// Tracks the 2000ms total budget across every read of one request.
pub struct Deadline {
    started: Instant,
}

impl Deadline {
    /// Starts a new deadline clock.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Remaining budget, or `None` once exhausted.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        CLIENT_REQUEST_DEADLINE.checked_sub(self.started.elapsed())
    }

    /// Whether the budget has fully elapsed.
    pub fn expired(&self) -> bool {
        self.remaining().is_none()
    }
}

fn read_exact_within_deadline(
    stream: &mut impl Read,
    buf: &mut [u8],
    deadline: &Deadline,
) -> Result<(), PropertyError> {
    if deadline.expired() {
        return Err(PropertyError::Timeout);
    }
    stream.read_exact(buf).map_err(PropertyError::Io)
}

fn read_u32(stream: &mut impl Read, deadline: &Deadline) -> Result<u32, PropertyError> {
    let mut buf = [0u8; 4];
    read_exact_within_deadline(stream, &mut buf, deadline)?;
    Ok(u32::from_ne_bytes(buf))
}

fn read_fixed_cstr(
    stream: &mut impl Read,
    width: usize,
    deadline: &Deadline,
) -> Result<String, PropertyError> {
    let mut buf = vec![0u8; width];
    read_exact_within_deadline(stream, &mut buf, deadline)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

fn read_length_prefixed(
    stream: &mut impl Read,
    deadline: &Deadline,
) -> Result<String, PropertyError> {
    let len = read_u32(stream, deadline)? as usize;
    if len > FRAME_STRING_MAX {
        return Err(PropertyError::FrameTooLarge);
    }
    let mut buf = vec![0u8; len];
    read_exact_within_deadline(stream, &mut buf, deadline)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Reads one full request off `stream`, enforcing the deadline and the
/// 65535-byte frame-string limit.
pub fn read_request(
    stream: &mut impl Read,
    deadline: &Deadline,
) -> Result<ClientRequest, PropertyError> {
    let cmd_word = read_u32(stream, deadline)?;
    match Command::from_wire(cmd_word) {
        Some(Command::SetProp) => {
            let name = read_fixed_cstr(stream, LEGACY_NAME_FIELD, deadline)?;
            let value = read_fixed_cstr(stream, LEGACY_VALUE_FIELD, deadline)?;
            Ok(ClientRequest::Set(SetPropRequest { name, value, legacy: true }))
        }
        Some(Command::SetProp2) => {
            let name = read_length_prefixed(stream, deadline)?;
            let value = read_length_prefixed(stream, deadline)?;
            Ok(ClientRequest::Set(SetPropRequest { name, value, legacy: false }))
        }
        Some(Command::GetProp) => {
            let name = read_length_prefixed(stream, deadline)?;
            Ok(ClientRequest::Get { name })
        }
        None => Err(PropertyError::InvalidCmd(cmd_word)),
    }
}

/// Writes a `SETPROP2`-shaped length-prefixed frame (used by clients to send
/// requests, and reused here for the `GETPROP` reply payload).
pub fn write_length_prefixed(stream: &mut impl Write, value: &str) -> std::io::Result<()> {
    stream.write_all(&(value.len() as u32).to_ne_bytes())?;
    stream.write_all(value.as_bytes())
}

/// Reads one length-prefixed string reply (the `GETPROP` response body, sent
/// after the usual `u32` result code).
pub fn read_length_prefixed_reply(stream: &mut impl Read) -> std::io::Result<String> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_ne_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

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

    fn setprop2_frame(name: &str, value: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CMD_SETPROP2.to_ne_bytes());
        buf.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_ne_bytes());
        buf.extend_from_slice(value.as_bytes());
        buf
    }

    fn getprop_frame(name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CMD_GETPROP.to_ne_bytes());
        buf.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf
    }

    #[test]
    fn reads_legacy_setprop_frame() {
        let frame = legacy_frame("debug.foo", "bar");
        let mut cursor = Cursor::new(frame);
        let request = read_request(&mut cursor, &Deadline::start()).unwrap();
        assert_eq!(request, ClientRequest::Set(SetPropRequest {
            name: "debug.foo".to_string(),
            value: "bar".to_string(),
            legacy: true,
        }));
    }

    #[test]
    fn reads_setprop2_frame() {
        let frame = setprop2_frame("debug.foo", "a much longer value than the legacy field allows");
        let mut cursor = Cursor::new(frame);
        let request = read_request(&mut cursor, &Deadline::start()).unwrap();
        assert_eq!(request, ClientRequest::Set(SetPropRequest {
            name: "debug.foo".to_string(),
            value: "a much longer value than the legacy field allows".to_string(),
            legacy: false,
        }));
    }

    #[test]
    fn reads_getprop_frame() {
        let frame = getprop_frame("ro.product.name");
        let mut cursor = Cursor::new(frame);
        let request = read_request(&mut cursor, &Deadline::start()).unwrap();
        assert_eq!(request, ClientRequest::Get { name: "ro.product.name".to_string() });
    }

    #[test]
    fn rejects_unknown_command() {
        let mut cursor = Cursor::new(99u32.to_ne_bytes().to_vec());
        let err = read_request(&mut cursor, &Deadline::start()).unwrap_err();
        assert!(matches!(err, PropertyError::InvalidCmd(99)));
    }

    #[test]
    fn rejects_oversized_setprop2_string() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CMD_SETPROP2.to_ne_bytes());
        buf.extend_from_slice(&((FRAME_STRING_MAX + 1) as u32).to_ne_bytes());
        let mut cursor = Cursor::new(buf);
        let err = read_request(&mut cursor, &Deadline::start()).unwrap_err();
        assert!(matches!(err, PropertyError::FrameTooLarge));
    }
}

//! Property Store (C4) and Property Server (C5).
pub mod boot_props;
pub mod client;
pub mod info;
pub mod protocol;
pub mod server;
pub mod store;

use std::os::fd::RawFd;

/// Tagged union carried on the internal socketpair between the property
/// server thread and the supervisor main loop.
#[derive(Debug, Clone)]
pub enum InternalMessage {
    /// A property was successfully set; carries the final `(name, value)`.
    PropertyChanged {
        /// Property name.
        name: String,
        /// New value.
        value: String,
    },
    /// A `ctl.*` write was authorized by the server and forwarded for
    /// dispatch to the registry/service layer.
    ControlRequest {
        /// Control message kind, e.g. `"start"`, `"stop"`, `"restart"`.
        msg: String,
        /// Target service name (legacy) or `name$value` composite context
        /// subject (full check); the server has already authorized this.
        name: String,
        /// Originating client pid, for logging.
        pid: i32,
        /// Transferred client socket descriptor, when a reply must be sent
        /// directly back to the caller (API > Q style fd passing).
        reply_fd: Option<RawFd>,
    },
}

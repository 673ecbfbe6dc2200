//! Error handling for svcinit.
use thiserror::Error;

/// Errors raised while loading or validating the service configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A service name was declared more than once.
    #[error("duplicate service name '{0}'")]
    DuplicateService(String),

    /// A service declared a dependency that does not exist.
    #[error("service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The service with an invalid dependency reference.
        service: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {cycle}")]
    DependencyCycle {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },

    /// A service declared more supplementary groups than the configured maximum.
    #[error("service '{service}' declares too many supplementary groups ({count} > {max})")]
    TooManySupplementaryGroups {
        /// Offending service.
        service: String,
        /// Number of groups declared.
        count: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Errors raised by the supervisor while applying lifecycle operations to a
/// [`crate::service::Service`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error loading configuration at startup or reload.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error applying credentials/sandboxing before exec.
    #[error("privilege setup failed for service '{service}': {source}")]
    Privilege {
        /// The service whose child setup failed.
        service: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Error forking or execing a service's process.
    #[error("failed to spawn service '{service}': {source}")]
    Spawn {
        /// Offending service.
        service: String,
        /// The underlying OS error.
        #[source]
        source: nix::errno::Errno,
    },

    /// A named service was not found in the registry.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// A control request could not be authorized.
    #[error("permission denied for control request on '{0}'")]
    PermissionDenied(String),

    /// An operation was attempted on a service still enqueued in the
    /// delayed-services list.
    #[error("service '{0}' is delayed pending services-updated")]
    Delayed(String),

    /// Error querying or writing `/proc/<pid>/...` files.
    #[error("proc filesystem operation failed: {0}")]
    Proc(std::io::Error),

    /// A `MakeTemporaryOneshotService` argv failed to parse.
    #[error("invalid exec request: {0}")]
    InvalidExecRequest(String),
}

/// Result codes returned by the Property Store's `Set` operation,
/// kept distinct from [`PropertyError`] so "expected" rejections (read-only,
/// invalid name/value) don't have to be logged as errors by callers that
/// only care about the wire-level response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetResult {
    /// The property was stored.
    Success,
    /// `name` failed the legality check.
    InvalidName,
    /// `value` failed the length or type check.
    InvalidValue,
    /// `name` is a `ro.*` property that was already set.
    ReadOnlyAlready,
    /// The underlying store rejected the write for an implementation reason.
    AddFailed,
}

/// Wire-level response codes for the property-service socket protocol.
/// Numeric discriminants are fixed and must never be renumbered once a
/// client ships against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PropertyErrorCode {
    /// Request succeeded.
    Success = 0,
    /// Failed to read the command word.
    ReadCmd = 1,
    /// Failed to read the frame payload within the deadline.
    ReadData = 2,
    /// Unknown command word.
    InvalidCmd = 3,
    /// Property name failed legality checks.
    InvalidName = 4,
    /// Property value failed legality or type checks.
    InvalidValue = 5,
    /// Caller was not authorized to set this property.
    PermissionDenied = 6,
    /// The store rejected the write.
    SetFailed = 7,
    /// Property is `ro.*` and already set.
    ReadOnlyAlready = 8,
    /// A `ctl.*` control request could not be authorized or dispatched.
    ControlMessageError = 9,
}

impl PropertyErrorCode {
    /// Wire value sent on the socket.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

impl From<SetResult> for PropertyErrorCode {
    fn from(value: SetResult) -> Self {
        match value {
            SetResult::Success => PropertyErrorCode::Success,
            SetResult::InvalidName => PropertyErrorCode::InvalidName,
            SetResult::InvalidValue => PropertyErrorCode::InvalidValue,
            SetResult::ReadOnlyAlready => PropertyErrorCode::ReadOnlyAlready,
            SetResult::AddFailed => PropertyErrorCode::SetFailed,
        }
    }
}

/// Errors raised by the property server while handling a single client
/// request. Every variant maps onto exactly one
/// [`PropertyErrorCode`]; the server converts to the wire code at the
/// connection boundary and otherwise keeps the richer context for logging.
#[derive(Debug, Error)]
pub enum PropertyError {
    /// I/O error reading or writing the client socket.
    #[error("property socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The 2000ms per-request deadline elapsed before the frame completed.
    #[error("request exceeded the 2000ms deadline")]
    Timeout,

    /// A length-prefixed string exceeded the 65535-byte limit.
    #[error("string exceeds maximum frame length")]
    FrameTooLarge,

    /// The command word did not match a known request type.
    #[error("unknown command word {0}")]
    InvalidCmd(u32),

    /// `name` failed legality checks.
    #[error("invalid property name '{0}'")]
    InvalidName(String),

    /// `value` failed legality or type checks.
    #[error("invalid property value for '{0}'")]
    InvalidValue(String),

    /// Caller lacked permission to set this property.
    #[error("permission denied setting '{0}'")]
    PermissionDenied(String),

    /// A `ctl.*` control request failed authorization or dispatch.
    #[error("control message failed: {0}")]
    ControlMessage(String),
}

impl From<&PropertyError> for PropertyErrorCode {
    fn from(err: &PropertyError) -> Self {
        match err {
            PropertyError::Io(_) | PropertyError::Timeout | PropertyError::FrameTooLarge => {
                PropertyErrorCode::ReadData
            }
            PropertyError::InvalidCmd(_) => PropertyErrorCode::InvalidCmd,
            PropertyError::InvalidName(_) => PropertyErrorCode::InvalidName,
            PropertyError::InvalidValue(_) => PropertyErrorCode::InvalidValue,
            PropertyError::PermissionDenied(_) => PropertyErrorCode::PermissionDenied,
            PropertyError::ControlMessage(_) => PropertyErrorCode::ControlMessageError,
        }
    }
}

/// Implement `From` for poisoned-mutex recovery, mirroring the convention
/// used throughout the supervisor for shared registry/store state.
impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::Proc(std::io::Error::other(err.to_string()))
    }
}

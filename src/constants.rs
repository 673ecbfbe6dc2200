//! Constants and configuration values for the supervisor and property service.
//!
//! This module centralizes magic numbers, string constants, and protocol
//! limits used throughout the crate to keep them in one auditable place.

use std::{cmp::Ordering, time::Duration};

// ============================================================================
// Lock Management and Ordering
// ============================================================================

/// Typed lock abstraction for enforcing a consistent lock acquisition order
/// across the supervisor and property-server threads.
///
/// # Lock Acquisition Rules
///
/// Locks MUST be acquired in ascending order of their discriminant values:
/// 1. `Registry` - the Service Registry's name -> Service map
/// 2. `PropertyStore` - the in-memory property map
/// 3. `PropertyInfo` - the PropertyInfo trie (rebuilt rarely, read often)
/// 4. `RestoreconQueue` - the async-restorecon worker's pending-path queue
///
/// # Example
/// ```ignore
/// // Correct: acquiring in order
/// let _registry = lock(Lock::Registry);
/// let _store = lock(Lock::PropertyStore);
///
/// // Incorrect: would risk deadlock against the reverse order
/// // let _store = lock(Lock::PropertyStore);
/// // let _registry = lock(Lock::Registry); // WRONG
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Lock {
    /// The Service Registry (C3).
    Registry = 1,
    /// The Property Store's in-memory map (C4).
    PropertyStore = 2,
    /// The PropertyInfo trie (C4).
    PropertyInfo = 3,
    /// The async-restorecon worker's queue (C5).
    RestoreconQueue = 4,
}

impl Lock {
    /// Numeric priority; lower must be acquired before higher.
    pub const fn priority(&self) -> u8 {
        *self as u8
    }

    /// Human-readable name, used in contention diagnostics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::PropertyStore => "property_store",
            Self::PropertyInfo => "property_info",
            Self::RestoreconQueue => "restorecon_queue",
        }
    }

    /// Checks whether acquiring `other` after `self` respects lock order.
    pub const fn can_acquire_after(&self, other: &Self) -> bool {
        self.priority() > other.priority()
    }
}

impl PartialOrd for Lock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Lock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority())
    }
}

// ============================================================================
// Property name/value limits
// ============================================================================

/// Maximum length of a property name, inclusive.
pub const PROPERTY_NAME_MAX: usize = 31;

/// Maximum length of a property value, inclusive.
pub const PROPERTY_VALUE_MAX: usize = 91;

/// Legacy `SETPROP` fixed name field width (null-terminated).
pub const LEGACY_NAME_FIELD: usize = 32;

/// Legacy `SETPROP` fixed value field width (null-terminated).
pub const LEGACY_VALUE_FIELD: usize = 92;

/// Maximum length of any length-prefixed string frame on the client socket.
pub const FRAME_STRING_MAX: usize = 65535;

/// Total per-request time budget on the client socket.
pub const CLIENT_REQUEST_DEADLINE: Duration = Duration::from_millis(2000);

/// Listen backlog for the property-service client socket.
pub const CLIENT_SOCKET_BACKLOG: i32 = 8;

/// Mode bits applied to the property-service client socket.
pub const CLIENT_SOCKET_MODE: u32 = 0o666;

// ============================================================================
// Crash policy
// ============================================================================

/// Window within which repeated crashes accumulate `crash_count`.
pub const CRASH_WINDOW: Duration = Duration::from_secs(4 * 60);

/// `crash_count` strictly greater than this triggers crash policy.
pub const CRASH_COUNT_LIMIT: u32 = 4;

// ============================================================================
// Property-service distinguished name prefixes
// ============================================================================

/// Prefix for write-once properties.
pub const READ_ONLY_PREFIX: &str = "ro.";

/// Prefix for properties mirrored to durable storage.
pub const PERSIST_PREFIX: &str = "persist.";

/// Prefix for control properties converted into lifecycle actions.
pub const CONTROL_PREFIX: &str = "ctl.";

/// Property whose write triggers the asynchronous restorecon worker.
pub const RESTORECON_RECURSIVE_PROPERTY: &str = "selinux.restorecon_recursive";

/// Property whose write is logged with the originating pid/cmdline.
pub const POWERCTL_PROPERTY: &str = "sys.powerctl";

/// Published once the property server has applied persisted properties.
pub const PERSISTENT_PROPERTIES_READY: &str = "ro.persistent_properties.ready";

/// Set to `"1"` once the system has finished booting; gates the
/// `apply_crash_policy` rate limiter alongside the 4-minute crash window.
pub const BOOT_COMPLETED_PROPERTY: &str = "sys.boot_completed";

// ============================================================================
// Service state property names
// ============================================================================

/// Prefix under which per-service lifecycle state is published.
pub const SERVICE_STATE_PREFIX: &str = "init.svc.";

/// State name: service has an active pid and has not yet been reaped.
pub const STATE_RUNNING: &str = "running";

/// State name: `StopOrReset` has initiated termination; SIGCHLD pending.
pub const STATE_STOPPING: &str = "stopping";

/// State name: service has no active pid and no restart is pending.
pub const STATE_STOPPED: &str = "stopped";

/// State name: Reap completed and an automatic restart is pending.
pub const STATE_RESTARTING: &str = "restarting";

// ============================================================================
// Filesystem constants
// ============================================================================

/// Name of the internal socketpair's well-known path, when a path-backed
/// transport is used instead of an unnamed `socketpair(2)`.
pub const INTERNAL_SOCKET_NAME: &str = "property_internal.sock";

/// Name of the client-facing property socket.
pub const PROPERTY_SOCKET_NAME: &str = "property_service";

/// Well-known path under which the serialized PropertyInfo trie is published.
pub const PROPERTY_INFO_PUBLISH_PATH: &str = "property_info";

/// Default root for process cgroups created per started service.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/svcinit";

//! Helpers for resolving runtime paths and the process-wide singleton state
//! (`next_start_order`, `is_exec_service_running`, `persistent_properties_loaded`,
//! `accept_messages`). Android init keeps these as free-standing globals;
//! here they are fields of a single context object behind a
//! `OnceLock<RwLock<...>>`, matching the runtime directory singleton this
//! codebase already used for state/log/config paths.
use std::{
    env,
    os::fd::RawFd,
    path::PathBuf,
    sync::{
        OnceLock, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

#[cfg(test)]
use std::path::Path;

#[cfg(unix)]
use libc;

/// Runtime mode that determines where state and sockets should be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Standard userspace mode; state lives under the invoking user's home directory.
    User,
    /// System/PID-1 mode; state is stored in system directories.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    state_dir: PathBuf,
    socket_dir: PathBuf,
    config_dirs: Vec<PathBuf>,
    drop_privileges: bool,
    activation_fds: Vec<RawFd>,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        let state_dir = home.join(".local/share/svcinit");
        let socket_dir = state_dir.join("sockets");
        let config_dir = home.join(".config/svcinit");

        Self {
            mode: RuntimeMode::User,
            state_dir,
            socket_dir,
            config_dirs: vec![config_dir],
            drop_privileges: false,
            activation_fds: Vec::new(),
        }
    }

    fn system_directories() -> Self {
        let state_dir = PathBuf::from("/var/lib/svcinit");
        let socket_dir = PathBuf::from("/dev/socket");
        let config_dir = PathBuf::from("/etc/svcinit");

        Self {
            mode: RuntimeMode::System,
            state_dir,
            socket_dir,
            config_dirs: vec![config_dir],
            drop_privileges: false,
            activation_fds: Vec::new(),
        }
    }
}

/// Updates the global runtime directories for the provided mode. Subsequent
/// calls overwrite the active configuration.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    let drop_privileges = guard.drop_privileges;
    let activation_fds = guard.activation_fds.clone();
    let mut context = RuntimeContext::from_mode(mode);
    context.drop_privileges = drop_privileges;
    context.activation_fds = activation_fds;
    *guard = context;
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    let drop_privileges = guard.drop_privileges;
    let activation_fds = guard.activation_fds.clone();
    let mut context = RuntimeContext::from_user_home(home.to_path_buf());
    context.drop_privileges = drop_privileges;
    context.activation_fds = activation_fds;
    *guard = context;
}

/// Returns the current runtime mode.
pub fn mode() -> RuntimeMode {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .mode
}

/// Returns the root directory for runtime state (property persistence, etc.).
pub fn state_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .state_dir
        .clone()
}

/// Returns the directory where the client and internal sockets are created.
pub fn socket_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .socket_dir
        .clone()
}

/// Returns the list of configuration directories searched for the service
/// configuration document and property_contexts files.
pub fn config_dirs() -> Vec<PathBuf> {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .config_dirs
        .clone()
}

/// Configures whether svcinit should drop privileges after binding
/// privileged resources.
pub fn set_drop_privileges(drop: bool) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.drop_privileges = drop;
}

/// Indicates whether the CLI requested privilege dropping post-startup.
pub fn drop_privileges_requested() -> bool {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .drop_privileges
}

/// Stores file descriptors inherited via socket activation (e.g. systemd
/// `LISTEN_FDS`).
pub fn set_activation_fds(fds: Vec<RawFd>) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.activation_fds = fds;
}

/// Returns the list of file descriptors inherited via socket activation.
pub fn activation_fds() -> Vec<RawFd> {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .activation_fds
        .clone()
}

/// Clears any recorded activation file descriptors.
pub fn clear_activation_fds() {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    guard.activation_fds.clear();
}

/// Captures socket activation file descriptors if provided by the parent.
#[cfg(unix)]
pub fn capture_socket_activation() {
    use std::os::unix::io::RawFd as UnixRawFd;

    let listen_pid = match env::var("LISTEN_PID")
        .ok()
        .and_then(|pid| pid.parse::<u32>().ok())
    {
        Some(pid) => pid,
        None => {
            clear_activation_fds();
            return;
        }
    };

    let current_pid = unsafe { libc::getpid() as u32 };
    if listen_pid != current_pid {
        clear_activation_fds();
        return;
    }

    let fd_count = match env::var("LISTEN_FDS")
        .ok()
        .and_then(|val| val.parse::<i32>().ok())
    {
        Some(n) if n > 0 => n,
        _ => {
            clear_activation_fds();
            return;
        }
    };

    let fds: Vec<UnixRawFd> = (0..fd_count).map(|offset| 3 + offset).collect();
    set_activation_fds(fds);

    unsafe {
        env::remove_var("LISTEN_PID");
        env::remove_var("LISTEN_FDS");
        env::remove_var("LISTEN_FDNAMES");
    }
}

#[cfg(not(unix))]
pub fn capture_socket_activation() {
    clear_activation_fds();
}

// ============================================================================
// Process-wide singletons
// ============================================================================

/// Monotonic counter handing out each Service's `start_order` on a
/// successful Start.
static NEXT_START_ORDER: AtomicU64 = AtomicU64::new(1);

/// Returns the next `start_order` value and advances the counter.
pub fn next_start_order() -> u64 {
    NEXT_START_ORDER.fetch_add(1, Ordering::SeqCst)
}

/// Set when any anonymous `EXEC` service (via `ExecStart`/
/// `MakeTemporaryOneshotService`) is currently running; the supervisor uses
/// this to serialize exec-service requests the way `ExecStart` expects.
static EXEC_SERVICE_RUNNING: AtomicBool = AtomicBool::new(false);

/// Reports whether an exec service is currently running.
pub fn is_exec_service_running() -> bool {
    EXEC_SERVICE_RUNNING.load(Ordering::SeqCst)
}

/// Marks whether an exec service is currently running.
pub fn set_exec_service_running(running: bool) {
    EXEC_SERVICE_RUNNING.store(running, Ordering::SeqCst);
}

/// Monotonic id minted for each `MakeTemporaryOneshotService` call; combined
/// with the caller's command and arguments to build the `"exec <N> (cmd
/// args)"` name.
static NEXT_EXEC_SERVICE_ID: AtomicU64 = AtomicU64::new(0);

/// Returns the next exec-service id and advances the counter.
pub fn next_exec_service_id() -> u64 {
    NEXT_EXEC_SERVICE_ID.fetch_add(1, Ordering::SeqCst)
}

/// Set once the supervisor learns the system finished booting (mirrors the
/// `sys.boot_completed` distinguished property); the crash-policy rate
/// limiter in `service.rs` also rate-limits while this is false, since
/// early-boot restarts happen in quick succession regardless of the
/// 4-minute crash window.
static BOOT_COMPLETED: AtomicBool = AtomicBool::new(false);

/// Reports whether the system has finished booting.
pub fn boot_completed() -> bool {
    BOOT_COMPLETED.load(Ordering::SeqCst)
}

/// Marks whether the system has finished booting.
pub fn set_boot_completed(completed: bool) {
    BOOT_COMPLETED.store(completed, Ordering::SeqCst);
}

/// Set once the property server has applied the durable `persist.*` store;
/// gates both further durable writes and the server's own state transition.
static PERSISTENT_PROPERTIES_LOADED: AtomicBool = AtomicBool::new(false);

/// Reports whether persisted properties have been loaded.
pub fn persistent_properties_loaded() -> bool {
    PERSISTENT_PROPERTIES_LOADED.load(Ordering::SeqCst)
}

/// Marks persisted properties as loaded (one-way in normal operation; tests
/// may reset it directly).
pub fn set_persistent_properties_loaded(loaded: bool) {
    PERSISTENT_PROPERTIES_LOADED.store(loaded, Ordering::SeqCst);
}

/// Gates whether the property store emits `PropertyChanged` on the internal
/// socket; toggled by `StopSendingMessages`/`StartSendingMessages`.
static ACCEPT_MESSAGES: AtomicBool = AtomicBool::new(true);

/// Reports whether property-changed notifications are currently emitted.
pub fn accept_messages() -> bool {
    ACCEPT_MESSAGES.load(Ordering::SeqCst)
}

/// Enables or disables property-changed notifications.
pub fn set_accept_messages(accept: bool) {
    ACCEPT_MESSAGES.store(accept, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn user_mode_uses_home_scoped_paths() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        let home = temp.path();
        let original_home = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }

        init(RuntimeMode::User);
        set_drop_privileges(true);

        let expected_state = home.join(".local/share/svcinit");
        let expected_sockets = expected_state.join("sockets");
        let expected_config = home.join(".config/svcinit");

        assert_eq!(state_dir(), expected_state);
        assert_eq!(socket_dir(), expected_sockets);
        assert_eq!(config_dirs(), vec![expected_config]);
        assert!(drop_privileges_requested());

        if let Some(previous) = original_home {
            unsafe { env::set_var("HOME", previous) };
        } else {
            unsafe { env::remove_var("HOME") };
        }
    }

    #[test]
    fn system_mode_uses_system_directories() {
        let _guard = env_lock();
        init(RuntimeMode::System);

        assert_eq!(state_dir(), PathBuf::from("/var/lib/svcinit"));
        assert_eq!(socket_dir(), PathBuf::from("/dev/socket"));
        assert_eq!(config_dirs(), vec![PathBuf::from("/etc/svcinit")]);
        assert!(!drop_privileges_requested());
    }

    #[test]
    fn activation_fd_setters_round_trip() {
        clear_activation_fds();
        assert!(activation_fds().is_empty());

        set_activation_fds(vec![3, 4, 5]);
        assert_eq!(activation_fds(), vec![3, 4, 5]);

        clear_activation_fds();
        assert!(activation_fds().is_empty());
    }

    #[test]
    fn start_order_strictly_increases() {
        let a = next_start_order();
        let b = next_start_order();
        assert!(b > a);
    }

    #[test]
    fn exec_service_running_round_trips() {
        set_exec_service_running(true);
        assert!(is_exec_service_running());
        set_exec_service_running(false);
        assert!(!is_exec_service_running());
    }

    #[test]
    fn accept_messages_defaults_true_and_toggles() {
        assert!(accept_messages());
        set_accept_messages(false);
        assert!(!accept_messages());
        set_accept_messages(true);
    }

    #[test]
    fn exec_service_id_strictly_increases() {
        let a = next_exec_service_id();
        let b = next_exec_service_id();
        assert!(b > a);
    }

    #[test]
    fn boot_completed_round_trips() {
        set_boot_completed(true);
        assert!(boot_completed());
        set_boot_completed(false);
        assert!(!boot_completed());
    }
}

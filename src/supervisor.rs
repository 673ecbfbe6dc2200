//! Supervisor main loop — service orchestration and the boot sequence.
//!
//! Owns the [`Registry`] exclusively (see [`crate::constants::Lock`] for the
//! cross-thread lock order this must respect) and runs on its own thread: the
//! property server lives on a second thread, talking back over an `mpsc`
//! channel pair in place of the internal `SOCK_SEQPACKET` the upstream design
//! describes (see `property::server` module docs).
use crate::config::Config;
use crate::error::{PropertyErrorCode, SupervisorError};
use crate::property::server::{PropertyServer, ServerCommand};
use crate::property::{InternalMessage, boot_props, info::PropertyInfoTrie, store};
use crate::registry::Registry;
use crate::runtime;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// How long the main loop blocks on `internal_rx` between reap sweeps; small
/// enough that a crashed child is noticed promptly without busy-polling.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Owns the registry and the property server's thread handle; the supervisor
/// thread is the sole mutator of [`Registry`] state — the registry is never
/// shared across threads by reference.
pub struct Supervisor {
    registry: Registry,
    config: Config,
    internal_rx: Receiver<InternalMessage>,
    command_tx: Sender<ServerCommand>,
    server_thread: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    /// Loads configuration, builds the registry, initializes the property
    /// store/trie from the declared sources, and binds the property server
    /// socket. Does not start any service or spawn the
    /// server thread; call [`Supervisor::run`] for that.
    pub fn new(config: Config) -> Result<Self, SupervisorError> {
        let registry = Registry::from_config(&config)?;
        install_audit_callback();

        if let Some(persist_dir) = &config.properties.persist_dir {
            store::global().set_persist_dir(persist_dir.clone());
            load_persisted_properties(persist_dir);
        }

        ingest_kernel_boot_properties();
        load_boot_prop_files(&config);
        derive_build_identity_properties();

        let mut info = PropertyInfoTrie::new();
        for path in &config.properties.contexts_files {
            if let Err(err) = info.load_file(path) {
                warn!("failed to load property_contexts file {path:?}: {err}");
            }
        }
        publish_property_info(&info);

        let socket_path = runtime::socket_dir().join(crate::constants::PROPERTY_SOCKET_NAME);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SupervisorError::Privilege {
                service: "property_server".to_string(),
                source,
            })?;
        }

        let (server, internal_rx, command_tx) = PropertyServer::bind(&socket_path, info)
            .map_err(|source| SupervisorError::Privilege {
                service: "property_server".to_string(),
                source,
            })?;

        let server_thread = spawn_property_server(server);

        Ok(Self {
            registry,
            config,
            internal_rx,
            command_tx,
            server_thread: Some(server_thread),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs the boot-time Start sequence and then the message/reap loop until
    /// a termination signal arrives.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        install_signal_handlers(Arc::clone(&self.shutdown));

        self.boot_start_services()?;

        let _ = self.command_tx.send(ServerCommand::LoadPersistentProperties);

        info!("supervisor entering main loop with {} services", self.registry.len());

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.internal_rx.recv_timeout(REAP_POLL_INTERVAL) {
                Ok(message) => self.dispatch(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    error!("property server channel disconnected; shutting down");
                    break;
                }
            }

            self.reap_exited_children();
        }

        self.shutdown();
        Ok(())
    }

    fn boot_start_services(&mut self) -> Result<(), SupervisorError> {
        let order = self.config.service_start_order().map_err(SupervisorError::Config)?;
        let services_updated = self.registry.services_updated();
        let snapshot = store::global().snapshot();

        for name in order {
            let Some(service) = self.registry.get_mut(&name) else {
                continue;
            };
            let was_disabled = service.flags().contains(crate::service::ServiceFlags::DISABLED);
            match service.start_if_not_disabled(services_updated, &snapshot) {
                Ok(true) => trace!("service '{name}' started at boot"),
                Ok(false) if was_disabled => {
                    debug!("service '{name}' is disabled; skipped at boot")
                }
                Ok(false) => {
                    trace!("service '{name}' is updatable and not yet services_updated; delaying");
                    self.registry.delay(name);
                }
                Err(err) => warn!("failed to start service '{name}' at boot: {err}"),
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, message: InternalMessage) {
        match message {
            InternalMessage::PropertyChanged { name, value } => {
                trace!("property changed: {name}={value}");
                self.handle_distinguished_property(&name, &value);
            }
            InternalMessage::ControlRequest { msg, name, pid, reply_fd } => {
                let code = self.handle_control_request(&msg, &name, pid);
                if let Some(fd) = reply_fd {
                    PropertyServer::reply_through_fd(fd, code);
                }
            }
        }
    }

    fn handle_distinguished_property(&mut self, name: &str, value: &str) {
        if name == "ro.init.services_updated" && value == "1" {
            let snapshot = store::global().snapshot();
            if let Err(err) = self.registry.mark_services_updated(&snapshot) {
                warn!("mark_services_updated failed: {err}");
            }
        }

        // Substitutes for the userdata-mount completion event upstream init
        // observes directly: here, the first-stage mount helper marks
        // completion by writing this property instead.
        if name == "ro.init.post_fs_data" && value == "1" {
            self.registry.mark_post_data();
            self.registry.reset_if_post_data();
        }

        if name == "ro.init.post_fs_data_done" && value == "1" {
            let snapshot = store::global().snapshot();
            if let Err(err) = self.registry.start_if_post_data(&snapshot) {
                warn!("start_if_post_data failed: {err}");
            }
        }

        if name == crate::constants::BOOT_COMPLETED_PROPERTY && value == "1" {
            runtime::set_boot_completed(true);
        }
    }

    fn handle_control_request(&mut self, verb: &str, name: &str, pid: i32) -> PropertyErrorCode {
        info!("control request '{verb}' on '{name}' from pid {pid}");

        if verb == "exec" {
            let argv: Vec<String> = name.split(' ').map(str::to_string).collect();
            return match self.registry.make_temporary_oneshot_service(&argv) {
                Ok(started) => {
                    if started { PropertyErrorCode::Success } else { PropertyErrorCode::ControlMessageError }
                }
                Err(err) => {
                    warn!("exec request failed: {err}");
                    PropertyErrorCode::ControlMessageError
                }
            };
        }

        let snapshot = store::global().snapshot();
        let services_updated = self.registry.services_updated();

        let Some(service) = self.registry.get_mut(name) else {
            warn!("control request for unknown service '{name}'");
            return PropertyErrorCode::ControlMessageError;
        };

        let result = match verb {
            "start" => service.start_if_not_disabled(services_updated, &snapshot).map(|_| ()),
            "stop" => {
                service.stop();
                Ok(())
            }
            "restart" => {
                service.restart();
                Ok(())
            }
            other => {
                warn!("unrecognized control verb '{other}' for service '{name}'");
                return PropertyErrorCode::ControlMessageError;
            }
        };

        match result {
            Ok(()) => PropertyErrorCode::Success,
            Err(err) => {
                warn!("control request '{verb}' on '{name}' failed: {err}");
                PropertyErrorCode::ControlMessageError
            }
        }
    }

    fn reap_exited_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status_pid(&status) else {
                        continue;
                    };
                    self.reap_pid(pid, &status);
                }
                Err(nix::errno::Errno::ECHILD) => break,
                Err(err) => {
                    warn!("waitpid failed: {err}");
                    break;
                }
            }
        }
    }

    fn reap_pid(&mut self, pid: i32, status: &WaitStatus) {
        for (name, service) in self.registry.iter_mut() {
            if service.pid() == pid {
                debug!("reaping service '{name}' (pid {pid}): {status:?}");
                service.reap(status);
                return;
            }
        }
        trace!("reaped untracked pid {pid}: {status:?}");
    }

    fn shutdown(&mut self) {
        info!("supervisor shutting down; terminating services");
        let _ = self.command_tx.send(ServerCommand::StopSendingMessages);
        for (name, service) in self.registry.iter_mut() {
            trace!("terminating '{name}' for shutdown");
            service.terminate();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            loop {
                match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                    Ok(status) => {
                        if let Some(pid) = status_pid(&status) {
                            self.reap_pid(pid, &status);
                        }
                    }
                    Err(err) => {
                        warn!("waitpid during shutdown failed: {err}");
                        break;
                    }
                }
            }
            let any_running = self.registry.iter().any(|(_, service)| service.pid() != 0);
            if !any_running {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }

        if let Some(handle) = self.server_thread.take() {
            // The property server thread blocks in accept() forever; it is
            // daemon-like and exits with the process rather than joining here.
            drop(handle);
        }
    }
}

fn status_pid(status: &WaitStatus) -> Option<i32> {
    status.pid().map(|pid| pid.as_raw())
}

fn spawn_property_server(mut server: PropertyServer) -> thread::JoinHandle<()> {
    thread::spawn(move || server.run())
}

fn load_persisted_properties(persist_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(persist_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if let Ok(value) = std::fs::read_to_string(&path) {
            store::global().set_force(name, value.trim());
        }
    }
}

/// Loads every `*.prop` file named in the config, in order, honoring
/// `import` directives along the way. When the config
/// names no prop files, the well-known Android-style search paths are
/// consulted instead, on the chance this process is actually running on
/// such a system.
fn load_boot_prop_files(config: &Config) {
    if !config.properties.prop_files.is_empty() {
        for path in &config.properties.prop_files {
            let snapshot = store::global().snapshot();
            for (name, value) in boot_props::load_prop_file(path, &snapshot) {
                store::global().set_force(&name, &value);
            }
        }
        return;
    }

    for source in boot_props::default_search_paths() {
        let snapshot = store::global().snapshot();
        for (name, value) in boot_props::load_prop_file(&source.path, &snapshot) {
            match source.only_prefix {
                Some(prefix) if !name.starts_with(prefix) => continue,
                _ => store::global().set_force(&name, &value),
            }
        }
    }
}

/// Stands in for installing the SELinux audit callback upstream registers
/// before the shared property area exists; no SELinux subsystem backs this
/// process, so the callback is just a log line in the same
/// `property=<name> pid=<p> uid=<u> gid=<g>` shape the real one formats.
fn install_audit_callback() {
    debug!("property service audit callback installed (format: property=<name> pid=<p> uid=<u> gid=<g>)");
}

/// Ingests kernel device-tree overrides and `/proc/cmdline` tokens, then
/// exports the fixed `ro.boot.*` -> `ro.*` aliases, in that order, ahead of
/// `*.prop` file loading (later `.prop` entries may still override these).
fn ingest_kernel_boot_properties() {
    let device_tree_dir = Path::new(boot_props::DEVICE_TREE_ANDROID_DIR);
    for (name, value) in boot_props::load_device_tree_overrides(device_tree_dir) {
        store::global().set_force(&name, &value);
    }

    if let Ok(cmdline) = std::fs::read_to_string("/proc/cmdline") {
        for (name, value) in boot_props::parse_kernel_cmdline(&cmdline) {
            store::global().set_force(&name, &value);
        }
    }

    let snapshot = store::global().snapshot();
    for (name, value) in boot_props::alias_boot_properties(&snapshot) {
        store::global().set_force(&name, &value);
    }
}

/// Derives the `ro.product.*` aliases and `ro.build.fingerprint`, run after
/// `*.prop` files are loaded so partition-qualified product properties are
/// already in the store.
fn derive_build_identity_properties() {
    const PRODUCT_FIELDS: &[&str] = &["brand", "name", "device"];

    let snapshot = store::global().snapshot();
    for (name, value) in boot_props::alias_product_properties(&snapshot, PRODUCT_FIELDS) {
        store::global().set_force(&name, &value);
    }

    let snapshot = store::global().snapshot();
    store::global().set_force("ro.build.fingerprint", &boot_props::derive_fingerprint(&snapshot));
}

fn publish_property_info(info: &PropertyInfoTrie) {
    let path = runtime::state_dir().join(crate::constants::PROPERTY_INFO_PUBLISH_PATH);
    if let Some(parent) = path.parent()
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        warn!("failed to create state directory for property_info: {err}");
        return;
    }
    if let Err(err) = std::fs::write(&path, info.serialize()) {
        warn!("failed to publish property_info to {path:?}: {err}");
    }
}

fn install_signal_handlers(shutdown: Arc<AtomicBool>) {
    if let Err(err) = signal_hook::flag::register(libc::SIGTERM, Arc::clone(&shutdown)) {
        warn!("failed to install SIGTERM handler: {err}");
    }
    if let Err(err) = signal_hook::flag::register(libc::SIGINT, shutdown) {
        warn!("failed to install SIGINT handler: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::test_utils::env_lock;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn base_config() -> Config {
        let mut services = HashMap::new();
        services.insert(
            "demo".to_string(),
            ServiceConfig {
                argv: vec!["/bin/true".into()],
                ..ServiceConfig::default()
            },
        );
        Config {
            version: "1".to_string(),
            services,
            properties: Default::default(),
            project_dir: None,
        }
    }

    #[test]
    fn new_builds_registry_and_binds_server() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        runtime::init_with_test_home(temp.path());

        let supervisor = Supervisor::new(base_config()).expect("supervisor should build");
        assert_eq!(supervisor.registry.len(), 1);
    }

    #[test]
    fn control_request_for_unknown_service_is_an_error() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        runtime::init_with_test_home(temp.path());

        let mut supervisor = Supervisor::new(base_config()).expect("supervisor should build");
        let code = supervisor.handle_control_request("start", "missing", 1);
        assert_eq!(code, PropertyErrorCode::ControlMessageError);
    }

    #[test]
    fn control_request_start_dispatches_to_service() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        runtime::init_with_test_home(temp.path());

        let mut supervisor = Supervisor::new(base_config()).expect("supervisor should build");
        let code = supervisor.handle_control_request("start", "demo", 1);
        assert_eq!(code, PropertyErrorCode::Success);
        assert_ne!(supervisor.registry.get("demo").unwrap().pid(), 0);
    }

    #[test]
    fn post_fs_data_property_resets_post_data_services() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        runtime::init_with_test_home(temp.path());

        let mut supervisor = Supervisor::new(base_config()).expect("supervisor should build");
        supervisor.handle_control_request("start", "demo", 1);
        assert!(!supervisor.registry.is_post_data());

        supervisor.handle_distinguished_property("ro.init.post_fs_data", "1");
        assert!(supervisor.registry.is_post_data());
    }

    #[test]
    fn services_updated_property_drains_delayed_services() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        runtime::init_with_test_home(temp.path());

        let mut supervisor = Supervisor::new(base_config()).expect("supervisor should build");
        supervisor.registry.delay("demo");

        supervisor.handle_distinguished_property("ro.init.services_updated", "1");
        assert!(supervisor.registry.services_updated());
    }
}

//! Service Object (C2).
//!
//! A `Service` owns one child process across its whole lifecycle: fork/exec
//! via [`crate::privilege`], reap, restart policy, and crash accounting. All
//! mutation happens on the supervisor thread; nothing here is `Sync` by
//! design — the registry holds each `Service` behind its own lock so the
//! lock-ordering rule in [`crate::constants::Lock`] stays enforceable.
use crate::config::{MemoryConfig, OomScoreAdj, ServiceConfig};
use crate::constants::{STATE_RESTARTING, STATE_RUNNING, STATE_STOPPED, STATE_STOPPING};
use crate::error::SupervisorError;
use crate::privilege::{self, PrivilegeContext};
use crate::runtime;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid, fork};
use std::collections::HashMap;
use std::fs;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

bitflags::bitflags! {
    /// Non-disjoint lifecycle/config bits: a service may be
    /// both `RUNNING` and `DISABLED` between `Stop` and the eventual
    /// `SIGCHLD`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServiceFlags: u32 {
        /// Administratively disabled; `Start` refuses to launch.
        const DISABLED        = 1 << 0;
        /// Disabled by the init-script layer rather than the administrator.
        const RC_DISABLED     = 1 << 1;
        /// Auto-disables after one successful run.
        const ONESHOT         = 1 << 2;
        /// Has an active, unreaped pid.
        const RUNNING         = 1 << 3;
        /// Reap completed and an automatic restart is pending.
        const RESTARTING      = 1 << 4;
        /// Attach a console device to the child.
        const CONSOLE         = 1 << 5;
        /// Exceeding the crash-policy threshold is fatal to the supervisor.
        const CRITICAL        = 1 << 6;
        /// Latched by `StopOrReset(RESET)` unless `RC_DISABLED`.
        const RESET           = 1 << 7;
        /// Latched by `StopOrReset(RESTART)`.
        const RESTART         = 1 << 8;
        /// `StartIfNotDisabled` deferred a Start pending a future `Enable`.
        const DISABLED_START  = 1 << 9;
        /// Anonymous one-shot created by `MakeTemporaryOneshotService`.
        const TEMPORARY       = 1 << 10;
        /// Launched via `ExecStart`/`MakeTemporaryOneshotService`.
        const EXEC            = 1 << 11;
    }
}

/// Intent passed to [`Service::stop_or_reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopIntent {
    /// Administrative stop.
    Disabled,
    /// Userdata-mount reset.
    Reset,
    /// Restart request.
    Restart,
}

/// A supervised child process and its declared configuration.
#[derive(Debug)]
pub struct Service {
    /// Unique name within the registry.
    pub name: String,
    config: ServiceConfig,
    flags: ServiceFlags,
    pid: i32,
    start_order: u64,
    time_started: Option<Instant>,
    time_crashed: Option<Instant>,
    crash_count: u32,
    process_cgroup_empty: bool,
    pre_apexd: bool,
    post_data: bool,
    running_at_post_data_reset: bool,
    published_fds: Vec<RawFd>,
}

impl Service {
    /// Builds a new, not-yet-started Service from its declared configuration.
    pub fn new(name: impl Into<String>, config: ServiceConfig) -> Self {
        let mut flags = ServiceFlags::empty();
        if config.disabled {
            flags |= ServiceFlags::DISABLED;
        }
        if config.rc_disabled {
            flags |= ServiceFlags::RC_DISABLED;
        }
        if config.oneshot {
            flags |= ServiceFlags::ONESHOT;
        }
        if config.critical {
            flags |= ServiceFlags::CRITICAL;
        }
        if config.console {
            flags |= ServiceFlags::CONSOLE;
        }

        Self {
            name: name.into(),
            config,
            flags,
            pid: 0,
            start_order: 0,
            time_started: None,
            time_crashed: None,
            crash_count: 0,
            process_cgroup_empty: true,
            pre_apexd: false,
            post_data: false,
            running_at_post_data_reset: false,
            published_fds: Vec::new(),
        }
    }

    /// Current flag set.
    pub fn flags(&self) -> ServiceFlags {
        self.flags
    }

    /// Active pid, 0 when none.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The `start_order` recorded on the last successful Start.
    pub fn start_order(&self) -> u64 {
        self.start_order
    }

    /// Whether this service belongs to the "updatable" class.
    pub fn is_updatable(&self) -> bool {
        self.config.is_updatable()
    }

    pub(crate) fn set_post_data(&mut self, post_data: bool) {
        self.post_data = post_data;
    }

    pub(crate) fn post_data(&self) -> bool {
        self.post_data
    }

    /// Records that this service was running at the moment of the last
    /// userdata-mount reset, so a later `start_if_post_data` knows it needs
    /// relaunching rather than having been newly disabled.
    pub(crate) fn mark_running_at_post_data_reset(&mut self) {
        self.running_at_post_data_reset = self.flags.contains(ServiceFlags::RUNNING);
    }

    pub(crate) fn running_at_post_data_reset(&self) -> bool {
        self.running_at_post_data_reset
    }

    /// Starts the service, applying the full set of
    /// and effects. Returns `Ok(false)` when the service was enqueued to the
    /// delayed-services list rather than started (updatable, pre-update).
    pub fn start(
        &mut self,
        services_updated: bool,
        property_snapshot: &HashMap<String, String>,
    ) -> Result<bool, SupervisorError> {
        if self.is_updatable() && !services_updated {
            return Ok(false);
        }

        if self.flags.contains(ServiceFlags::RUNNING) {
            if self.flags.contains(ServiceFlags::ONESHOT) && self.flags.contains(ServiceFlags::DISABLED) {
                self.flags |= ServiceFlags::RESTART;
            }
            return Ok(true);
        }

        if self.flags.contains(ServiceFlags::CONSOLE) {
            let console_path = self
                .config
                .console_path
                .clone()
                .unwrap_or_else(|| "/dev/console".into());
            if fs::OpenOptions::new().read(true).write(true).open(&console_path).is_err() {
                self.flags |= ServiceFlags::DISABLED;
                return Err(SupervisorError::Privilege {
                    service: self.name.clone(),
                    source: std::io::Error::other(format!(
                        "console path '{}' could not be opened",
                        console_path.display()
                    )),
                });
            }
        }

        let Some(executable) = self.config.argv.first().cloned() else {
            self.flags |= ServiceFlags::DISABLED;
            return Err(SupervisorError::Privilege {
                service: self.name.clone(),
                source: std::io::Error::other("argv is empty"),
            });
        };
        if fs::metadata(&executable).is_err() {
            self.flags |= ServiceFlags::DISABLED;
            return Err(SupervisorError::Privilege {
                service: self.name.clone(),
                source: std::io::Error::other(format!("'{executable}' not found")),
            });
        }

        let context = PrivilegeContext::from_service(&self.name, &self.config, property_snapshot.clone())
            .map_err(|source| SupervisorError::Privilege {
                service: self.name.clone(),
                source,
            })?;

        let pid = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                unsafe {
                    libc::umask(0o022);
                }
                if let Err(err) = unsafe { context.apply_pre_exec() } {
                    error!("privilege setup failed for '{}': {}", self.name, err);
                    std::process::exit(127);
                }
                let argv = context.expand_argv();
                exec_or_exit(&argv);
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(errno) => {
                return Err(SupervisorError::Spawn {
                    service: self.name.clone(),
                    source: errno,
                });
            }
        };

        self.pid = pid.as_raw();
        self.start_order = runtime::next_start_order();
        self.time_started = Some(Instant::now());
        self.process_cgroup_empty = false;
        self.flags |= ServiceFlags::RUNNING;

        self.create_process_cgroup();

        if let OomScoreAdj::Value(value) = self.config.oom_score_adj
            && let Err(err) = privilege::write_oom_score_adj(self.pid, value)
        {
            warn!("failed to write oom_score_adj for '{}': {}", self.name, err);
        }

        if !self.flags.contains(ServiceFlags::TEMPORARY) {
            self.publish_state(STATE_RUNNING);
        }

        Ok(true)
    }

    /// Builds (but does not start) the anonymous one-shot service
    /// `MakeTemporaryOneshotService` constructs from a `ctl.exec` argv of the
    /// shape `[seclabel [uid [gid supp_gid*]] -- cmd args...]`. The name is
    /// `"exec <N> (cmd args)"` with `N` a process-wide monotonic counter;
    /// uid/gid are carried as NSS names and resolved at `start()` time by
    /// the same [`crate::privilege::PrivilegeContext`] path every other
    /// service goes through, so a bad name surfaces through the existing
    /// `SupervisorError::Privilege` path rather than a separate check here.
    pub fn make_temporary_oneshot(argv: &[String]) -> Result<Self, SupervisorError> {
        let request = parse_exec_argv(argv)?;
        let id = runtime::next_exec_service_id();
        let name = format!("exec {id} ({})", request.command.join(" "));

        let config = ServiceConfig {
            argv: request.command,
            seclabel: request.seclabel,
            uid: request.uid,
            gid: request.gid,
            supp_gids: request.supp_gids,
            oneshot: true,
            ..ServiceConfig::default()
        };

        let mut service = Service::new(name, config);
        service.flags |= ServiceFlags::ONESHOT | ServiceFlags::TEMPORARY;
        Ok(service)
    }

    /// Convenience for anonymous one-shot services.
    pub fn exec_start(
        &mut self,
        services_updated: bool,
        property_snapshot: &HashMap<String, String>,
    ) -> Result<bool, SupervisorError> {
        self.flags |= ServiceFlags::ONESHOT;
        let started = self.start(services_updated, property_snapshot)?;
        if started {
            self.flags |= ServiceFlags::EXEC;
            runtime::set_exec_service_running(true);
        }
        Ok(started)
    }

    /// Calls Start unless `DISABLED`; otherwise latches `DISABLED_START` for
    /// a future `Enable`.
    pub fn start_if_not_disabled(
        &mut self,
        services_updated: bool,
        property_snapshot: &HashMap<String, String>,
    ) -> Result<bool, SupervisorError> {
        if self.flags.contains(ServiceFlags::DISABLED) {
            self.flags |= ServiceFlags::DISABLED_START;
            return Ok(false);
        }
        self.start(services_updated, property_snapshot)
    }

    /// Clears `DISABLED|RC_DISABLED`; if `DISABLED_START` was latched, calls
    /// Start. A no-op when the service was not disabled.
    pub fn enable(
        &mut self,
        services_updated: bool,
        property_snapshot: &HashMap<String, String>,
    ) -> Result<bool, SupervisorError> {
        let was_disabled = self.flags.contains(ServiceFlags::DISABLED);
        let had_deferred_start = self.flags.contains(ServiceFlags::DISABLED_START);
        self.flags.remove(ServiceFlags::DISABLED | ServiceFlags::RC_DISABLED);
        if was_disabled && had_deferred_start {
            self.flags.remove(ServiceFlags::DISABLED_START);
            return self.start(services_updated, property_snapshot);
        }
        Ok(true)
    }

    /// Administrative stop.
    pub fn stop(&mut self) {
        self.stop_or_reset(StopIntent::Disabled);
    }

    /// Userdata-mount reset.
    pub fn reset(&mut self) {
        self.stop_or_reset(StopIntent::Reset);
    }

    /// Restart request; the actual relaunch happens on the following
    /// Reap once `RESTARTING` transitions.
    pub fn restart(&mut self) {
        self.stop_or_reset(StopIntent::Restart);
    }

    /// As Stop, but additionally clears `RESTARTING|DISABLED_START` and
    /// sends SIGTERM (not SIGKILL) to the process group.
    pub fn terminate(&mut self) {
        self.flags.remove(ServiceFlags::RESTARTING | ServiceFlags::DISABLED_START);
        self.stop_or_reset(StopIntent::Disabled);
        if self.pid != 0 {
            let _ = signal::killpg(Pid::from_raw(self.pid), Signal::SIGTERM);
        }
    }

    /// Advisory timeout: sends SIGKILL; the real transition happens on the
    /// subsequent `Reap` once `SIGCHLD` arrives.
    pub fn timeout(&mut self) {
        if self.pid != 0 {
            let _ = signal::killpg(Pid::from_raw(self.pid), Signal::SIGKILL);
        }
    }

    fn stop_or_reset(&mut self, how: StopIntent) {
        match how {
            StopIntent::Disabled => {
                self.flags
                    .remove(ServiceFlags::RESTARTING | ServiceFlags::DISABLED_START | ServiceFlags::RESTART);
                self.flags |= ServiceFlags::DISABLED;
            }
            StopIntent::Reset => {
                self.flags
                    .remove(ServiceFlags::RESTARTING | ServiceFlags::DISABLED_START | ServiceFlags::RESTART);
                if self.flags.contains(ServiceFlags::RC_DISABLED) {
                    self.flags |= ServiceFlags::DISABLED;
                } else {
                    self.flags |= ServiceFlags::RESET;
                }
            }
            StopIntent::Restart => {
                self.flags.remove(
                    ServiceFlags::RESTARTING
                        | ServiceFlags::DISABLED_START
                        | ServiceFlags::DISABLED
                        | ServiceFlags::RESET,
                );
            }
        }

        if self.pid != 0 {
            let _ = signal::killpg(Pid::from_raw(self.pid), Signal::SIGKILL);
            self.publish_state(STATE_STOPPING);
        } else {
            self.publish_state(STATE_STOPPED);
        }
    }

    /// Handles child death observed by the supervisor's `waitpid` loop
    ///.
    pub fn reap(&mut self, status: &WaitStatus) {
        let ran_to_completion_without_restart =
            self.flags.contains(ServiceFlags::ONESHOT) && !self.flags.contains(ServiceFlags::RESTART);
        if !ran_to_completion_without_restart && self.pid != 0 {
            let _ = signal::killpg(Pid::from_raw(self.pid), Signal::SIGKILL);
        }

        self.close_published_descriptors();

        let was_exec = self.flags.contains(ServiceFlags::EXEC);
        self.flags.remove(ServiceFlags::EXEC);
        if was_exec || self.flags.contains(ServiceFlags::TEMPORARY) {
            runtime::set_exec_service_running(false);
        }

        self.pid = 0;

        if self.flags.contains(ServiceFlags::TEMPORARY) {
            self.flags.remove(ServiceFlags::RUNNING);
            return;
        }

        self.flags.remove(ServiceFlags::RUNNING);

        if self.flags.contains(ServiceFlags::ONESHOT)
            && !self.flags.contains(ServiceFlags::RESTART)
            && !self.flags.contains(ServiceFlags::RESET)
        {
            self.flags |= ServiceFlags::DISABLED;
        }

        if self.flags.contains(ServiceFlags::DISABLED) || self.flags.contains(ServiceFlags::RESET) {
            self.publish_state(STATE_STOPPED);
            return;
        }

        self.apply_crash_policy(status);
        self.flags.remove(ServiceFlags::RESTART);
        self.flags |= ServiceFlags::RESTARTING;
        self.run_on_restart();
        self.publish_state(STATE_RESTARTING);
    }

    fn apply_crash_policy(&mut self, status: &WaitStatus) {
        let rate_limited = self.flags.contains(ServiceFlags::CRITICAL) || self.is_updatable();
        if !rate_limited {
            return;
        }

        let exited_cleanly = matches!(status, WaitStatus::Exited(_, 0));
        if exited_cleanly {
            return;
        }

        let now = Instant::now();
        let within_window = self
            .time_crashed
            .is_some_and(|prev| now.duration_since(prev) < Duration::from_secs(4 * 60))
            || !runtime::boot_completed();

        if within_window {
            self.crash_count += 1;
        } else {
            self.time_crashed = Some(now);
            self.crash_count = 1;
        }

        if self.crash_count > 4 {
            if self.flags.contains(ServiceFlags::CRITICAL) {
                error!(
                    "service '{}' is CRITICAL and crashed {} times within 4 minutes; aborting",
                    self.name, self.crash_count
                );
                std::process::abort();
            } else {
                warn!(
                    "updatable service '{}' crashed {} times within 4 minutes",
                    self.name, self.crash_count
                );
                crate::property::store::global().set_force(
                    "ro.init.updatable_crashing",
                    "1",
                );
            }
        }
    }

    fn run_on_restart(&self) {
        let Some(command) = &self.config.on_restart else {
            return;
        };
        if command.is_empty() {
            return;
        }
        let mut cmd = std::process::Command::new(&command[0]);
        if command.len() > 1 {
            cmd.args(&command[1..]);
        }
        if let Err(err) = cmd.spawn() {
            warn!("on_restart command for '{}' failed to spawn: {}", self.name, err);
        }
    }

    fn create_process_cgroup(&self) {
        let cgroup_path = std::path::Path::new(crate::constants::DEFAULT_CGROUP_ROOT).join(&self.name);
        if let Err(err) = fs::create_dir_all(&cgroup_path) {
            warn!("failed to create process cgroup for '{}': {}", self.name, err);
            return;
        }

        if let Err(err) = fs::write(cgroup_path.join("cgroup.procs"), self.pid.to_string()) {
            warn!("failed to attach '{}' to its process cgroup: {}", self.name, err);
        }

        self.apply_memory_controls(&cgroup_path, &self.config.memory);
    }

    fn apply_memory_controls(&self, cgroup_path: &std::path::Path, memory: &MemoryConfig) {
        if let Some(swappiness) = memory.swappiness {
            let _ = fs::write(cgroup_path.join("memory.swappiness"), swappiness.to_string());
        }
        if let Some(soft) = memory.soft_limit_bytes {
            let _ = fs::write(cgroup_path.join("memory.low"), soft.to_string());
        }

        let hard_limit = if let Some(property_name) = &memory.limit_property_name {
            crate::property::store::global()
                .get(property_name)
                .and_then(|v| v.parse::<u64>().ok())
        } else {
            None
        }
        .or(memory.limit_bytes)
        .or_else(|| {
            memory.limit_percent.map(|percent| {
                let total = total_ram_bytes();
                total.saturating_mul(percent as u64) / 100
            })
        });

        if let Some(limit) = hard_limit {
            let _ = fs::write(cgroup_path.join("memory.max"), limit.to_string());
        }
    }

    fn close_published_descriptors(&mut self) {
        for fd in self.published_fds.drain(..) {
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn publish_state(&self, state: &str) {
        let property_name = format!("{}{}", crate::constants::SERVICE_STATE_PREFIX, self.name);
        crate::property::store::global().set_force(&property_name, state);
    }
}

/// Parsed `[seclabel [uid [gid supp_gid*]] -- cmd args...]` argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Optional SELinux-style label for the child.
    pub seclabel: Option<String>,
    /// Optional target uid, as an NSS name.
    pub uid: Option<String>,
    /// Optional target gid, as an NSS name.
    pub gid: Option<String>,
    /// Optional supplementary group names.
    pub supp_gids: Vec<String>,
    /// The `--`-delimited command and its arguments.
    pub command: Vec<String>,
}

/// Parses the `MakeTemporaryOneshotService` argv grammar:
/// `[seclabel [uid [gid supp_gid*]] -- cmd args...]`. Rejects a missing `--`
/// separator, an empty command, or more supplementary groups than
/// [`crate::config::DEFAULT_MAX_SUPPLEMENTARY_GROUPS`].
pub fn parse_exec_argv(argv: &[String]) -> Result<ExecRequest, SupervisorError> {
    let Some(sep) = argv.iter().position(|arg| arg == "--") else {
        return Err(SupervisorError::InvalidExecRequest(
            "missing '--' separator before command".to_string(),
        ));
    };

    let prefix = &argv[..sep];
    let command: Vec<String> = argv[sep + 1..].to_vec();
    if command.is_empty() {
        return Err(SupervisorError::InvalidExecRequest("no command given".to_string()));
    }

    let mut prefix = prefix.iter();
    let seclabel = prefix.next().cloned();
    let uid = prefix.next().cloned();
    let gid = prefix.next().cloned();
    let supp_gids: Vec<String> = prefix.cloned().collect();

    if supp_gids.len() > crate::config::DEFAULT_MAX_SUPPLEMENTARY_GROUPS {
        return Err(SupervisorError::InvalidExecRequest(format!(
            "too many supplementary groups ({} > {})",
            supp_gids.len(),
            crate::config::DEFAULT_MAX_SUPPLEMENTARY_GROUPS
        )));
    }

    Ok(ExecRequest { seclabel, uid, gid, supp_gids, command })
}

fn total_ram_bytes() -> u64 {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } == 0 {
        (info.totalram as u64).saturating_mul(info.mem_unit as u64)
    } else {
        0
    }
}

fn exec_or_exit(argv: &[String]) -> ! {
    use std::ffi::CString;
    let Ok(c_argv): Result<Vec<CString>, _> =
        argv.iter().map(|arg| CString::new(arg.as_str())).collect()
    else {
        std::process::exit(127);
    };
    let Some(path) = c_argv.first() else {
        std::process::exit(127);
    };
    let _ = nix::unistd::execv(path, &c_argv);
    std::process::exit(127);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_argv(argv: &[&str]) -> Service {
        let config = ServiceConfig {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            ..ServiceConfig::default()
        };
        Service::new("demo", config)
    }

    #[test]
    fn new_service_carries_declared_flags() {
        let mut config = ServiceConfig::default();
        config.oneshot = true;
        config.critical = true;
        let service = Service::new("demo", config);
        assert!(service.flags().contains(ServiceFlags::ONESHOT));
        assert!(service.flags().contains(ServiceFlags::CRITICAL));
        assert_eq!(service.pid(), 0);
    }

    #[test]
    fn start_sets_disabled_on_missing_executable() {
        let mut service = service_with_argv(&["/nonexistent/binary/path"]);
        let err = service
            .start(true, &HashMap::new())
            .expect_err("missing binary should fail Start");
        assert!(matches!(err, SupervisorError::Privilege { .. }));
        assert!(service.flags().contains(ServiceFlags::DISABLED));
        assert_eq!(service.pid(), 0);
    }

    #[test]
    fn start_enqueues_updatable_services_until_services_updated() {
        let mut config = ServiceConfig::default();
        config.argv = vec!["/bin/true".into()];
        config.classnames = ["updatable".to_string()].into_iter().collect();
        let mut service = Service::new("demo", config);

        let started = service.start(false, &HashMap::new()).unwrap();
        assert!(!started);
        assert_eq!(service.pid(), 0);
    }

    #[test]
    fn stop_or_reset_disabled_clears_restart_bits() {
        let mut service = service_with_argv(&["/bin/true"]);
        service.flags |= ServiceFlags::RESTARTING | ServiceFlags::RESTART;
        service.stop_or_reset(StopIntent::Disabled);
        assert!(service.flags().contains(ServiceFlags::DISABLED));
        assert!(!service.flags().contains(ServiceFlags::RESTARTING));
        assert!(!service.flags().contains(ServiceFlags::RESTART));
    }

    #[test]
    fn stop_or_reset_reset_retains_disabled_when_rc_disabled() {
        let mut service = service_with_argv(&["/bin/true"]);
        service.flags |= ServiceFlags::RC_DISABLED;
        service.stop_or_reset(StopIntent::Reset);
        assert!(service.flags().contains(ServiceFlags::DISABLED));
        assert!(!service.flags().contains(ServiceFlags::RESET));
    }

    #[test]
    fn stop_or_reset_reset_sets_reset_without_rc_disabled() {
        let mut service = service_with_argv(&["/bin/true"]);
        service.stop_or_reset(StopIntent::Reset);
        assert!(service.flags().contains(ServiceFlags::RESET));
        assert!(!service.flags().contains(ServiceFlags::DISABLED));
    }

    #[test]
    fn reap_sets_disabled_for_oneshot_without_restart() {
        let mut service = service_with_argv(&["/bin/true"]);
        service.flags |= ServiceFlags::ONESHOT | ServiceFlags::RUNNING;
        service.pid = 0;
        service.reap(&WaitStatus::Exited(Pid::from_raw(1), 0));
        assert!(service.flags().contains(ServiceFlags::DISABLED));
        assert!(!service.flags().contains(ServiceFlags::RUNNING));
    }

    #[test]
    fn reap_sets_restarting_for_long_lived_service() {
        let mut service = service_with_argv(&["/bin/true"]);
        service.flags |= ServiceFlags::RUNNING;
        service.pid = 0;
        service.reap(&WaitStatus::Exited(Pid::from_raw(1), 0));
        assert!(service.flags().contains(ServiceFlags::RESTARTING));
        assert!(!service.flags().contains(ServiceFlags::RUNNING));
    }

    #[test]
    fn crash_policy_is_fatal_only_for_critical_services() {
        let mut service = service_with_argv(&["/bin/false"]);
        service.flags |= ServiceFlags::RUNNING;
        service.time_crashed = Some(Instant::now());
        service.crash_count = 4;
        // Non-critical, non-updatable: crash_count is never rate-limited.
        service.apply_crash_policy(&WaitStatus::Exited(Pid::from_raw(1), 1));
        assert_eq!(service.crash_count, 4);
    }

    #[test]
    fn parse_exec_argv_rejects_missing_separator() {
        let argv = vec!["/bin/true".to_string()];
        let err = parse_exec_argv(&argv).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidExecRequest(_)));
    }

    #[test]
    fn parse_exec_argv_rejects_empty_command() {
        let argv = vec!["--".to_string()];
        let err = parse_exec_argv(&argv).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidExecRequest(_)));
    }

    #[test]
    fn parse_exec_argv_splits_positional_prefix() {
        let argv = ["u:r:shell:s0", "shell", "shell", "log", "--", "/bin/true", "-x"]
            .map(str::to_string)
            .to_vec();
        let request = parse_exec_argv(&argv).unwrap();
        assert_eq!(request.seclabel.as_deref(), Some("u:r:shell:s0"));
        assert_eq!(request.uid.as_deref(), Some("shell"));
        assert_eq!(request.gid.as_deref(), Some("shell"));
        assert_eq!(request.supp_gids, vec!["log".to_string()]);
        assert_eq!(request.command, vec!["/bin/true".to_string(), "-x".to_string()]);
    }

    #[test]
    fn parse_exec_argv_rejects_too_many_supplementary_groups() {
        let mut argv = vec!["seclabel".to_string(), "uid".to_string(), "gid".to_string()];
        for i in 0..(crate::config::DEFAULT_MAX_SUPPLEMENTARY_GROUPS + 1) {
            argv.push(format!("group{i}"));
        }
        argv.push("--".to_string());
        argv.push("/bin/true".to_string());
        let err = parse_exec_argv(&argv).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidExecRequest(_)));
    }

    #[test]
    fn make_temporary_oneshot_builds_anonymous_temporary_service() {
        let argv = ["--", "/bin/true"].map(str::to_string).to_vec();
        let service = Service::make_temporary_oneshot(&argv).unwrap();
        assert!(service.flags().contains(ServiceFlags::TEMPORARY));
        assert!(service.flags().contains(ServiceFlags::ONESHOT));
        assert!(service.name.starts_with("exec "));
        assert!(service.name.contains("/bin/true"));
    }

    #[test]
    fn invariant_running_implies_nonzero_pid() {
        let service = service_with_argv(&["/bin/true"]);
        if service.flags().contains(ServiceFlags::RUNNING) {
            assert_ne!(service.pid(), 0);
        }
    }
}

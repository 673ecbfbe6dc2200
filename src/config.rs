//! Configuration loading for the service supervisor and property service.
//!
//! A single YAML document declares every [`ServiceConfig`] plus the property
//! store's initialization sources. Field-level
//! flexibility (e.g. `oom_score_adj: "unset"` vs a bare integer) is handled
//! with custom `Deserialize` visitors, following the same pattern the
//! upstream `LimitValue` type used for `"512M"` / `"unlimited"` / a bare
//! integer.

use crate::error::ConfigError;
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    env, fs,
    path::{Path, PathBuf},
};

/// Default ceiling on supplementary groups accepted for a single service,
/// mirrored by `MakeTemporaryOneshotService` for ad hoc exec services.
pub const DEFAULT_MAX_SUPPLEMENTARY_GROUPS: usize = 32;

/// Top-level configuration document.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Configuration document version.
    pub version: String,
    /// Map of service names to their declared configuration.
    pub services: HashMap<String, ServiceConfig>,
    /// Sources consulted by the Property Store's init sequence.
    #[serde(default)]
    pub properties: PropertyInitConfig,
    /// Root directory from which relative paths (prop files, writepid
    /// files, property_contexts) are resolved.
    pub project_dir: Option<String>,
}

/// Sources feeding the Property Store's initialization sequence.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PropertyInitConfig {
    /// `property_contexts` files, concatenated in the listed order, used to
    /// build the PropertyInfo trie.
    pub contexts_files: Vec<PathBuf>,
    /// `*.prop` files loaded in order; later files override earlier ones
    /// regardless of `ro.` prefix.
    pub prop_files: Vec<PathBuf>,
    /// Directory under which `persist.*` values are mirrored by atomic
    /// rename.
    pub persist_dir: Option<PathBuf>,
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Command and arguments; `argv[0]` is the executable path.
    pub argv: Vec<String>,
    /// Tags grouping this service; defaults to `{"default"}` if empty.
    pub classnames: BTreeSet<String>,
    /// Declared environment variables exported into the child.
    pub env: HashMap<String, String>,
    /// Console device path; if `CONSOLE` is set and this is empty, a
    /// platform default is used.
    pub console_path: Option<PathBuf>,
    /// Explicit SELinux-style security label; if empty, derived from the
    /// executable's file label at Start time.
    pub seclabel: Option<String>,
    /// Namespaces to enter via `unshare`/`clone`.
    #[serde(default)]
    pub namespace_flags: Vec<NamespaceFlag>,
    /// Paths to receive the child pid after fork.
    pub writepid_files: Vec<PathBuf>,
    /// Descriptors (sockets/fifos) created and published into the child
    /// before exec.
    pub descriptors: Vec<DescriptorConfig>,

    /// Target user (name); root if unset.
    pub uid: Option<String>,
    /// Target group (name).
    pub gid: Option<String>,
    /// Supplementary group names, applied before the uid switch.
    pub supp_gids: Vec<String>,
    /// Capability names retained after the uid switch; `None` means "derive
    /// from uid change".
    pub capabilities: Option<Vec<String>>,
    /// `nice` scheduling priority.
    pub priority: Option<i32>,
    /// I/O scheduling class (`none`, `realtime`, `best-effort`, `idle`).
    pub ioprio_class: Option<IoPrioClass>,
    /// I/O scheduling priority within `ioprio_class`.
    pub ioprio_pri: Option<i32>,
    /// OOM score adjustment; sentinel `Unset` means do not write
    /// `/proc/<pid>/oom_score_adj`.
    #[serde(default)]
    pub oom_score_adj: OomScoreAdj,

    /// Resource limit overrides applied via `setrlimit` prior to exec.
    pub limits: Option<LimitsConfig>,
    /// Per-cgroup memory controls.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Flags latched at config-parse time: `disabled`, `rc_disabled`,
    /// `oneshot`, `critical`, `console`.
    #[serde(default)]
    pub disabled: bool,
    /// Set when this service is disabled by the init-script layer rather
    /// than the administrator; distinct from `disabled` per the
    /// `StopOrReset` transition table.
    #[serde(default)]
    pub rc_disabled: bool,
    /// One-shot services auto-disable after their first successful run.
    #[serde(default)]
    pub oneshot: bool,
    /// Crash-looping this service beyond the crash policy threshold is
    /// fatal to the supervisor.
    #[serde(default)]
    pub critical: bool,
    /// Attach a console device to the child.
    #[serde(default)]
    pub console: bool,

    /// Dependencies that must be started first, used only to order the
    /// initial boot-time Start sequence — distinct from the
    /// registry's own `start_order` bookkeeping.
    pub depends_on: Option<Vec<String>>,
    /// Command executed after a successful Reap transitions the service to
    /// `RESTARTING`.
    pub on_restart: Option<Vec<String>>,
}

/// Namespace isolation flags entered via `unshare`/`clone`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceFlag {
    /// New mount namespace.
    Mount,
    /// New network namespace.
    Network,
    /// New PID namespace.
    Pid,
    /// New UTS (hostname/domain) namespace.
    Uts,
    /// New IPC namespace.
    Ipc,
}

/// A descriptor created and published into the child before exec.
/// The created fd is exported as `SVCINIT_FDNAME_<NAME>=<fd>` (the
/// `LISTEN_FDNAMES`-style convention already consumed by
/// [`crate::runtime::capture_socket_activation`]) and left open across the
/// `exec` call so the service can recover it by name.
#[derive(Debug, Deserialize, Clone)]
pub struct DescriptorConfig {
    /// Name used to build the published environment variable.
    pub name: String,
    /// Filesystem path backing the descriptor.
    pub path: PathBuf,
    /// Descriptor kind.
    pub kind: DescriptorKind,
}

/// Kind of descriptor to create and publish.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    /// A named pipe created with `mkfifo` if absent.
    Fifo,
    /// A listening `AF_UNIX` stream socket.
    Socket,
}

/// I/O scheduling class, mirroring the Linux `ioprio_set` class values.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IoPrioClass {
    /// No explicit I/O class.
    None,
    /// Real-time I/O scheduling class.
    Realtime,
    /// Best-effort I/O scheduling class (the kernel default).
    BestEffort,
    /// Idle I/O scheduling class.
    Idle,
}

/// OOM score adjustment, accepting either a bare integer or the literal
/// string `"unset"` meaning "do not write `/proc/<pid>/oom_score_adj`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OomScoreAdj {
    /// Sentinel meaning "unset".
    #[default]
    Unset,
    /// Explicit value in `[-1000, 1000]`.
    Value(i32),
}

impl<'de> Deserialize<'de> for OomScoreAdj {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = OomScoreAdj;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an integer in [-1000, 1000] or the string 'unset'")
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(OomScoreAdj::Value(value as i32))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(OomScoreAdj::Value(value as i32))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value.eq_ignore_ascii_case("unset") {
                    Ok(OomScoreAdj::Unset)
                } else {
                    value
                        .parse::<i32>()
                        .map(OomScoreAdj::Value)
                        .map_err(|_| E::custom(format!("invalid oom_score_adj '{value}'")))
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Resource limit overrides applied via `setrlimit` prior to exec.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of open file descriptors (`RLIMIT_NOFILE`).
    pub nofile: Option<LimitValue>,
    /// Maximum number of processes (`RLIMIT_NPROC`).
    pub nproc: Option<LimitValue>,
    /// Maximum locked memory in bytes (`RLIMIT_MEMLOCK`).
    pub memlock: Option<LimitValue>,
    /// CPU affinity mask specified as CPU indices.
    pub cpu_affinity: Option<Vec<u16>>,
}

/// Value accepted for `setrlimit`-backed configuration entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitValue {
    /// A fixed numeric soft+hard limit.
    Fixed(u64),
    /// Unlimited (maps to `RLIM_INFINITY`).
    Unlimited,
}

impl<'de> Deserialize<'de> for LimitValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct LimitVisitor;

        impl<'de> serde::de::Visitor<'de> for LimitVisitor {
            type Value = LimitValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str(
                    "a non-negative integer, an optional size suffix (e.g. 512M), or 'unlimited'",
                )
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(LimitValue::Fixed(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value.eq_ignore_ascii_case("unlimited") {
                    return Ok(LimitValue::Unlimited);
                }

                parse_size_suffix(value)
                    .map(LimitValue::Fixed)
                    .ok_or_else(|| E::custom(format!("invalid limit value '{value}'")))
            }
        }

        deserializer.deserialize_any(LimitVisitor)
    }
}

fn parse_size_suffix(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('K') | Some('k') => (&value[..value.len() - 1], 1024),
        Some('M') | Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

/// Per-cgroup memory controls applied after a successful spawn.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MemoryConfig {
    /// `memory.swappiness`-equivalent hint.
    pub swappiness: Option<u32>,
    /// Soft memory limit in bytes.
    pub soft_limit_bytes: Option<u64>,
    /// Hard memory limit in bytes.
    pub limit_bytes: Option<u64>,
    /// Hard memory limit as a percentage of total RAM; computed with a
    /// saturating multiplication per.
    pub limit_percent: Option<u8>,
    /// If set, overrides `limit_bytes`/`limit_percent` with the value of a
    /// named property at Start time.
    pub limit_property_name: Option<String>,
}

impl ServiceConfig {
    /// Effective classnames, defaulting to `{"default"}` when unset.
    pub fn effective_classnames(&self) -> BTreeSet<String> {
        if self.classnames.is_empty() {
            BTreeSet::from(["default".to_string()])
        } else {
            self.classnames.clone()
        }
    }

    /// Whether this service belongs to the "updatable" class referenced by
    /// the crash policy and the delayed-services mechanism.
    pub fn is_updatable(&self) -> bool {
        self.classnames.contains("updatable")
    }
}

impl Config {
    /// Returns services ordered so declared dependencies start before
    /// dependents. This only governs the initial boot-time Start sequence
    ///; it is unrelated to the registry's `start_order` counter.
    pub fn service_start_order(&self) -> Result<Vec<String>, ConfigError> {
        let mut indegree: HashMap<String, usize> =
            self.services.keys().map(|name| (name.clone(), 0)).collect();
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();

        for (service, cfg) in &self.services {
            if let Some(deps) = &cfg.depends_on {
                for dep in deps {
                    if !self.services.contains_key(dep) {
                        return Err(ConfigError::UnknownDependency {
                            service: service.clone(),
                            dependency: dep.clone(),
                        });
                    }
                    *indegree.get_mut(service).expect("service must exist") += 1;
                    graph.entry(dep.clone()).or_default().push(service.clone());
                }
            }
        }

        let mut ready: BTreeSet<String> = indegree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(name, _)| name.clone())
            .collect();

        let mut order = Vec::with_capacity(self.services.len());

        while let Some(service) = ready.pop_first() {
            order.push(service.clone());

            if let Some(children) = graph.get(&service) {
                for child in children {
                    if let Some(deg) = indegree.get_mut(child) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(child.clone());
                        }
                    }
                }
            }
        }

        if order.len() != self.services.len() {
            let remaining: Vec<String> = indegree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(name, _)| name)
                .collect();

            return Err(ConfigError::DependencyCycle {
                cycle: remaining.join(" -> "),
            });
        }

        Ok(order)
    }

    fn validate(&self, max_supplementary_groups: usize) -> Result<(), ConfigError> {
        self.service_start_order()?;
        for (name, service) in &self.services {
            if service.supp_gids.len() > max_supplementary_groups {
                return Err(ConfigError::TooManySupplementaryGroups {
                    service: name.clone(),
                    count: service.supp_gids.len(),
                    max: max_supplementary_groups,
                });
            }
        }
        Ok(())
    }
}

/// Expands `${NAME}` / `$NAME` references within a string against the
/// process environment. Distinct from C1 step 9's property-reference
/// expansion (`${name}` / `${name:-default}`), which operates on argv at
/// exec time rather than on the config document at load time.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap();
    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });
    if let Some(var_name) = missing {
        return Err(ConfigError::ConfigReadError(std::io::Error::other(
            format!("missing environment variable: {var_name}"),
        )));
    }
    Ok(result.to_string())
}

/// Loads and parses the configuration document, expanding environment
/// variables and validating the dependency graph and supplementary-group
/// limits.
pub fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with_limit(config_path, DEFAULT_MAX_SUPPLEMENTARY_GROUPS)
}

/// As [`load_config`], but with an explicit supplementary-group ceiling
/// (used by tests and by `MakeTemporaryOneshotService`'s caller).
pub fn load_config_with_limit(
    config_path: Option<&str>,
    max_supplementary_groups: usize,
) -> Result<Config, ConfigError> {
    let config_path = config_path.map(Path::new).unwrap_or_else(|| {
        if Path::new("svcinit.yaml").exists() {
            Path::new("svcinit.yaml")
        } else {
            Path::new("init.yaml")
        }
    });

    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;

    let mut config: Config =
        serde_yaml::from_str(&expanded_content).map_err(ConfigError::ConfigParseError)?;

    let base_path = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    config.project_dir = Some(base_path.to_string_lossy().to_string());

    for (name, service) in &config.services {
        if service.argv.is_empty() {
            return Err(ConfigError::ConfigReadError(std::io::Error::other(
                format!("service '{name}' has empty argv"),
            )));
        }
    }

    config.validate(max_supplementary_groups)?;
    Ok(config)
}

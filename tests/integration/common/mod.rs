#![allow(dead_code)]

use std::{
    env,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use svcinit::{config, constants::PROPERTY_SOCKET_NAME, property::client, runtime, supervisor::Supervisor};

/// Points `HOME` at a scratch directory for the test's lifetime and switches
/// the runtime context into user mode under it, serialized against every
/// other test in the binary that touches process-wide environment state.
pub struct HomeEnvGuard {
    previous: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl HomeEnvGuard {
    pub fn set(home: &Path) -> Self {
        let lock = svcinit::test_utils::env_lock();
        let previous = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }
        runtime::init(runtime::RuntimeMode::User);
        runtime::set_drop_privileges(false);
        Self { previous, _lock: lock }
    }
}

impl Drop for HomeEnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => unsafe {
                env::set_var("HOME", value);
            },
            None => unsafe {
                env::remove_var("HOME");
            },
        }
        runtime::init(runtime::RuntimeMode::User);
        runtime::set_drop_privileges(false);
    }
}

/// Writes a minimal single-service config under `dir` and returns its path.
pub fn write_config(dir: &Path, name: &str, argv: &[&str]) -> PathBuf {
    let path = dir.join("svcinit.yaml");
    let argv_yaml = argv.iter().map(|a| format!("\"{a}\"")).collect::<Vec<_>>().join(", ");
    let content = format!("version: \"1\"\nservices:\n  {name}:\n    argv: [{argv_yaml}]\n");
    std::fs::write(&path, &content).expect("write config");
    path
}

/// Boots a [`Supervisor`] from `config_path` on a background thread and
/// returns the property socket path once it is accepting connections. The
/// supervisor thread outlives the guard; it is reaped when the test binary
/// process exits.
pub fn spawn_supervisor(config_path: &Path) -> PathBuf {
    let config = config::load_config(Some(config_path.to_str().expect("utf8 path")))
        .expect("config should load");
    let mut supervisor = Supervisor::new(config).expect("supervisor should build");
    let socket_path = runtime::socket_dir().join(PROPERTY_SOCKET_NAME);

    thread::spawn(move || {
        let _ = supervisor.run();
    });

    wait_for_socket(&socket_path);
    socket_path
}

pub fn wait_for_socket(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for socket at {path:?}");
}

pub fn wait_for_property(socket_path: &Path, name: &str, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(value)) = client::getprop(socket_path, name)
            && value == expected
        {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for property '{name}' to equal '{expected}'");
        }
        thread::sleep(Duration::from_millis(50));
    }
}
